//! Shared subprocess lifecycle helper for engines that front a long-lived
//! HTTP server per loaded model (llama.cpp, gpt-oss). One `ProcessPool`
//! holds every running server for a single engine instance; each server is
//! reached over loopback HTTP once it reports ready.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Client;
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::sync::{RwLock, Semaphore};

use crate::error::{Error, Result};

const HEALTH_CHECK_INTERVAL_MS: u64 = 200;
const SERVER_STARTING_POLL_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Ready,
    Unhealthy,
    ShuttingDown,
}

/// Parameters for spawning one model's server process.
pub struct SpawnSpec {
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub port: u16,
    pub log_output: bool,
}

pub struct ServerInstance {
    pub model_id: String,
    pub port: u16,
    pub memory_gb: f32,
    state: RwLock<ServerState>,
    process: RwLock<Option<Child>>,
    last_used: RwLock<Instant>,
}

impl ServerInstance {
    fn new(model_id: String, port: u16, memory_gb: f32, process: Child) -> Self {
        Self {
            model_id,
            port,
            memory_gb,
            state: RwLock::new(ServerState::Starting),
            process: RwLock::new(Some(process)),
            last_used: RwLock::new(Instant::now()),
        }
    }

    pub async fn state(&self) -> ServerState {
        *self.state.read().await
    }

    pub async fn set_state(&self, state: ServerState) {
        *self.state.write().await = state;
    }

    pub async fn touch(&self) {
        *self.last_used.write().await = Instant::now();
    }

    pub async fn last_used(&self) -> Instant {
        *self.last_used.read().await
    }

    pub async fn is_process_alive(&self) -> bool {
        let mut process = self.process.write().await;
        match process.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub async fn terminate(&self, timeout_secs: u64) {
        self.set_state(ServerState::ShuttingDown).await;

        let mut process_guard = self.process.write().await;
        if let Some(mut child) = process_guard.take() {
            #[cfg(unix)]
            {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;

                if let Some(pid) = child.id() {
                    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                }
            }

            let wait_result = tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait()).await;

            match wait_result {
                Ok(Ok(status)) => {
                    tracing::debug!("server for {} exited with {}", self.model_id, status);
                }
                Ok(Err(e)) => {
                    tracing::warn!("error waiting for server {}: {}", self.model_id, e);
                }
                Err(_timeout) => {
                    tracing::warn!("server {} didn't stop gracefully, killing", self.model_id);
                    let _ = child.kill().await;
                }
            }
        }

        self.set_state(ServerState::Stopped).await;
    }
}

/// A pool of subprocess-managed servers, one per loaded model, shared by a
/// single engine instance.
pub struct ProcessPool {
    http_client: Client,
    servers: RwLock<HashMap<String, Arc<ServerInstance>>>,
    startup_semaphore: Semaphore,
    base_port: Option<u16>,
    port_search_range: u16,
}

impl ProcessPool {
    pub fn new(base_port: Option<u16>, port_search_range: u16) -> Self {
        Self {
            http_client: Client::new(),
            servers: RwLock::new(HashMap::new()),
            startup_semaphore: Semaphore::new(1),
            base_port,
            port_search_range: port_search_range.max(1),
        }
    }

    pub async fn get(&self, model_id: &str) -> Option<Arc<ServerInstance>> {
        self.servers.read().await.get(model_id).cloned()
    }

    pub async fn loaded_ready_ids(&self) -> Vec<String> {
        let servers = self.servers.read().await;
        let mut ids = Vec::new();
        for (id, instance) in servers.iter() {
            if instance.state().await == ServerState::Ready {
                ids.push(id.clone());
            }
        }
        ids
    }

    pub async fn used_memory_gb(&self) -> f32 {
        let servers = self.servers.read().await;
        let mut total = 0.0;
        for instance in servers.values() {
            let state = instance.state().await;
            if state != ServerState::ShuttingDown && state != ServerState::Stopped {
                total += instance.memory_gb;
            }
        }
        total
    }

    pub async fn running_count(&self) -> usize {
        let servers = self.servers.read().await;
        let mut count = 0;
        for instance in servers.values() {
            let state = instance.state().await;
            if state != ServerState::ShuttingDown && state != ServerState::Stopped {
                count += 1;
            }
        }
        count
    }

    /// Find the least-recently-used evictable server, excluding one model id.
    pub async fn find_lru(&self, exclude_model: &str) -> Option<(String, f32)> {
        let servers = self.servers.read().await;
        let mut oldest: Option<(String, f32, Instant)> = None;

        for (model_id, instance) in servers.iter() {
            if model_id == exclude_model {
                continue;
            }
            let state = instance.state().await;
            if state == ServerState::ShuttingDown || state == ServerState::Starting {
                continue;
            }
            let last_used = instance.last_used().await;
            match &oldest {
                None => oldest = Some((model_id.clone(), instance.memory_gb, last_used)),
                Some((_, _, oldest_time)) if last_used < *oldest_time => {
                    oldest = Some((model_id.clone(), instance.memory_gb, last_used));
                }
                _ => {}
            }
        }

        oldest.map(|(id, mem, _)| (id, mem))
    }

    pub async fn allocate_port(&self) -> Result<u16> {
        if let Some(base) = self.base_port {
            let servers = self.servers.read().await;
            let used: HashSet<u16> = servers.values().map(|s| s.port).collect();
            for offset in 0..self.port_search_range {
                let port = base.saturating_add(offset);
                if !used.contains(&port) {
                    return Ok(port);
                }
            }
            Err(Error::Internal(format!(
                "no available ports in range {}-{}",
                base,
                base.saturating_add(self.port_search_range)
            )))
        } else {
            let listener = TcpListener::bind("127.0.0.1:0")
                .await
                .map_err(|e| Error::Internal(format!("failed to bind for port allocation: {}", e)))?;
            let port = listener
                .local_addr()
                .map_err(|e| Error::Internal(format!("failed to get local addr: {}", e)))?
                .port();
            drop(listener);
            Ok(port)
        }
    }

    async fn wait_for_ready(
        &self,
        instance: &ServerInstance,
        startup_timeout_secs: u64,
        health_path: &str,
    ) -> Result<()> {
        let timeout = Duration::from_secs(startup_timeout_secs);
        let start = Instant::now();
        let health_url = format!("http://127.0.0.1:{}{}", instance.port, health_path);

        loop {
            if start.elapsed() > timeout {
                return Err(Error::Timeout(format!(
                    "server startup timeout for {} after {:?}",
                    instance.model_id,
                    start.elapsed()
                )));
            }

            if !instance.is_process_alive().await {
                return Err(Error::Unavailable(format!(
                    "server process died during startup for {}",
                    instance.model_id
                )));
            }

            if let Ok(resp) = self.http_client.get(&health_url).send().await {
                if resp.status().is_success() {
                    instance.set_state(ServerState::Ready).await;
                    tracing::info!(
                        "server ready for {} on port {} ({:?})",
                        instance.model_id,
                        instance.port,
                        start.elapsed()
                    );
                    return Ok(());
                }
            }

            tokio::time::sleep(Duration::from_millis(HEALTH_CHECK_INTERVAL_MS)).await;
        }
    }

    /// Spawn and wait for a new server to become ready.
    async fn start_server(
        &self,
        model_id: &str,
        memory_gb: f32,
        spec: SpawnSpec,
        startup_timeout_secs: u64,
        health_path: &str,
    ) -> Result<Arc<ServerInstance>> {
        let mut cmd = Command::new(&spec.binary);
        for arg in &spec.args {
            cmd.arg(arg);
        }
        cmd.stdin(Stdio::null()).kill_on_drop(true);

        if spec.log_output {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let process = cmd.spawn().map_err(|e| {
            Error::Unavailable(format!(
                "failed to spawn server for {}: {}. binary: {}",
                model_id,
                e,
                spec.binary.display()
            ))
        })?;

        tracing::info!(
            "spawned server for {} on port {} (pid: {:?}, memory: {:.2}GB)",
            model_id,
            spec.port,
            process.id(),
            memory_gb
        );

        let instance = Arc::new(ServerInstance::new(
            model_id.to_string(),
            spec.port,
            memory_gb,
            process,
        ));

        if let Err(e) = self
            .wait_for_ready(&instance, startup_timeout_secs, health_path)
            .await
        {
            instance.terminate(10).await;
            return Err(e);
        }

        Ok(instance)
    }

    /// Get or start a server for a model, via single-flight double-checked
    /// locking: the startup semaphore lets only one task spawn a process at
    /// a time, while other callers wait on the `Starting` state to resolve.
    pub async fn ensure_server<F>(
        &self,
        model_id: &str,
        memory_gb: f32,
        startup_timeout_secs: u64,
        health_path: &str,
        spawn_spec: F,
    ) -> Result<Arc<ServerInstance>>
    where
        F: FnOnce(u16) -> Result<SpawnSpec>,
    {
        loop {
            let servers = self.servers.read().await;
            if let Some(instance) = servers.get(model_id) {
                let state = instance.state().await;
                if state == ServerState::Ready {
                    instance.touch().await;
                    return Ok(instance.clone());
                } else if state == ServerState::Starting {
                    drop(servers);
                    tokio::time::sleep(Duration::from_millis(SERVER_STARTING_POLL_MS)).await;
                    continue;
                }
            }
            break;
        }

        let _permit = self
            .startup_semaphore
            .acquire()
            .await
            .map_err(|e| Error::Internal(format!("semaphore error: {}", e)))?;

        {
            let servers = self.servers.read().await;
            if let Some(instance) = servers.get(model_id) {
                if instance.state().await == ServerState::Ready {
                    instance.touch().await;
                    return Ok(instance.clone());
                }
            }
        }

        {
            let mut servers = self.servers.write().await;
            if let Some(old) = servers.remove(model_id) {
                old.terminate(10).await;
            }
        }

        let port = self.allocate_port().await?;
        let spec = spawn_spec(port)?;
        let instance = self
            .start_server(model_id, memory_gb, spec, startup_timeout_secs, health_path)
            .await?;

        self.servers
            .write()
            .await
            .insert(model_id.to_string(), instance.clone());

        Ok(instance)
    }

    pub async fn stop(&self, model_id: &str, shutdown_timeout_secs: u64) {
        let instance = {
            let mut servers = self.servers.write().await;
            servers.remove(model_id)
        };
        if let Some(instance) = instance {
            instance.terminate(shutdown_timeout_secs).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_port_allocation_with_base_port() {
        let pool = ProcessPool::new(Some(9100), 50);
        let port = pool.allocate_port().await.unwrap();
        assert_eq!(port, 9100);
    }

    #[tokio::test]
    async fn test_port_allocation_dynamic() {
        let pool = ProcessPool::new(None, 1);
        let port = pool.allocate_port().await.unwrap();
        assert!(port > 0);
    }

    #[tokio::test]
    async fn test_used_memory_empty_pool() {
        let pool = ProcessPool::new(None, 1);
        assert_eq!(pool.used_memory_gb().await, 0.0);
        assert_eq!(pool.running_count().await, 0);
    }

    #[tokio::test]
    async fn test_find_lru_empty_pool() {
        let pool = ProcessPool::new(None, 1);
        assert!(pool.find_lru("anything").await.is_none());
    }
}
