//! HTTP client for router registration and heartbeats.
//!
//! Unlike a persistent connection, every call here is a plain request:
//! register once, then heartbeat on a timer, reconnecting (re-registering)
//! whenever a heartbeat fails.

use std::sync::Arc;
use std::time::Duration;

use node_protocol::router::{NodeHealthReport, NodeRegistration, NodeRegistrationResponse};
use node_protocol::Capability;
use reqwest::Client;
use tokio::sync::RwLock;

use crate::config::RouterConfig;
use crate::error::{Error, Result};
use crate::state::AppState;

use super::StatusCollector;

pub struct GatewayClient {
    config: RouterConfig,
    node_id: String,
    node_name: String,
    machine_type: Option<String>,
    address: String,
    capabilities: Vec<Capability>,
    node_token: Arc<RwLock<Option<String>>>,
    status_collector: Arc<StatusCollector>,
    app_state: Arc<AppState>,
    http_client: Client,
}

impl GatewayClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RouterConfig,
        node_id: String,
        node_name: String,
        machine_type: Option<String>,
        address: String,
        capabilities: Vec<Capability>,
        node_token: Arc<RwLock<Option<String>>>,
        status_collector: Arc<StatusCollector>,
        app_state: Arc<AppState>,
    ) -> Self {
        let http_client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            config,
            node_id,
            node_name,
            machine_type,
            address,
            capabilities,
            node_token,
            status_collector,
            app_state,
            http_client,
        }
    }

    /// Runs registration and heartbeating forever, reconnecting on any
    /// failure. Intended to be spawned as a background task.
    pub async fn run(&self) {
        loop {
            tracing::info!("registering with router at {}", self.config.url);

            match self.register().await {
                Ok(()) => {
                    self.app_state.set_ready(true);
                    tracing::info!("registered with router as {}", self.node_id);
                    self.heartbeat_loop().await;
                }
                Err(e) => {
                    tracing::error!("router registration failed: {}", e);
                }
            }

            tracing::info!("reconnecting to router in {}s", self.config.reconnect_delay_secs);
            tokio::time::sleep(Duration::from_secs(self.config.reconnect_delay_secs)).await;
        }
    }

    async fn register(&self) -> Result<()> {
        let registration = NodeRegistration {
            node_id: self.node_id.clone(),
            node_name: self.node_name.clone(),
            machine_type: self.machine_type.clone(),
            address: self.address.clone(),
            capabilities: self.capabilities.clone(),
        };

        let url = format!("{}/v0/nodes", self.config.url);
        let response =
            self.http_client.post(&url).bearer_auth(&self.config.auth_token).json(&registration).send().await?;

        if !response.status().is_success() {
            return Err(Error::Unavailable(format!("node registration rejected: {}", response.status())));
        }

        let body: NodeRegistrationResponse =
            response.json().await.map_err(|e| Error::Internal(format!("malformed registration response: {}", e)))?;
        *self.node_token.write().await = Some(body.node_token);
        Ok(())
    }

    async fn heartbeat_loop(&self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.heartbeat_interval_secs));
        loop {
            ticker.tick().await;
            let report = self.status_collector.collect(self.app_state.active_request_count()).await;
            if let Err(e) = self.send_heartbeat(&report).await {
                tracing::error!("heartbeat failed, re-registering: {}", e);
                return;
            }
        }
    }

    async fn send_heartbeat(&self, report: &NodeHealthReport) -> Result<()> {
        let url = format!("{}/v0/health", self.config.url);
        let mut request = self.http_client.post(&url).bearer_auth(&self.config.auth_token);
        if let Some(token) = self.node_token.read().await.as_ref() {
            request = request.header("X-Node-Token", token);
        }

        let response = request.json(report).send().await?;
        if !response.status().is_success() {
            return Err(Error::Unavailable(format!("heartbeat rejected: {}", response.status())));
        }
        Ok(())
    }
}
