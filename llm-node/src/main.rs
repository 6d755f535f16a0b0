//! Inference node: discovers and runs local model-serving engines behind an
//! OpenAI-compatible API, syncing its model set from a router.

use std::env;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod api;
mod config;
mod engine;
mod error;
mod gateway;
mod inference;
mod model;
mod resolver;
mod resource;
mod state;
mod storage;
mod sync;

use config::Config;
use engine::{
    EngineRegistry, GptOssCppEngine, LlamaCppEngine, OnnxRuntimeEngine, StableDiffusionEngine,
    WhisperCppEngine,
};
use gateway::{GatewayClient, StatusCollector};
use inference::InferenceEngine;
use model::{ModelManager, ModelManagerConfig};
use node_protocol::Capability;
use resolver::{ModelResolver, NullSyncEventReporter};
use resource::{ResourceMonitor, SystemResourceProvider};
use state::AppState;
use storage::ModelStorage;
use sync::ModelSync;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_version() {
    println!("llm-node {}", VERSION);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        print_version();
        return Ok(());
    }

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().map_err(|e| {
        format!(
            "Failed to load configuration: {}. \
             Make sure config.toml exists or set RUNNER__NODE__ID and RUNNER__NODE__NAME environment variables.",
            e
        )
    })?;
    tracing::info!("starting llm-node: {} ({})", config.node.name, config.node.id);

    let registry = Arc::new(EngineRegistry::new(
        config.engines.plugin_restart_interval_secs,
        config.engines.plugin_restart_request_limit,
    ));

    if let Some(ref c) = config.engines.llama_cpp {
        if c.enabled {
            registry.register_engine(Arc::new(LlamaCppEngine::new(c.clone()))).await?;
            tracing::info!("registered llama_cpp engine: model_dir={}", c.model_dir);
        }
    }
    if let Some(ref c) = config.engines.gptoss_cpp {
        if c.enabled {
            registry.register_engine(Arc::new(GptOssCppEngine::new(c.clone()))).await?;
            tracing::info!("registered gptoss_cpp engine: model_dir={}", c.model_dir);
        }
    }
    if let Some(ref c) = config.engines.whisper_cpp {
        if c.enabled {
            registry.register_engine(Arc::new(WhisperCppEngine::new(c.clone()))).await?;
            tracing::info!("registered whisper_cpp engine: model_dir={}", c.model_dir);
        }
    }
    if let Some(ref c) = config.engines.onnx_runtime {
        if c.enabled {
            registry.register_engine(Arc::new(OnnxRuntimeEngine::new(c.clone()))).await?;
            tracing::info!("registered onnx_runtime engine: model_dir={}", c.model_dir);
        }
    }
    if let Some(ref c) = config.engines.stable_diffusion {
        if c.enabled {
            registry.register_engine(Arc::new(StableDiffusionEngine::new(c.clone()))).await?;
            tracing::info!("registered stable_diffusion engine: model_dir={}", c.model_dir);
        }
    }
    if let Some(ref dir) = config.engines.plugin_dir {
        let loaded = registry.load_plugins(std::path::Path::new(dir)).await?;
        tracing::info!("loaded {} engine plugin(s) from {}", loaded, dir);
    }

    let storage = Arc::new(ModelStorage::new(config.storage.models_dir.clone()));
    let node_token: Arc<RwLock<Option<String>>> = Arc::new(RwLock::new(None));

    let model_sync = if config.sync.enabled {
        let router = config
            .router
            .as_ref()
            .ok_or("model sync is enabled but no [router] section is configured")?;
        Some(Arc::new(ModelSync::with_node_token(
            router.url.clone(),
            router.auth_token.clone(),
            std::path::PathBuf::from(&config.storage.models_dir),
            config.sync.request_timeout_ms,
            node_token.clone(),
        )))
    } else {
        None
    };

    let resolver = Arc::new(ModelResolver::new(storage.clone(), model_sync.clone(), Arc::new(NullSyncEventReporter)));

    let resource_monitor = Arc::new(ResourceMonitor::new(
        Arc::new(SystemResourceProvider::new()),
        config.resources.high_watermark,
        config.resources.sample_interval_secs,
    ));

    let model_manager = Arc::new(ModelManager::new(
        registry.clone(),
        resource_monitor.clone(),
        ModelManagerConfig {
            max_vram_gb: config.resources.max_vram_gb,
            max_memory_bytes: config.resources.max_memory_bytes,
            idle_timeout_secs: config.persistence.idle_timeout_secs,
            max_loaded_models: config.persistence.max_loaded_models,
            always_loaded: config.persistence.always_loaded.clone(),
        },
    ));

    let inference = Arc::new(InferenceEngine::new(resolver.clone(), model_manager.clone()));

    let state = Arc::new(AppState::new(
        config.clone(),
        registry.clone(),
        model_manager.clone(),
        resolver.clone(),
        resource_monitor.clone(),
        inference.clone(),
    ));

    {
        let monitor = resource_monitor.clone();
        let manager = model_manager.clone();
        let watermark_state = state.clone();
        tokio::spawn(async move {
            monitor
                .run(|_max_evictions| {
                    let manager = manager.clone();
                    let state = watermark_state.clone();
                    async move {
                        let active = state.active_request_count();
                        if !manager.evict_lru_under_pressure(active).await {
                            tracing::debug!(
                                "over watermark but nothing evictable (active_requests={})",
                                active
                            );
                        }
                    }
                })
                .await;
        });
    }

    {
        let manager = model_manager.clone();
        let idle_timeout = config.persistence.idle_timeout_secs.max(1);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(idle_timeout));
            loop {
                ticker.tick().await;
                manager.evict_idle().await;
            }
        });
    }

    if let Some(sync) = model_sync.clone() {
        let reporter = Arc::new(NullSyncEventReporter);
        let interval_secs = config.sync.interval_secs.max(1);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
            loop {
                ticker.tick().await;
                match sync.diff().await {
                    Ok(diff) => {
                        for name in &diff.to_download {
                            if let Err(e) = sync.fetch_model(name, reporter.as_ref()).await {
                                tracing::warn!("background sync failed for {}: {}", name, e);
                            }
                        }
                        if !diff.to_delete.is_empty() {
                            tracing::debug!(
                                "{} local model(s) no longer in router catalog, left in place",
                                diff.to_delete.len()
                            );
                        }
                    }
                    Err(e) => tracing::warn!("background sync diff failed: {}", e),
                }
            }
        });
    }

    if let Some(ref router_config) = config.router {
        let capabilities = registry
            .all()
            .await
            .iter()
            .flat_map(|e| e.capabilities().to_vec())
            .collect::<std::collections::HashSet<Capability>>()
            .into_iter()
            .collect::<Vec<_>>();

        let status_collector = Arc::new(StatusCollector::new(
            config.node.id.clone(),
            registry.clone(),
            model_manager.clone(),
            resolver.clone(),
            resource_monitor.clone(),
        ));

        let address = format!("http://{}:{}", config.node.name, config.api.port);
        let client = GatewayClient::new(
            router_config.clone(),
            config.node.id.clone(),
            config.node.name.clone(),
            config.node.machine_type.clone(),
            address,
            capabilities,
            node_token,
            status_collector,
            state.clone(),
        );

        tokio::spawn(async move {
            client.run().await;
        });
        tracing::info!("router client started, connecting to {}", router_config.url);
    } else {
        tracing::info!("no router configured, running in standalone mode");
        state.set_ready(true);
    }

    let app = Router::new()
        .nest("/v1", api::v1_router())
        .merge(api::ollama_router())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("{}:{}", config.api.host, config.api.port);
    tracing::info!("listening on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
