//! Wires the persona execution orchestrator's components into a single
//! running process: the Worker Pool's axum listener, the Dispatcher, the
//! Event Processor and Trigger Scheduler ticks, and (when configured) the
//! OAuth-style token provider's keep-warm timer.

mod config;

use config::ServerConfig;
use persona_auth::TokenProvider;
use persona_bus::{MessageBus, NoopBus};
use persona_dispatch::Dispatcher;
use persona_events::EventProcessor;
use persona_pool::WorkerPool;
use persona_secret::MasterKey;
use persona_store::{InMemoryStore, PersonaStore};
use persona_triggers::TriggerScheduler;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::from_env()?;
    info!(bind_addr = %config.bind_addr, "loaded boot configuration");
    // `config.team_api_key_hash` is read-but-opaque: CRUD auth is a
    // Non-goal, so `from_env` validates only that it's present.

    let store: Arc<dyn PersonaStore> = Arc::new(InMemoryStore::new());

    let pool = WorkerPool::new(config.worker_token.clone());
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    let pool_router = persona_pool::router(Arc::clone(&pool));
    let pool_server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, pool_router).await {
            warn!(error = %e, "worker pool listener exited");
        }
    });

    if let Some(bus_config) = &config.bus {
        warn!(
            url = %bus_config.url,
            "external message bus configured but its wire protocol is not implemented; using a no-op bus"
        );
    }
    let bus: Arc<dyn MessageBus> = Arc::new(NoopBus::new());
    bus.connect().await;

    let token_provider = config.oauth.as_ref().map(|oauth| {
        info!(refresh_url = %oauth.refresh_url, "OAuth refresh endpoint configured");
        Arc::new(TokenProvider::new(oauth.refresh_url.clone(), oauth.client_id.clone()))
    });
    let keep_warm_handle = token_provider.clone().map(TokenProvider::spawn_keep_warm);

    let master_key = Arc::new(MasterKey::from_bytes(config.master_key));
    let dispatcher = Dispatcher::new(
        Arc::clone(&store),
        Arc::clone(&pool),
        Arc::clone(&bus),
        master_key,
        token_provider,
        config.static_token.clone(),
    );
    let dispatch_event_loop = dispatcher.spawn_pool_event_loop();

    let event_processor = EventProcessor::new(Arc::clone(&store), Arc::clone(&dispatcher));
    let event_tick = event_processor.spawn();

    let trigger_scheduler = TriggerScheduler::new(Arc::clone(&store));
    let trigger_tick = trigger_scheduler.spawn();

    if config.jwt_secret.is_some() {
        info!("JWT secret configured (read for future user-scoped HTTP auth; not consumed by this binary)");
    }

    info!("persona orchestrator running");
    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping");

    pool.shutdown("server shutting down", 5_000).await;
    pool_server.abort();
    dispatch_event_loop.abort();
    event_tick.abort();
    trigger_tick.abort();
    if let Some(handle) = keep_warm_handle {
        handle.abort();
    }
    bus.disconnect().await;

    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
