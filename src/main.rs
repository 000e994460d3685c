mod api;
mod bootstrap;
mod connection;
mod control_plane;
mod core;
mod db;
mod decoder;
mod dispatcher;
mod evaluator;
mod exchange;
mod feed_manager;
mod plans;
mod registry;
mod store;
mod tick_queue;

use crate::connection::session::{SessionIssuer, StaticSessionIssuer};
use crate::control_plane::ControlPlane;
use crate::core::{AppConfig, AppError, AppState};
use crate::db::Db;
use crate::dispatcher::TickDispatcher;
use crate::evaluator::{OrderPlanEvaluator, PlanStore};
use crate::feed_manager::FeedManager;
use crate::plans::PostgresPlanStore;
use crate::registry::SubscriptionRegistry;
use crate::store::{EventBus, KvStore, LatestPriceStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Wires the Config & Bootstrap graph (C10, spec §4.10): `AppConfig` from the
/// environment, the `Db`/KV/Registry/FeedManager graph, startup health
/// checks, the tracing subscriber, and graceful shutdown on SIGINT/SIGTERM.
#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    install_tracing();

    let config = Arc::new(AppConfig::from_env()?);
    let db = Arc::new(Db::connect(&config.database_url).await?);
    let kv = Arc::new(KvStore::connect(&config).await?);
    let registry = Arc::new(SubscriptionRegistry::new());

    let plan_store: Arc<dyn PlanStore> = Arc::new(PostgresPlanStore::new(db.clone()));
    let price_store: Arc<dyn LatestPriceStore> = kv.clone();
    let bus: Arc<dyn EventBus> = kv.clone();
    // The vendor login/TOTP flow that actually mints a JWT/feed-token pair is
    // an external collaborator (spec §1); `StaticSessionIssuer` is the
    // development/test stand-in documented on the trait itself.
    let session_issuer: Arc<dyn SessionIssuer> = Arc::new(StaticSessionIssuer::from_config(&config)?);

    let evaluator = Arc::new(OrderPlanEvaluator::new(plan_store.clone(), bus.clone(), registry.clone()));
    let dispatcher = Arc::new(TickDispatcher::new(price_store, bus.clone(), registry.clone(), evaluator));

    let cancel = CancellationToken::new();
    let (feed_manager, mutations_tx, feed_health, mut task_handles) = FeedManager::new(
        config.clone(),
        session_issuer,
        registry.clone(),
        plan_store.clone(),
        dispatcher,
        cancel.clone(),
    );

    let state = AppState {
        config: config.clone(),
        db: db.clone(),
        kv: kv.clone(),
        registry: registry.clone(),
        feed_health,
    };

    bootstrap::initialize_on_startup(&state).await?;

    // Bind every currently-active order plan into the Registry before either
    // Connection has reached READY, so the first Ready transition flushes a
    // complete batched subscribe (§4.4 "Initial fill").
    feed_manager.initial_fill().await;
    task_handles.push(feed_manager.spawn());
    task_handles.push(ControlPlane::new(bus, plan_store, mutations_tx, cancel.clone()).spawn());

    let addr: std::net::SocketAddr = state
        .config
        .server_addr
        .parse()
        .map_err(|e| AppError::Config(format!("invalid SERVER_ADDR: {e}")))?;

    let app = api::router(state);
    info!(%addr, "listening");

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| AppError::Config(e.to_string()))?;

    cancel.cancel();
    if tokio::time::timeout(Duration::from_secs(10), await_all(task_handles)).await.is_err() {
        warn!("shutdown timed out after 10s waiting for tasks to drain; exiting anyway");
    }
    Ok(())
}

/// Awaits every spawned Connection, tick worker, and control-loop task so
/// they get scheduler time to finish draining before the runtime tears down
/// (§5 "Cancellation"). Bounded by a timeout at the call site so a stuck
/// task cannot block shutdown forever.
async fn await_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "task panicked during shutdown");
        }
    }
}

fn install_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();
}

/// Waits for SIGINT or SIGTERM so Connections and control loops get a chance
/// to drain cleanly instead of being killed mid-frame (§5 "Cancellation").
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
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
