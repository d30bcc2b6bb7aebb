//! BuildIt API Server
//!
//! Serves the submission API and runs the lease monitor and notification
//! relay for the fleet.

use anyhow::Context;
use buildit_api::{AppState, routes};
use buildit_config::{NotifyConfig, SystemConfig, load_system_config};
use buildit_core::payload::BuildRequestSchema;
use buildit_core::{JobQueue, JobStore, Notifier, SystemClock};
use buildit_db::{MemoryJobQueue, MemoryJobStore, StoreSettings};
use buildit_scheduler::{
    Dispatcher, LeaseMonitor, LogNotifier, NotificationRelay, WebhookNotifier,
    install_shutdown_handler,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "buildit-server")]
#[command(about = "BuildIt job dispatch server", long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(long, env = "BUILDIT_CONFIG", default_value = "buildit.kdl")]
    config: PathBuf,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn open_store(config: &SystemConfig) -> anyhow::Result<(Arc<dyn JobStore>, Arc<dyn JobQueue>)> {
    let settings = StoreSettings::new(config.targets.clone(), config.lease.max_attempts);
    match &config.store_url {
        Some(url) => {
            info!("Connecting to database...");
            let (store, queue) = buildit_db::connect(url, settings)
                .await
                .context("failed to open job store")?;
            info!("Database connected");
            let store: Arc<dyn JobStore> = store;
            let queue: Arc<dyn JobQueue> = queue;
            Ok((store, queue))
        }
        None => {
            warn!("No store configured, using the in-process store; remote workers cannot connect");
            let store: Arc<dyn JobStore> =
                Arc::new(MemoryJobStore::new(settings, Arc::new(SystemClock)));
            let queue: Arc<dyn JobQueue> = Arc::new(MemoryJobQueue::new());
            Ok((store, queue))
        }
    }
}

fn notifiers(config: &NotifyConfig) -> anyhow::Result<Vec<Arc<dyn Notifier>>> {
    let mut notifiers: Vec<Arc<dyn Notifier>> = Vec::new();
    if config.log {
        notifiers.push(Arc::new(LogNotifier));
    }
    for webhook in &config.webhooks {
        let notifier = WebhookNotifier::new(webhook.url.clone(), webhook.secret.clone())
            .with_context(|| format!("failed to set up webhook {}", webhook.url))?;
        notifiers.push(Arc::new(notifier));
    }
    Ok(notifiers)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let mut config = load_system_config(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    config.apply_env();

    let (store, queue) = open_store(&config).await?;
    let shutdown = install_shutdown_handler();

    let monitor = LeaseMonitor::new(store.clone(), queue.clone(), config.lease.scan_interval);
    let monitor_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { monitor.run(shutdown).await }
    });

    let relay = NotificationRelay::new(store.clone(), notifiers(&config.notify)?);
    let relay_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { relay.run(shutdown).await }
    });

    let dispatcher = Dispatcher::new(store, queue, config.targets.clone())
        .with_schema(Arc::new(BuildRequestSchema))
        .with_worker_offline_after(config.api.worker_offline_after);
    if config.api.token.is_none() {
        warn!("No API token configured, submissions are unauthenticated");
    }
    let state = AppState::new(Arc::new(dispatcher)).with_token(config.api.token.clone());

    // Build router
    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // Start server
    let addr = config.api.listen;
    info!("Starting server on {}", addr);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    // The server only returns once shutdown was requested.
    shutdown.cancel();
    let _ = tokio::join!(monitor_task, relay_task);
    info!("Server stopped");

    Ok(())
}
