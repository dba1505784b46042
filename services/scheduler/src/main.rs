//! mesos-compose scheduler
//!
//! Accepts compose documents over HTTP and runs their services as tasks on
//! an Apache Mesos cluster.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use mc_scheduler::{
    api,
    cluster::mesos::MesosDriver,
    config,
    scheduler::{EventLoop, ReconcileWorker, Reconciler, Scheduler},
    state::AppState,
    store::{SqliteStore, StateStore},
};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const EVENT_QUEUE_DEPTH: usize = 1024;

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to MC_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting mesos-compose scheduler");
    info!(
        listen_addr = %config.listen_addr,
        master = %config.mesos.master,
        store = %config.store_path.display(),
        "Configuration loaded"
    );

    let store = match SqliteStore::open(&config.store_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "Failed to open state store");
            return Err(e.into());
        }
    };

    let driver = Arc::new(MesosDriver::new(config.mesos.clone()).context("failed to create Mesos client")?);
    let framework_id = store.framework_id().await.context("failed to read framework ID")?;
    if let Some(id) = &framework_id {
        info!(framework_id = %id, "Resuming framework");
    }
    driver.set_framework_id(framework_id).await;

    let scheduler = Arc::new(Scheduler::new(store, driver.clone(), config.defaults));
    scheduler.restore().await.context("failed to restore desired state")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

    let reconcile_worker = ReconcileWorker::new(
        Reconciler::new(scheduler.clone(), config.reconcile_max_retries),
        config.reconcile_interval,
    );
    let event_loop = EventLoop::new(scheduler.clone(), reconcile_worker.trigger());

    // Mesos subscription
    let driver_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        let driver = driver.clone();
        async move {
            driver.run(events_tx, shutdown_rx).await;
        }
    });

    // Scheduling loop
    let event_loop_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            event_loop.run(events_rx, shutdown_rx).await;
        }
    });

    // Reconcile worker
    let reconcile_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            reconcile_worker.run(shutdown_rx).await;
        }
    });

    let app = api::create_router(AppState::new(scheduler));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = Duration::from_secs(10);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, driver_handle).await {
        warn!(error = %e, "Mesos subscription did not shut down in time");
    }

    if let Err(e) = tokio::time::timeout(shutdown_timeout, event_loop_handle).await {
        warn!(error = %e, "Scheduling loop did not shut down in time");
    }

    if let Err(e) = tokio::time::timeout(shutdown_timeout, reconcile_handle).await {
        warn!(error = %e, "Reconcile worker did not shut down in time");
    }

    info!("Scheduler shutdown complete");
    Ok(())
}
