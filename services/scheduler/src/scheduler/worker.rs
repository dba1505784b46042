//! Reconcile background worker.
//!
//! Runs a reconcile pass on a periodic interval and whenever the event
//! loop asks for one (subscription or lost connection).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, instrument};

use super::reconciler::Reconciler;

pub struct ReconcileWorker {
    reconciler: Reconciler,
    interval: Duration,
    trigger: Arc<Notify>,
}

impl ReconcileWorker {
    pub fn new(reconciler: Reconciler, interval: Duration) -> Self {
        Self {
            reconciler,
            interval,
            trigger: Arc::new(Notify::new()),
        }
    }

    /// Handle for requesting an immediate pass.
    pub fn trigger(&self) -> Arc<Notify> {
        Arc::clone(&self.trigger)
    }

    /// Run the worker until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting reconcile worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        // The first pass waits for a subscription trigger.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => self.run_pass("periodic").await,
                _ = self.trigger.notified() => self.run_pass("triggered").await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconcile worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn run_pass(&self, reason: &'static str) {
        match self.reconciler.reconcile_once().await {
            Ok(stats) => debug!(reason, projects = stats.projects, drift = stats.drift(), "Reconcile pass complete"),
            Err(e) => error!(reason, error = %e, "Reconcile pass failed"),
        }

        let reaped = self.reconciler.scheduler().reap_terminal().await;
        if reaped > 0 {
            debug!(reaped, "Reaped terminal tasks");
        }
    }
}
