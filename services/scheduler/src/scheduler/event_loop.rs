//! The scheduling loop.
//!
//! A single task consumes the driver's event queue, so offers and status
//! updates are applied in the order the master sent them.

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, error, info, instrument, warn};

use super::engine::Scheduler;
use crate::cluster::SchedulerEvent;
use crate::error::SchedulerError;
use crate::status::FRAMEWORK_SCOPE;

pub struct EventLoop {
    scheduler: Arc<Scheduler>,
    reconcile: Arc<Notify>,
}

impl EventLoop {
    pub fn new(scheduler: Arc<Scheduler>, reconcile: Arc<Notify>) -> Self {
        Self { scheduler, reconcile }
    }

    #[instrument(skip_all)]
    pub async fn run(&self, mut events: mpsc::Receiver<SchedulerEvent>, mut shutdown: watch::Receiver<bool>) {
        info!("Starting scheduling loop");

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => {
                        info!("Event channel closed");
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Scheduling loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    pub async fn handle(&self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::Subscribed { framework_id, .. } => {
                self.scheduler.record_framework_id(&framework_id).await;
                self.reconcile.notify_one();
            }
            SchedulerEvent::Offers(offers) => self.scheduler.handle_offers(offers).await,
            SchedulerEvent::Rescind(offer_id) => debug!(offer_id = %offer_id, "Offer rescinded"),
            SchedulerEvent::Update(status) => self.scheduler.handle_update(status).await,
            SchedulerEvent::Heartbeat => debug!("Heartbeat"),
            SchedulerEvent::Error(message) => {
                error!(message = %message, "Master reported an error");
                self.scheduler.status().record(
                    FRAMEWORK_SCOPE,
                    "subscribe",
                    &SchedulerError::Unspecified(message),
                );
            }
            SchedulerEvent::Disconnected => {
                warn!("Lost connection to the master, scheduling reconcile");
                self.reconcile.notify_one();
            }
        }
    }
}
