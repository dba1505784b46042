//! Reconciler: brings the task table back in line with the cluster.
//!
//! The cluster is the source of truth for liveness and the store is the
//! source of truth for intent. One pass:
//! - Lists the framework's tasks on the cluster, with bounded retries
//! - Reloads each project's snapshot under the project lock
//! - Leaves alone tasks that changed after the listing was taken
//! - Adopts unknown tasks, fails missing ones and lets the cluster win
//!   state disagreements
//! - Converges every project to its snapshot
//! - Asks the master for an implicit reconciliation

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use mc_id::TaskId;
use mc_reconcile::{RetryTracker, DEFAULT_RETRY_WINDOW};
use serde::Serialize;
use tracing::{info, instrument, warn};

use super::engine::Scheduler;
use crate::cluster::ClusterTask;
use crate::desired::resolve_all;
use crate::error::SchedulerError;
use crate::status::FRAMEWORK_SCOPE;
use crate::tasks::{Effects, KillRequest};

const LIST_TASKS_KEY: &str = "cluster.list_tasks";
const DEFAULT_BACKOFF: Duration = Duration::from_secs(2);

/// Statistics from one reconcile pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub projects: usize,
    pub adopted: usize,
    pub rejected: usize,
    pub missing: usize,
    pub corrected: usize,
    pub created: usize,
    pub terminating: usize,
}

impl ReconcileStats {
    pub fn drift(&self) -> usize {
        self.adopted + self.rejected + self.missing + self.corrected
    }
}

pub struct Reconciler {
    scheduler: Arc<Scheduler>,
    retries: Mutex<RetryTracker>,
    backoff: Duration,
}

impl Reconciler {
    pub fn new(scheduler: Arc<Scheduler>, max_retries: u32) -> Self {
        Self {
            scheduler,
            retries: Mutex::new(RetryTracker::new(max_retries, DEFAULT_RETRY_WINDOW)),
            backoff: DEFAULT_BACKOFF,
        }
    }

    /// Delay between task listing attempts.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    fn retries(&self) -> std::sync::MutexGuard<'_, RetryTracker> {
        self.retries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run a single reconcile pass.
    ///
    /// On a listing failure past the retry budget the error is recorded on
    /// the status board and no task state is touched.
    #[instrument(skip(self))]
    pub async fn reconcile_once(&self) -> Result<ReconcileStats, SchedulerError> {
        let (reported, listed_at) = self.fetch_tasks().await?;

        let mut by_project: BTreeMap<String, Vec<ClusterTask>> = BTreeMap::new();
        let mut strays = Effects::default();
        for task in reported {
            match TaskId::parse(&task.task_id) {
                Ok(id) => by_project.entry(id.project().to_string()).or_default().push(task),
                Err(_) if task.state.is_terminal() => {}
                Err(_) => {
                    warn!(task_id = %task.task_id, "Cluster task does not belong to any project");
                    strays.kills.push(KillRequest {
                        task_id: task.task_id,
                        agent_id: task.agent_id,
                    });
                }
            }
        }

        let store = self.scheduler.store();
        let mut projects: BTreeSet<String> = store
            .list()
            .await
            .map_err(|e| self.fail("reconcile", SchedulerError::StoreRead(e)))?
            .into_iter()
            .map(|snapshot| snapshot.project)
            .collect();
        projects.extend(self.scheduler.lifecycle().lock().await.projects());
        projects.extend(by_project.keys().cloned());

        let mut stats = ReconcileStats {
            rejected: strays.kills.len(),
            ..ReconcileStats::default()
        };
        for project in projects {
            let reported = by_project.remove(&project).unwrap_or_default();
            match self.reconcile_project(&project, &reported, listed_at, &mut stats).await {
                Ok(()) => stats.projects += 1,
                Err(e) => {
                    warn!(project = %project, error = %e, "Project reconcile failed");
                    self.scheduler.status().record(&project, "reconcile", &e);
                }
            }
        }

        self.scheduler.execute(strays).await;

        if let Err(e) = self.scheduler.driver().reconcile_implicit().await {
            warn!(error = %e, "Implicit reconciliation request failed");
        }

        self.scheduler.status().clear(FRAMEWORK_SCOPE);
        if stats.drift() > 0 {
            info!(
                projects = stats.projects,
                adopted = stats.adopted,
                rejected = stats.rejected,
                missing = stats.missing,
                corrected = stats.corrected,
                "Reconciled drift"
            );
        }
        Ok(stats)
    }

    async fn reconcile_project(
        &self,
        project: &str,
        reported: &[ClusterTask],
        listed_at: DateTime<Utc>,
        stats: &mut ReconcileStats,
    ) -> Result<(), SchedulerError> {
        let _guard = self.scheduler.locks().lock(project).await;

        // Read under the lock so a concurrent apply is either fully in or out.
        let services = match self
            .scheduler
            .store()
            .get(project)
            .await
            .map_err(SchedulerError::StoreRead)?
        {
            Some(snapshot) => resolve_all(snapshot.services.into_values().collect())?,
            None => Vec::new(),
        };

        let effects = {
            let mut lifecycle = self.scheduler.lifecycle().lock().await;
            lifecycle.set_desired(project, services);
            let (effects, drift) = lifecycle.reconcile_project(project, reported, listed_at);
            stats.adopted += drift.adopted;
            stats.rejected += drift.rejected;
            stats.missing += drift.missing;
            stats.corrected += drift.corrected;
            effects
        };
        stats.created += effects.created.len();
        stats.terminating += effects.kills.len();

        self.scheduler.execute(effects).await;
        Ok(())
    }

    /// List the framework's tasks, along with when the listing was requested.
    async fn fetch_tasks(&self) -> Result<(Vec<ClusterTask>, DateTime<Utc>), SchedulerError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let listed_at = Utc::now();
            match self.scheduler.driver().list_tasks().await {
                Ok(tasks) => {
                    self.retries().clear(LIST_TASKS_KEY);
                    return Ok((tasks, listed_at));
                }
                Err(e) => {
                    let exhausted = self.retries().record_failure(LIST_TASKS_KEY);
                    if exhausted {
                        self.retries().clear(LIST_TASKS_KEY);
                        return Err(self.fail(
                            "reconcile",
                            SchedulerError::Reconcile(format!(
                                "listing cluster tasks failed after {attempt} attempts: {e}"
                            )),
                        ));
                    }
                    warn!(attempt, error = %e, "Listing cluster tasks failed, retrying");
                    tokio::time::sleep(self.backoff).await;
                }
            }
        }
    }

    fn fail(&self, operation: &str, error: SchedulerError) -> SchedulerError {
        self.scheduler.status().record(FRAMEWORK_SCOPE, operation, &error);
        error
    }
}
