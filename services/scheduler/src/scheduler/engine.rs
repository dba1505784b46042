//! Scheduler core: compose operations, offer handling and status updates.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mc_id::{validate_project_name, FrameworkId, TaskId};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::locks::ProjectLocks;
use crate::cluster::{ClusterDriver, ClusterTask, TaskStatus};
use crate::compose::{self, ComposeError, ParseOptions, ServiceSpec};
use crate::desired::resolve_all;
use crate::error::SchedulerError;
use crate::offers::{match_offers, OfferDecision};
use crate::status::{StatusBoard, FRAMEWORK_SCOPE};
use crate::store::{ProjectSnapshot, StateStore};
use crate::tasks::{AdoptOutcome, Effects, StatusOutcome, Task, TaskLifecycle};

/// How a compose document is applied to an existing project.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// `PUT`: create or scale the listed services, keep the rest.
    Upsert,
    /// `/update`: the document becomes the project's whole service set.
    Replace,
}

impl ApplyMode {
    fn operation(self) -> &'static str {
        match self {
            Self::Upsert => "apply",
            Self::Replace => "update",
        }
    }
}

/// Outcome of a successful compose operation.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    pub project: String,
    /// Snapshot version after the operation.
    pub version: u64,
    pub created: usize,
    pub terminating: usize,
    pub services: Vec<String>,
}

pub struct Scheduler {
    store: Arc<dyn StateStore>,
    driver: Arc<dyn ClusterDriver>,
    lifecycle: Mutex<TaskLifecycle>,
    locks: ProjectLocks,
    status: StatusBoard,
    options: ParseOptions,
    /// Whether offers are currently suppressed.
    suppressed: AtomicBool,
}

impl Scheduler {
    pub fn new(store: Arc<dyn StateStore>, driver: Arc<dyn ClusterDriver>, options: ParseOptions) -> Self {
        Self {
            store,
            driver,
            lifecycle: Mutex::new(TaskLifecycle::new()),
            locks: ProjectLocks::new(),
            status: StatusBoard::new(),
            options,
            suppressed: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn driver(&self) -> &Arc<dyn ClusterDriver> {
        &self.driver
    }

    pub fn status(&self) -> &StatusBoard {
        &self.status
    }

    pub(crate) fn locks(&self) -> &ProjectLocks {
        &self.locks
    }

    pub(crate) fn lifecycle(&self) -> &Mutex<TaskLifecycle> {
        &self.lifecycle
    }

    /// Load the desired state of every stored project.
    ///
    /// No tasks are created here: the first reconcile pass adopts what the
    /// cluster still runs and only then fills the gaps.
    pub async fn restore(&self) -> Result<usize, SchedulerError> {
        let snapshots = self.store.list().await.map_err(SchedulerError::StoreRead)?;
        let mut lifecycle = self.lifecycle.lock().await;

        let mut restored = 0;
        for snapshot in snapshots {
            match resolve_all(snapshot.services.into_values().collect()) {
                Ok(services) => {
                    lifecycle.set_desired(&snapshot.project, services);
                    restored += 1;
                }
                Err(e) => {
                    warn!(project = %snapshot.project, error = %e, "Skipping unresolvable stored project");
                    self.status.record(&snapshot.project, "restore", &e);
                }
            }
        }

        info!(projects = restored, "Restored desired state");
        Ok(restored)
    }

    /// `PUT /v0/compose/{project}`.
    pub async fn apply_compose(&self, project: &str, body: &[u8]) -> Result<ApplyReport, SchedulerError> {
        self.apply(project, body, ApplyMode::Upsert).await
    }

    /// `PUT /v0/compose/{project}/update`.
    pub async fn update_compose(&self, project: &str, body: &[u8]) -> Result<ApplyReport, SchedulerError> {
        self.apply(project, body, ApplyMode::Replace).await
    }

    #[instrument(skip(self, body), fields(operation = mode.operation()))]
    async fn apply(&self, project: &str, body: &[u8], mode: ApplyMode) -> Result<ApplyReport, SchedulerError> {
        validate_project_name(project).map_err(|e| ComposeError::Malformed(e.to_string()))?;

        // Everything that can be rejected is rejected before any state changes.
        let document = compose::parse(body, &self.options)?;
        let services = resolve_all(document.services)?;

        let _guard = self.locks.lock(project).await;

        let current = self
            .store
            .get(project)
            .await
            .map_err(|e| self.report(project, mode.operation(), SchedulerError::StoreRead(e)))?;

        let mut specs: BTreeMap<String, ServiceSpec> = match (mode, &current) {
            (ApplyMode::Upsert, Some(snapshot)) => snapshot.services.clone(),
            _ => BTreeMap::new(),
        };
        for service in &services {
            specs.insert(service.name().to_string(), service.spec.clone());
        }

        let snapshot = match current {
            Some(snapshot) if snapshot.services == specs && snapshot.compose_version == document.version => snapshot,
            Some(snapshot) => self.persist(snapshot.next(&document.version, specs), mode.operation()).await?,
            None => {
                let fresh = ProjectSnapshot::new(project, &document.version).next(&document.version, specs);
                self.persist(fresh, mode.operation()).await?
            }
        };

        let effects = {
            let mut lifecycle = self.lifecycle.lock().await;
            match mode {
                ApplyMode::Upsert => lifecycle.apply_upsert(project, services),
                ApplyMode::Replace => lifecycle.apply_replace(project, services),
            }
        };
        self.status.clear(project);

        let report = ApplyReport {
            project: project.to_string(),
            version: snapshot.version,
            created: effects.created.len(),
            terminating: effects.stopped(),
            services: snapshot.services.keys().cloned().collect(),
        };
        info!(
            project,
            version = report.version,
            created = report.created,
            terminating = report.terminating,
            "Compose applied"
        );

        self.execute(effects).await;
        Ok(report)
    }

    async fn persist(&self, snapshot: ProjectSnapshot, operation: &str) -> Result<ProjectSnapshot, SchedulerError> {
        match self.store.put(&snapshot).await {
            Ok(()) => Ok(snapshot),
            Err(e) => Err(self.report(&snapshot.project, operation, SchedulerError::StorePersist(e))),
        }
    }

    /// Record an error on the status board and hand it back.
    fn report(&self, scope: &str, operation: &str, error: SchedulerError) -> SchedulerError {
        warn!(scope, operation, error = %error, "Operation failed");
        self.status.record(scope, operation, &error);
        error
    }

    /// `PUT /v0/compose/{project}/{service}/restart`.
    #[instrument(skip(self))]
    pub async fn restart_service(&self, project: &str, service: &str) -> Result<ApplyReport, SchedulerError> {
        let _guard = self.locks.lock(project).await;

        let snapshot = self
            .store
            .get(project)
            .await
            .map_err(SchedulerError::StoreRead)?
            .ok_or_else(|| SchedulerError::not_found("project", project))?;

        let effects = self.lifecycle.lock().await.restart_service(project, service)?;
        let report = ApplyReport {
            project: project.to_string(),
            version: snapshot.version,
            created: effects.created.len(),
            terminating: effects.stopped(),
            services: vec![service.to_string()],
        };
        info!(project, service, terminating = report.terminating, "Service restarted");

        self.execute(effects).await;
        Ok(report)
    }

    /// `DELETE /v0/compose/{project}/{service}`.
    ///
    /// The service leaves the stored snapshot first, then its tasks are
    /// drained. Removing the last service removes the project.
    #[instrument(skip(self))]
    pub async fn kill_service(&self, project: &str, service: &str) -> Result<ApplyReport, SchedulerError> {
        const OPERATION: &str = "kill";
        let _guard = self.locks.lock(project).await;

        let current = self
            .store
            .get(project)
            .await
            .map_err(|e| self.report(project, OPERATION, SchedulerError::StoreRead(e)))?
            .ok_or_else(|| SchedulerError::not_found("project", project))?;
        if !current.services.contains_key(service) {
            return Err(SchedulerError::not_found("service", format!("{project}/{service}")));
        }

        let mut services = current.services.clone();
        services.remove(service);
        let remaining: Vec<String> = services.keys().cloned().collect();
        let version = if services.is_empty() {
            self.store
                .delete(project)
                .await
                .map_err(|e| self.report(project, OPERATION, SchedulerError::StorePersist(e)))?;
            current.version
        } else {
            self.persist(current.next(&current.compose_version, services), OPERATION)
                .await?
                .version
        };

        let effects = self.lifecycle.lock().await.remove_service(project, service);
        let report = ApplyReport {
            project: project.to_string(),
            version,
            created: effects.created.len(),
            terminating: effects.stopped(),
            services: remaining,
        };
        info!(project, service, terminating = report.terminating, "Service removed");

        self.execute(effects).await;
        Ok(report)
    }

    /// `DELETE /v0/compose/{project}/{service}/{task}`.
    ///
    /// `task` is a full task ID or its ULID suffix.
    pub async fn kill_task(&self, project: &str, service: &str, task: &str) -> Result<ApplyReport, SchedulerError> {
        let not_found = || SchedulerError::not_found("task", format!("{project}/{service}/{task}"));
        let id = TaskId::parse(task)
            .or_else(|_| TaskId::parse(&format!("{project}:{service}.{task}")))
            .map_err(|_| not_found())?;
        if id.project() != project || id.service() != service {
            return Err(not_found());
        }
        self.change_task(&id, "kill", TaskLifecycle::kill_task).await
    }

    /// `PUT /v0/tasks/{task}/restart`.
    pub async fn restart_task(&self, task: &str) -> Result<ApplyReport, SchedulerError> {
        let id = TaskId::parse(task).map_err(|_| SchedulerError::not_found("task", task))?;
        self.change_task(&id, "restart", TaskLifecycle::restart_task).await
    }

    #[instrument(skip(self, change), fields(task_id = %id))]
    async fn change_task(
        &self,
        id: &TaskId,
        operation: &str,
        change: fn(&mut TaskLifecycle, &TaskId) -> Result<Effects, SchedulerError>,
    ) -> Result<ApplyReport, SchedulerError> {
        let _guard = self.locks.lock(id.project()).await;

        let version = self
            .store
            .get(id.project())
            .await
            .map_err(SchedulerError::StoreRead)?
            .map_or(0, |snapshot| snapshot.version);

        let effects = change(&mut *self.lifecycle.lock().await, id)?;
        let report = ApplyReport {
            project: id.project().to_string(),
            version,
            created: effects.created.len(),
            terminating: effects.stopped(),
            services: vec![id.service().to_string()],
        };
        info!(operation, created = report.created, "Task changed on request");

        self.execute(effects).await;
        Ok(report)
    }

    /// Send kills and revive offers if new tasks are waiting.
    pub(crate) async fn execute(&self, effects: Effects) {
        for kill in &effects.kills {
            if let Err(e) = self.driver.kill(&kill.task_id, kill.agent_id.as_ref()).await {
                warn!(task_id = %kill.task_id, error = %e, "Failed to send kill");
            }
        }
        if !effects.created.is_empty() {
            self.revive().await;
        }
    }

    async fn revive(&self) {
        match self.driver.revive().await {
            Ok(()) => {
                self.suppressed.store(false, Ordering::SeqCst);
                debug!("Offers revived");
            }
            Err(e) => warn!(error = %e, "Failed to revive offers"),
        }
    }

    /// Resolve a batch of offers: launch what fits, decline the rest.
    #[instrument(skip_all, fields(offers = offers.len()))]
    pub async fn handle_offers(&self, offers: Vec<crate::cluster::Offer>) {
        let decisions = {
            let mut lifecycle = self.lifecycle.lock().await;
            match_offers(&mut lifecycle, offers)
        };

        let mut unused = Vec::new();
        for decision in decisions {
            match decision {
                OfferDecision::Launch { offer, launch } => match self.driver.accept(&offer, &launch).await {
                    Ok(()) => info!(task_id = %launch.task_id, host = %offer.hostname, "Task launched"),
                    Err(e) => {
                        warn!(task_id = %launch.task_id, error = %e, "Launch failed, requeueing task");
                        self.lifecycle.lock().await.requeue(&launch.task_id);
                        unused.push(offer.id);
                    }
                },
                OfferDecision::Decline { offer } => unused.push(offer.id),
            }
        }

        if !unused.is_empty() {
            if let Err(e) = self.driver.decline(&unused).await {
                warn!(error = %e, "Failed to decline offers");
            }
        }

        let pending = self.lifecycle.lock().await.pending_count();
        if pending == 0 && !self.suppressed.swap(true, Ordering::SeqCst) {
            match self.driver.suppress().await {
                Ok(()) => debug!("Offers suppressed"),
                Err(e) => {
                    self.suppressed.store(false, Ordering::SeqCst);
                    warn!(error = %e, "Failed to suppress offers");
                }
            }
        }
    }

    /// Apply a task status update and acknowledge it.
    #[instrument(skip_all, fields(task_id = %status.task_id, state = status.state.as_mesos()))]
    pub async fn handle_update(&self, status: TaskStatus) {
        let effects = {
            let mut lifecycle = self.lifecycle.lock().await;
            let (outcome, effects) = lifecycle.apply_status(&status);
            match outcome {
                StatusOutcome::Applied { from, to } => {
                    debug!(%from, %to, "Status applied");
                    effects
                }
                StatusOutcome::Ignored => effects,
                StatusOutcome::Unknown => Self::adopt_reported(&mut lifecycle, &status),
            }
        };

        self.execute(effects).await;

        if let Err(e) = self.driver.acknowledge(&status).await {
            warn!(error = %e, "Failed to acknowledge status update");
        }
    }

    fn adopt_reported(lifecycle: &mut TaskLifecycle, status: &TaskStatus) -> Effects {
        let reported = ClusterTask {
            task_id: status.task_id.clone(),
            state: status.state,
            agent_id: status.agent_id.clone(),
            hostname: None,
            spec_hash: None,
            resources: None,
        };

        match lifecycle.adopt(&reported) {
            AdoptOutcome::Adopted(id) => lifecycle.converge_project(id.project()),
            AdoptOutcome::Rejected(kill) => {
                warn!("Killing task from an unknown service");
                Effects {
                    kills: vec![kill],
                    ..Effects::default()
                }
            }
            AdoptOutcome::Ignored => Effects::default(),
        }
    }

    /// Persist the framework ID handed out by the master.
    pub async fn record_framework_id(&self, id: &FrameworkId) {
        if let Err(e) = self.store.set_framework_id(id).await {
            self.report(FRAMEWORK_SCOPE, "subscribe", SchedulerError::StorePersist(e));
        }
    }

    /// Snapshot of the task table, ordered by project, service and age.
    pub async fn tasks(&self) -> Vec<Task> {
        let lifecycle = self.lifecycle.lock().await;
        let mut tasks: Vec<Task> = lifecycle.table().iter().cloned().collect();
        tasks.sort_by(|a, b| {
            (a.project(), a.service_name(), a.seq).cmp(&(b.project(), b.service_name(), b.seq))
        });
        tasks
    }

    pub async fn reap_terminal(&self) -> usize {
        self.lifecycle.lock().await.reap_terminal()
    }
}
