//! Task lifecycle manager.
//!
//! Owns the task table and the desired service set. Every method is
//! synchronous and returns the side effects the caller must carry out
//! (kills to send, whether new tasks need offers), so the state can be
//! driven and inspected without a cluster.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use mc_id::{AgentId, TaskId};
use mc_reconcile::{classify_tasks, select_for_drain, SpecHash};
use tracing::{debug, info, warn};

use super::state::TaskState;
use super::table::{Task, TaskTable};
use crate::cluster::{ClusterTask, ClusterTaskState, ExitKind, LaunchSpec, Offer, TaskStatus};
use crate::compose::RestartPolicy;
use crate::desired::ResolvedService;
use crate::error::SchedulerError;

/// A kill the caller must send to the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillRequest {
    pub task_id: String,
    pub agent_id: Option<AgentId>,
}

/// Side effects of a lifecycle mutation.
#[derive(Debug, Default)]
pub struct Effects {
    /// New pending tasks; offers are needed.
    pub created: Vec<TaskId>,
    pub kills: Vec<KillRequest>,
    /// Tasks that went straight to `Terminated` without a kill.
    pub terminated: Vec<TaskId>,
    pub failed: Vec<TaskId>,
}

impl Effects {
    pub fn merge(&mut self, other: Effects) {
        self.created.extend(other.created);
        self.kills.extend(other.kills);
        self.terminated.extend(other.terminated);
        self.failed.extend(other.failed);
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.kills.is_empty() && self.terminated.is_empty() && self.failed.is_empty()
    }

    /// Tasks moved out of service, with or without a kill.
    pub fn stopped(&self) -> usize {
        self.kills.len() + self.terminated.len()
    }
}

/// Result of applying a status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusOutcome {
    Applied { from: TaskState, to: TaskState },
    /// Known task, nothing to change.
    Ignored,
    /// The task is not in the table.
    Unknown,
}

/// Result of offering an unknown cluster task for adoption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdoptOutcome {
    Adopted(TaskId),
    /// Not attributable to a desired service; it must be killed.
    Rejected(KillRequest),
    /// Already ended on the cluster.
    Ignored,
}

/// Counts from reconciling one project.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProjectDrift {
    pub adopted: usize,
    pub rejected: usize,
    pub missing: usize,
    pub corrected: usize,
}

#[derive(Debug, Clone)]
struct DesiredService {
    service: Arc<ResolvedService>,
    /// Replicas that ended and were deliberately not replaced.
    retired: u32,
}

impl DesiredService {
    fn target(&self) -> usize {
        self.service.scale().saturating_sub(self.retired) as usize
    }
}

/// Whether a task that ended with `exit` should be replaced.
pub fn should_restart(policy: RestartPolicy, exit: ExitKind) -> bool {
    match policy {
        RestartPolicy::Always => true,
        RestartPolicy::UnlessStopped => exit != ExitKind::Finished,
        RestartPolicy::OnFailure => exit == ExitKind::Failed,
        RestartPolicy::No => false,
    }
}

#[derive(Debug, Default)]
pub struct TaskLifecycle {
    table: TaskTable,
    desired: BTreeMap<String, BTreeMap<String, DesiredService>>,
}

impl TaskLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing table.
    pub fn with_table(table: TaskTable) -> Self {
        Self {
            table,
            desired: BTreeMap::new(),
        }
    }

    pub fn table(&self) -> &TaskTable {
        &self.table
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.table.get(id)
    }

    pub fn pending_count(&self) -> usize {
        self.table.pending_count()
    }

    pub fn desired_service(&self, project: &str, service: &str) -> Option<&Arc<ResolvedService>> {
        self.desired
            .get(project)
            .and_then(|p| p.get(service))
            .map(|d| &d.service)
    }

    pub fn desired_projects(&self) -> BTreeSet<String> {
        self.desired.keys().cloned().collect()
    }

    pub fn projects(&self) -> BTreeSet<String> {
        let mut all = self.desired_projects();
        all.extend(self.table.projects());
        all
    }

    // -------------------------------------------------------------------------
    // Desired state
    // -------------------------------------------------------------------------

    fn set_service(&mut self, project: &str, service: Arc<ResolvedService>) {
        let services = self.desired.entry(project.to_string()).or_default();
        match services.get_mut(service.name()) {
            Some(existing)
                if existing.service.spec_hash == service.spec_hash
                    && existing.service.scale() == service.scale() =>
            {
                existing.service = service;
            }
            Some(existing) => {
                existing.service = service;
                existing.retired = 0;
            }
            None => {
                services.insert(
                    service.name().to_string(),
                    DesiredService { service, retired: 0 },
                );
            }
        }
    }

    /// Replace a project's desired services without touching tasks.
    pub fn set_desired(&mut self, project: &str, services: Vec<Arc<ResolvedService>>) {
        let keep: HashSet<String> = services.iter().map(|s| s.name().to_string()).collect();
        for service in services {
            self.set_service(project, service);
        }
        if let Some(existing) = self.desired.get_mut(project) {
            existing.retain(|name, _| keep.contains(name));
        }
        if self.desired.get(project).is_some_and(BTreeMap::is_empty) {
            self.desired.remove(project);
        }
    }

    /// Create or scale the given services; others in the project are untouched.
    pub fn apply_upsert(&mut self, project: &str, services: Vec<Arc<ResolvedService>>) -> Effects {
        let names: Vec<String> = services.iter().map(|s| s.name().to_string()).collect();
        for service in services {
            self.set_service(project, service);
        }

        let mut effects = Effects::default();
        for name in names {
            self.converge_service(project, &name, &mut effects);
        }
        effects
    }

    /// Make the project's service set exactly `services`.
    ///
    /// Changed services are replaced, removed services are drained and
    /// unchanged services see no churn.
    pub fn apply_replace(&mut self, project: &str, services: Vec<Arc<ResolvedService>>) -> Effects {
        let mut names = self.service_names(project);
        names.extend(services.iter().map(|s| s.name().to_string()));

        self.set_desired(project, services);

        let mut effects = Effects::default();
        for name in names {
            self.converge_service(project, &name, &mut effects);
        }
        effects
    }

    /// Replace every task of a service without a definition change.
    pub fn restart_service(&mut self, project: &str, service: &str) -> Result<Effects, SchedulerError> {
        let desired = self
            .desired
            .get_mut(project)
            .ok_or_else(|| SchedulerError::not_found("project", project))?
            .get_mut(service)
            .ok_or_else(|| SchedulerError::not_found("service", format!("{project}/{service}")))?;
        desired.retired = 0;

        let mut effects = Effects::default();
        let active: Vec<TaskId> = self
            .table
            .for_service(project, service)
            .filter(|t| t.state.is_active())
            .map(|t| t.id.clone())
            .collect();
        for id in active {
            self.terminate(&id, &mut effects);
        }
        self.converge_service(project, service, &mut effects);
        Ok(effects)
    }

    /// Drop a service from the desired set and drain its tasks.
    pub fn remove_service(&mut self, project: &str, service: &str) -> Effects {
        if let Some(services) = self.desired.get_mut(project) {
            services.remove(service);
            if services.is_empty() {
                self.desired.remove(project);
            }
        }
        let mut effects = Effects::default();
        self.converge_service(project, service, &mut effects);
        effects
    }

    /// Kill one task. It is replaced only if its restart policy replaces
    /// killed tasks; otherwise the replica is retired.
    pub fn kill_task(&mut self, id: &TaskId) -> Result<Effects, SchedulerError> {
        let task = self.active_task(id)?;
        let restart = should_restart(task.service.spec.restart, ExitKind::Killed);
        let hash = task.spec_hash.clone();
        if !restart {
            self.retire(id.project(), id.service(), &hash);
        }
        info!(task_id = %id, restart, "Killing task on request");

        let mut effects = Effects::default();
        self.terminate(id, &mut effects);
        self.converge_service(id.project(), id.service(), &mut effects);
        Ok(effects)
    }

    /// Replace one task with a fresh one of the same service.
    pub fn restart_task(&mut self, id: &TaskId) -> Result<Effects, SchedulerError> {
        self.active_task(id)?;

        let mut effects = Effects::default();
        self.terminate(id, &mut effects);
        self.converge_service(id.project(), id.service(), &mut effects);
        Ok(effects)
    }

    fn active_task(&self, id: &TaskId) -> Result<&Task, SchedulerError> {
        self.table
            .get(id)
            .filter(|t| t.state.is_active())
            .ok_or_else(|| SchedulerError::not_found("task", id.to_string()))
    }

    /// Converge every service of a project to its desired scale.
    pub fn converge_project(&mut self, project: &str) -> Effects {
        let mut effects = Effects::default();
        for name in self.service_names(project) {
            self.converge_service(project, &name, &mut effects);
        }
        effects
    }

    fn service_names(&self, project: &str) -> BTreeSet<String> {
        let mut names = self.table.services_of(project);
        if let Some(services) = self.desired.get(project) {
            names.extend(services.keys().cloned());
        }
        names
    }

    fn converge_service(&mut self, project: &str, service: &str, effects: &mut Effects) {
        let active: Vec<(TaskId, SpecHash, u64)> = self
            .table
            .for_service(project, service)
            .filter(|t| t.state.is_active())
            .map(|t| (t.id.clone(), t.spec_hash.clone(), t.seq))
            .collect();

        let Some((desired, target)) = self
            .desired
            .get(project)
            .and_then(|p| p.get(service))
            .map(|d| (Arc::clone(&d.service), d.target()))
        else {
            for (id, _, _) in active {
                self.terminate(&id, effects);
            }
            return;
        };

        let (matching, old) = classify_tasks(active, &desired.spec_hash, |(_, hash, _)| hash);

        for (id, _, _) in &old {
            self.terminate(id, effects);
        }

        if matching.len() < target {
            for _ in matching.len()..target {
                self.create(project, &desired, effects);
            }
        } else if matching.len() > target {
            let excess = matching.len() - target;
            for (id, _, _) in select_for_drain(matching, |(_, _, seq)| Reverse(*seq))
                .into_iter()
                .take(excess)
            {
                self.terminate(&id, effects);
            }
        }
    }

    fn create(&mut self, project: &str, service: &Arc<ResolvedService>, effects: &mut Effects) {
        let id = match TaskId::new(project, service.name()) {
            Ok(id) => id,
            Err(e) => {
                warn!(project, service = service.name(), error = %e, "Cannot create task ID");
                return;
            }
        };
        self.table.insert(
            id.clone(),
            TaskState::Pending,
            Arc::clone(service),
            service.spec_hash.clone(),
        );
        debug!(task_id = %id, "Task created");
        effects.created.push(id);
    }

    // -------------------------------------------------------------------------
    // Transitions
    // -------------------------------------------------------------------------

    fn transition(task: &mut Task, next: TaskState) -> bool {
        if !task.state.can_transition_to(next) {
            warn!(task_id = %task.id, from = %task.state, to = %next, "Rejected task transition");
            return false;
        }
        debug!(task_id = %task.id, from = %task.state, to = %next, "Task transition");
        task.state = next;
        task.updated_at = Utc::now();
        true
    }

    fn terminate(&mut self, id: &TaskId, effects: &mut Effects) {
        let Some(task) = self.table.get_mut(id) else {
            return;
        };
        match task.state {
            TaskState::Pending => {
                if Self::transition(task, TaskState::Terminating) && Self::transition(task, TaskState::Terminated) {
                    effects.terminated.push(id.clone());
                }
            }
            TaskState::Launched | TaskState::Running => {
                if Self::transition(task, TaskState::Terminating) {
                    effects.kills.push(KillRequest {
                        task_id: id.to_string(),
                        agent_id: task.agent_id.clone(),
                    });
                }
            }
            _ => {}
        }
    }

    /// Record that a pending task was placed on an offer.
    pub fn mark_launched(&mut self, id: &TaskId, offer: &Offer) -> Option<LaunchSpec> {
        let task = self.table.get_mut(id)?;
        if !Self::transition(task, TaskState::Launched) {
            return None;
        }
        let granted = task.requirements();
        task.host = Some(offer.hostname.clone());
        task.agent_id = Some(offer.agent_id.clone());
        task.granted = Some(granted);

        Some(LaunchSpec {
            task_id: id.clone(),
            agent_id: offer.agent_id.clone(),
            resources: granted,
            service: Arc::clone(&task.service),
        })
    }

    /// Undo a launch whose ACCEPT call failed.
    pub fn requeue(&mut self, id: &TaskId) {
        let Some(task) = self.table.get_mut(id) else {
            return;
        };
        match task.state {
            TaskState::Launched => {
                if Self::transition(task, TaskState::Pending) {
                    task.host = None;
                    task.agent_id = None;
                    task.granted = None;
                }
            }
            // Scaled down while the launch was in flight; nothing is running.
            TaskState::Terminating => {
                Self::transition(task, TaskState::Terminated);
            }
            _ => {}
        }
    }

    fn fail(&mut self, id: &TaskId, exit: ExitKind, effects: &mut Effects) {
        let Some(task) = self.table.get_mut(id) else {
            return;
        };
        if !Self::transition(task, TaskState::Failed) {
            return;
        }
        effects.failed.push(id.clone());

        let policy = task.service.spec.restart;
        let hash = task.spec_hash.clone();
        let project = task.project().to_string();
        let service = task.service_name().to_string();

        let restart = should_restart(policy, exit);
        info!(task_id = %id, ?exit, ?policy, restart, "Task ended");

        if !restart {
            self.retire(&project, &service, &hash);
        }

        self.converge_service(&project, &service, effects);
    }

    /// Lower a service's target by one replica built from `hash`.
    fn retire(&mut self, project: &str, service: &str, hash: &SpecHash) {
        if let Some(desired) = self.desired.get_mut(project).and_then(|p| p.get_mut(service)) {
            if desired.service.spec_hash == *hash {
                desired.retired = desired.retired.saturating_add(1);
            }
        }
    }

    fn promote_running(task: &mut Task) -> bool {
        if task.state == TaskState::Pending && !Self::transition(task, TaskState::Launched) {
            return false;
        }
        task.state == TaskState::Launched && Self::transition(task, TaskState::Running)
    }

    /// Apply a status update from the cluster.
    pub fn apply_status(&mut self, status: &TaskStatus) -> (StatusOutcome, Effects) {
        let mut effects = Effects::default();
        let Ok(id) = TaskId::parse(&status.task_id) else {
            return (StatusOutcome::Unknown, effects);
        };
        let Some(task) = self.table.get_mut(&id) else {
            return (StatusOutcome::Unknown, effects);
        };

        if task.agent_id.is_none() {
            task.agent_id = status.agent_id.clone();
        }
        let from = task.state;

        match (from, status.state.exit_kind()) {
            (TaskState::Pending | TaskState::Launched, None) => match status.state {
                ClusterTaskState::Running => {
                    Self::promote_running(task);
                }
                ClusterTaskState::Staging | ClusterTaskState::Starting if from == TaskState::Pending => {
                    Self::transition(task, TaskState::Launched);
                }
                _ => {}
            },
            (TaskState::Terminating, Some(_)) => {
                Self::transition(task, TaskState::Terminated);
            }
            (TaskState::Launched | TaskState::Running, Some(exit)) => {
                self.fail(&id, exit, &mut effects);
            }
            // Given up on, yet still alive.
            (TaskState::Failed | TaskState::Terminated, None) => {
                warn!(task_id = %id, state = %from, "Ended task reported alive, killing");
                effects.kills.push(KillRequest {
                    task_id: id.to_string(),
                    agent_id: task.agent_id.clone(),
                });
            }
            _ => {}
        }

        let to = self.table.get(&id).map_or(from, |t| t.state);
        let outcome = if to == from {
            StatusOutcome::Ignored
        } else {
            StatusOutcome::Applied { from, to }
        };
        (outcome, effects)
    }

    /// Take over a task the cluster runs but the table does not know.
    pub fn adopt(&mut self, reported: &ClusterTask) -> AdoptOutcome {
        if reported.state.is_terminal() {
            return AdoptOutcome::Ignored;
        }

        let reject = || {
            AdoptOutcome::Rejected(KillRequest {
                task_id: reported.task_id.clone(),
                agent_id: reported.agent_id.clone(),
            })
        };

        let Ok(id) = TaskId::parse(&reported.task_id) else {
            return reject();
        };
        let Some(desired) = self.desired_service(id.project(), id.service()).cloned() else {
            return reject();
        };
        if self.table.contains(&id) {
            return AdoptOutcome::Ignored;
        }

        let state = match reported.state {
            ClusterTaskState::Staging | ClusterTaskState::Starting => TaskState::Launched,
            _ => TaskState::Running,
        };
        let hash = reported
            .spec_hash
            .clone()
            .unwrap_or_else(|| desired.spec_hash.clone());

        let task = self.table.insert(id.clone(), state, desired, hash);
        task.agent_id = reported.agent_id.clone();
        task.host = reported.hostname.clone();
        task.granted = reported.resources;

        info!(task_id = %id, state = %state, "Adopted task from cluster");
        AdoptOutcome::Adopted(id)
    }

    /// Resolve drift between the table and the cluster's report for one
    /// project, then converge the project to its desired state.
    ///
    /// `reported` must hold exactly the cluster's tasks for this project, as
    /// listed at `listed_at`. Tasks that changed after that instant are newer
    /// than the listing and are not judged against it.
    pub fn reconcile_project(
        &mut self,
        project: &str,
        reported: &[ClusterTask],
        listed_at: DateTime<Utc>,
    ) -> (Effects, ProjectDrift) {
        let mut effects = Effects::default();
        let mut drift = ProjectDrift::default();

        let mut unknown: Vec<&ClusterTask> = Vec::new();
        for ct in reported {
            match TaskId::parse(&ct.task_id) {
                Ok(id) if self.table.contains(&id) => {
                    if self.changed_since(&id, listed_at) {
                        continue;
                    }
                    if self.align(&id, ct, &mut effects) {
                        drift.corrected += 1;
                    }
                }
                _ => unknown.push(ct),
            }
        }

        // ULIDs sort by creation time, so adoption preserves age order.
        unknown.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        for ct in unknown {
            match self.adopt(ct) {
                AdoptOutcome::Adopted(_) => drift.adopted += 1,
                AdoptOutcome::Rejected(kill) => {
                    warn!(task_id = %kill.task_id, "Killing unattributable task");
                    effects.kills.push(kill);
                    drift.rejected += 1;
                }
                AdoptOutcome::Ignored => {}
            }
        }

        let seen: HashSet<&str> = reported.iter().map(|t| t.task_id.as_str()).collect();
        let missing: Vec<(TaskId, TaskState)> = self
            .table
            .for_project(project)
            .filter(|t| {
                t.state.is_placed() && t.updated_at <= listed_at && !seen.contains(t.id.to_string().as_str())
            })
            .map(|t| (t.id.clone(), t.state))
            .collect();
        for (id, state) in missing {
            warn!(task_id = %id, state = %state, "Task missing from cluster");
            drift.missing += 1;
            if state == TaskState::Terminating {
                if let Some(task) = self.table.get_mut(&id) {
                    Self::transition(task, TaskState::Terminated);
                }
            } else {
                self.fail(&id, ExitKind::Failed, &mut effects);
            }
        }

        effects.merge(self.converge_project(project));
        (effects, drift)
    }

    fn changed_since(&self, id: &TaskId, at: DateTime<Utc>) -> bool {
        self.table.get(id).is_some_and(|t| t.updated_at > at)
    }

    /// Make a known task agree with the cluster. Returns true if anything changed.
    fn align(&mut self, id: &TaskId, reported: &ClusterTask, effects: &mut Effects) -> bool {
        let Some(task) = self.table.get_mut(id) else {
            return false;
        };
        if task.agent_id.is_none() {
            task.agent_id = reported.agent_id.clone();
        }

        match (task.state, reported.state.exit_kind()) {
            (TaskState::Pending | TaskState::Launched, None) => match reported.state {
                ClusterTaskState::Running => Self::promote_running(task),
                ClusterTaskState::Staging | ClusterTaskState::Starting if task.state == TaskState::Pending => {
                    Self::transition(task, TaskState::Launched)
                }
                _ => false,
            },
            // The kill may have been lost; send it again.
            (TaskState::Terminating, None) => {
                effects.kills.push(KillRequest {
                    task_id: id.to_string(),
                    agent_id: task.agent_id.clone(),
                });
                false
            }
            // Still alive although already given up on.
            (TaskState::Failed | TaskState::Terminated, None) => {
                effects.kills.push(KillRequest {
                    task_id: id.to_string(),
                    agent_id: task.agent_id.clone(),
                });
                true
            }
            (TaskState::Terminating, Some(_)) => Self::transition(task, TaskState::Terminated),
            (TaskState::Launched | TaskState::Running, Some(exit)) => {
                self.fail(id, exit, effects);
                true
            }
            _ => false,
        }
    }

    /// Drop terminal tasks from the table.
    pub fn reap_terminal(&mut self) -> usize {
        self.table.reap_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Resources;
    use crate::compose::{parse, ParseOptions};
    use mc_id::OfferId;
    use rstest::rstest;

    fn service(yaml: &str) -> Arc<ResolvedService> {
        let spec = parse(yaml.as_bytes(), &ParseOptions::default())
            .unwrap()
            .services
            .remove(0);
        Arc::new(ResolvedService::resolve(spec).unwrap())
    }

    fn web(scale: u32, image: &str, restart: &str) -> Arc<ResolvedService> {
        service(&format!(
            "services:\n  web:\n    image: {image}\n    command: run\n    restart: {restart}\n    deploy:\n      replicas: {scale}\n"
        ))
    }

    fn offer(host: &str) -> Offer {
        Offer {
            id: OfferId::parse(&format!("offer-{host}")).unwrap(),
            agent_id: AgentId::parse(&format!("agent-{host}")).unwrap(),
            hostname: host.to_string(),
            resources: Resources { cpus: 4.0, mem: 4096.0 },
            attributes: Default::default(),
        }
    }

    fn status(id: &TaskId, state: ClusterTaskState) -> TaskStatus {
        TaskStatus {
            task_id: id.to_string(),
            state,
            agent_id: None,
            message: None,
            uuid: None,
        }
    }

    fn states(lc: &TaskLifecycle) -> Vec<TaskState> {
        let mut tasks: Vec<&Task> = lc.table().iter().collect();
        tasks.sort_by_key(|t| t.seq);
        tasks.into_iter().map(|t| t.state).collect()
    }

    fn run_all(lc: &mut TaskLifecycle) {
        for id in lc.table().pending_fifo() {
            lc.mark_launched(&id, &offer("node")).unwrap();
            lc.apply_status(&status(&id, ClusterTaskState::Running));
        }
    }

    #[test]
    fn test_upsert_creates_scale_pending_tasks() {
        let mut lc = TaskLifecycle::new();
        let effects = lc.apply_upsert("shop", vec![web(3, "alpine", "always")]);
        assert_eq!(effects.created.len(), 3);
        assert_eq!(states(&lc), vec![TaskState::Pending; 3]);
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let mut lc = TaskLifecycle::new();
        lc.apply_upsert("shop", vec![web(2, "alpine", "always")]);
        let effects = lc.apply_upsert("shop", vec![web(2, "alpine", "always")]);
        assert!(effects.is_empty());
        assert_eq!(lc.table().len(), 2);
    }

    #[test]
    fn test_scale_down_terminates_newest_first() {
        let mut lc = TaskLifecycle::new();
        lc.apply_upsert("shop", vec![web(3, "alpine", "always")]);
        run_all(&mut lc);

        let effects = lc.apply_upsert("shop", vec![web(1, "alpine", "always")]);
        assert_eq!(effects.kills.len(), 2);
        assert_eq!(
            states(&lc),
            vec![TaskState::Running, TaskState::Terminating, TaskState::Terminating]
        );
    }

    #[test]
    fn test_scale_down_of_pending_needs_no_kill() {
        let mut lc = TaskLifecycle::new();
        lc.apply_upsert("shop", vec![web(2, "alpine", "always")]);
        let effects = lc.apply_upsert("shop", vec![web(0, "alpine", "always")]);
        assert!(effects.kills.is_empty());
        assert_eq!(effects.terminated.len(), 2);
        assert_eq!(states(&lc), vec![TaskState::Terminated; 2]);
    }

    #[test]
    fn test_replace_changed_service_drains_and_recreates() {
        let mut lc = TaskLifecycle::new();
        lc.apply_replace("shop", vec![web(1, "alpine:3.19", "always")]);
        run_all(&mut lc);

        let effects = lc.apply_replace("shop", vec![web(1, "alpine:3.20", "always")]);
        assert_eq!(effects.kills.len(), 1);
        assert_eq!(effects.created.len(), 1);
        assert_eq!(states(&lc), vec![TaskState::Terminating, TaskState::Pending]);
    }

    #[test]
    fn test_replace_removes_absent_service() {
        let mut lc = TaskLifecycle::new();
        let db = service("services:\n  db:\n    image: postgres\n    command: postgres\n");
        lc.apply_replace("shop", vec![web(1, "alpine", "always"), db]);
        run_all(&mut lc);

        let effects = lc.apply_replace("shop", vec![web(1, "alpine", "always")]);
        assert_eq!(effects.kills.len(), 1);
        assert!(effects.created.is_empty());
        assert!(lc.desired_service("shop", "db").is_none());
    }

    #[test]
    fn test_upsert_keeps_absent_services() {
        let mut lc = TaskLifecycle::new();
        let db = service("services:\n  db:\n    image: postgres\n    command: postgres\n");
        lc.apply_upsert("shop", vec![db]);
        let effects = lc.apply_upsert("shop", vec![web(1, "alpine", "always")]);
        assert!(effects.kills.is_empty() && effects.terminated.is_empty());
        assert!(lc.desired_service("shop", "db").is_some());
    }

    #[rstest]
    #[case("always", ClusterTaskState::Finished, true)]
    #[case("always", ClusterTaskState::Failed, true)]
    #[case("unless-stopped", ClusterTaskState::Finished, false)]
    #[case("unless-stopped", ClusterTaskState::Killed, true)]
    #[case("on-failure", ClusterTaskState::Failed, true)]
    #[case("on-failure", ClusterTaskState::Lost, true)]
    #[case("on-failure", ClusterTaskState::Finished, false)]
    #[case("on-failure", ClusterTaskState::Killed, false)]
    #[case("'no'", ClusterTaskState::Failed, false)]
    fn test_restart_policy(#[case] policy: &str, #[case] end: ClusterTaskState, #[case] replaced: bool) {
        let mut lc = TaskLifecycle::new();
        lc.apply_upsert("shop", vec![web(1, "alpine", policy)]);
        run_all(&mut lc);
        let id = lc.table().iter().next().unwrap().id.clone();

        let (outcome, effects) = lc.apply_status(&status(&id, end));
        assert_eq!(
            outcome,
            StatusOutcome::Applied { from: TaskState::Running, to: TaskState::Failed }
        );
        assert_eq!(effects.created.len(), usize::from(replaced));

        // A later converge must not refill a retired replica.
        let again = lc.converge_project("shop");
        assert!(again.created.is_empty());
    }

    #[test]
    fn test_terminating_task_becomes_terminated_on_kill_report() {
        let mut lc = TaskLifecycle::new();
        lc.apply_upsert("shop", vec![web(1, "alpine", "always")]);
        run_all(&mut lc);
        lc.apply_upsert("shop", vec![web(0, "alpine", "always")]);
        let id = lc.table().iter().next().unwrap().id.clone();

        let (outcome, effects) = lc.apply_status(&status(&id, ClusterTaskState::Killed));
        assert_eq!(
            outcome,
            StatusOutcome::Applied { from: TaskState::Terminating, to: TaskState::Terminated }
        );
        assert!(effects.is_empty());
        assert_eq!(lc.reap_terminal(), 1);
        assert!(lc.table().is_empty());
    }

    #[test]
    fn test_requeue_after_failed_accept() {
        let mut lc = TaskLifecycle::new();
        lc.apply_upsert("shop", vec![web(1, "alpine", "always")]);
        let id = lc.table().pending_fifo()[0].clone();
        lc.mark_launched(&id, &offer("nodeA")).unwrap();
        lc.requeue(&id);

        let task = lc.task(&id).unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert!(task.host.is_none());
    }

    #[test]
    fn test_restart_service_replaces_all_tasks() {
        let mut lc = TaskLifecycle::new();
        lc.apply_upsert("shop", vec![web(2, "alpine", "always")]);
        run_all(&mut lc);

        let effects = lc.restart_service("shop", "web").unwrap();
        assert_eq!(effects.kills.len(), 2);
        assert_eq!(effects.created.len(), 2);
        assert!(lc.restart_service("shop", "nope").is_err());
        assert!(lc.restart_service("other", "web").is_err());
    }

    #[test]
    fn test_unknown_status_is_reported() {
        let mut lc = TaskLifecycle::new();
        let stray = TaskStatus {
            task_id: "something-else".into(),
            state: ClusterTaskState::Running,
            agent_id: None,
            message: None,
            uuid: None,
        };
        assert_eq!(lc.apply_status(&stray).0, StatusOutcome::Unknown);
    }

    #[test]
    fn test_adopt_requires_desired_service() {
        let mut lc = TaskLifecycle::new();
        lc.set_desired("shop", vec![web(1, "alpine", "always")]);

        let known = TaskId::new("shop", "web").unwrap();
        let reported = ClusterTask {
            task_id: known.to_string(),
            state: ClusterTaskState::Running,
            agent_id: Some(AgentId::parse("a1").unwrap()),
            hostname: None,
            spec_hash: None,
            resources: None,
        };
        assert_eq!(lc.adopt(&reported), AdoptOutcome::Adopted(known.clone()));
        assert_eq!(lc.task(&known).unwrap().state, TaskState::Running);

        let stranger = ClusterTask {
            task_id: TaskId::new("shop", "cache").unwrap().to_string(),
            ..reported.clone()
        };
        assert!(matches!(lc.adopt(&stranger), AdoptOutcome::Rejected(_)));

        let finished = ClusterTask {
            state: ClusterTaskState::Finished,
            ..stranger
        };
        assert_eq!(lc.adopt(&finished), AdoptOutcome::Ignored);
    }

    #[test]
    fn test_ended_task_reported_alive_is_killed() {
        let mut lc = TaskLifecycle::new();
        lc.apply_upsert("shop", vec![web(1, "alpine", "'no'")]);
        run_all(&mut lc);
        let id = lc.table().iter().next().unwrap().id.clone();
        lc.apply_status(&status(&id, ClusterTaskState::Failed));

        let (outcome, effects) = lc.apply_status(&status(&id, ClusterTaskState::Running));
        assert_eq!(outcome, StatusOutcome::Ignored);
        assert_eq!(effects.kills.len(), 1);
        assert_eq!(effects.kills[0].task_id, id.to_string());
        assert_eq!(lc.task(&id).unwrap().state, TaskState::Failed);
    }

    #[test]
    fn test_reconcile_skips_tasks_changed_after_listing() {
        let mut lc = TaskLifecycle::new();
        lc.apply_upsert("shop", vec![web(1, "alpine", "'no'")]);
        let id = lc.table().pending_fifo()[0].clone();

        let listed_at = Utc::now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        lc.mark_launched(&id, &offer("nodeA")).unwrap();

        let (effects, drift) = lc.reconcile_project("shop", &[], listed_at);
        assert_eq!(drift.missing, 0);
        assert!(effects.is_empty());
        assert_eq!(lc.task(&id).unwrap().state, TaskState::Launched);

        // A listing taken after the launch that still lacks the task is believed.
        let (_, drift) = lc.reconcile_project("shop", &[], Utc::now());
        assert_eq!(drift.missing, 1);
        assert_eq!(lc.task(&id).unwrap().state, TaskState::Failed);
    }

    #[rstest]
    #[case("always", 1)]
    #[case("unless-stopped", 1)]
    #[case("on-failure", 0)]
    #[case("'no'", 0)]
    fn test_kill_task_follows_restart_policy(#[case] policy: &str, #[case] replacements: usize) {
        let mut lc = TaskLifecycle::new();
        lc.apply_upsert("shop", vec![web(2, "alpine", policy)]);
        run_all(&mut lc);
        let id = lc.table().iter().min_by_key(|t| t.seq).unwrap().id.clone();

        let effects = lc.kill_task(&id).unwrap();
        assert_eq!(effects.kills.len(), 1);
        assert_eq!(effects.created.len(), replacements);
        assert_eq!(lc.task(&id).unwrap().state, TaskState::Terminating);
        assert!(lc.converge_project("shop").is_empty());
        assert!(lc.kill_task(&id).is_err());
    }

    #[test]
    fn test_restart_task_replaces_one_task() {
        let mut lc = TaskLifecycle::new();
        lc.apply_upsert("shop", vec![web(2, "alpine", "'no'")]);
        run_all(&mut lc);
        let id = lc.table().iter().min_by_key(|t| t.seq).unwrap().id.clone();

        let effects = lc.restart_task(&id).unwrap();
        assert_eq!(effects.kills.len(), 1);
        assert_eq!(effects.created.len(), 1);
        assert_eq!(
            states(&lc),
            vec![TaskState::Terminating, TaskState::Running, TaskState::Pending]
        );

        let unknown = TaskId::new("shop", "web").unwrap();
        assert!(lc.restart_task(&unknown).is_err());
    }

    #[test]
    fn test_remove_service_drains_it() {
        let mut lc = TaskLifecycle::new();
        let db = service("services:\n  db:\n    image: postgres\n    command: postgres\n");
        lc.apply_upsert("shop", vec![web(1, "alpine", "always"), db]);
        run_all(&mut lc);

        let effects = lc.remove_service("shop", "web");
        assert_eq!(effects.kills.len(), 1);
        assert!(effects.created.is_empty());
        assert!(lc.desired_service("shop", "web").is_none());
        assert!(lc.desired_service("shop", "db").is_some());

        lc.remove_service("shop", "db");
        assert!(lc.desired_projects().is_empty());
    }
}
