use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use mc_id::{AgentId, TaskId};
use mc_reconcile::SpecHash;
use serde::Serialize;

use super::state::TaskState;
use crate::cluster::Resources;
use crate::desired::ResolvedService;

/// One instance of a service.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: TaskId,
    /// Creation order; lower is older.
    pub seq: u64,
    pub state: TaskState,
    pub spec_hash: SpecHash,
    /// Definition the task was created from.
    #[serde(skip)]
    pub service: Arc<ResolvedService>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub granted: Option<Resources>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn project(&self) -> &str {
        self.id.project()
    }

    pub fn service_name(&self) -> &str {
        self.id.service()
    }

    pub fn requirements(&self) -> Resources {
        self.service.spec.resources
    }
}

/// In-memory task table.
///
/// Owned by the lifecycle manager and passed in explicitly, so tests can
/// build a table in any state without a cluster.
#[derive(Debug, Default)]
pub struct TaskTable {
    tasks: BTreeMap<TaskId, Task>,
    next_seq: u64,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new task with the next sequence number.
    pub fn insert(&mut self, id: TaskId, state: TaskState, service: Arc<ResolvedService>, spec_hash: SpecHash) -> &mut Task {
        let seq = self.next_seq;
        self.next_seq += 1;
        let now = Utc::now();
        let task = Task {
            id: id.clone(),
            seq,
            state,
            spec_hash,
            service,
            host: None,
            agent_id: None,
            granted: None,
            created_at: now,
            updated_at: now,
        };
        self.tasks.entry(id).or_insert(task)
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// Pending tasks, oldest first.
    pub fn pending_fifo(&self) -> Vec<TaskId> {
        let mut pending: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Pending)
            .collect();
        pending.sort_by_key(|t| t.seq);
        pending.into_iter().map(|t| t.id.clone()).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| t.state == TaskState::Pending)
            .count()
    }

    pub fn for_service<'a>(&'a self, project: &'a str, service: &'a str) -> impl Iterator<Item = &'a Task> + 'a {
        self.tasks
            .values()
            .filter(move |t| t.id.belongs_to(project, service))
    }

    pub fn for_project<'a>(&'a self, project: &'a str) -> impl Iterator<Item = &'a Task> + 'a {
        self.tasks.values().filter(move |t| t.project() == project)
    }

    /// Non-terminal tasks of a service.
    pub fn live_count(&self, project: &str, service: &str) -> usize {
        self.for_service(project, service)
            .filter(|t| !t.state.is_terminal())
            .count()
    }

    /// Service names with at least one task in the project.
    pub fn services_of(&self, project: &str) -> BTreeSet<String> {
        self.for_project(project)
            .map(|t| t.service_name().to_string())
            .collect()
    }

    pub fn projects(&self) -> BTreeSet<String> {
        self.tasks.values().map(|t| t.project().to_string()).collect()
    }

    /// Drop terminal tasks. Returns how many were removed.
    pub fn reap_terminal(&mut self) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|_, t| !t.state.is_terminal());
        before - self.tasks.len()
    }
}
