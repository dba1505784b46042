//! In-memory cluster for testing.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use mc_id::{AgentId, OfferId, TaskId};
use tracing::debug;

use super::{ClusterDriver, ClusterTask, ClusterTaskState, DriverError, LaunchSpec, Offer, TaskStatus};

/// A call recorded by [`InMemoryCluster`].
#[derive(Debug, Clone, PartialEq)]
pub enum DriverCall {
    Accept { offer: OfferId, task: TaskId },
    Decline(Vec<OfferId>),
    Kill(String),
    Acknowledge(String),
    Reconcile,
    Revive,
    Suppress,
}

#[derive(Default)]
struct Inner {
    calls: Vec<DriverCall>,
    tasks: Vec<ClusterTask>,
    list_failures: u32,
    fail_accepts: bool,
}

/// Cluster driver that records every call and serves a scripted task list.
///
/// Accepted launches appear in the task list as `Staging`; kills mark the
/// task `Killed`.
#[derive(Default)]
pub struct InMemoryCluster {
    inner: Mutex<Inner>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the task list the cluster reports.
    pub fn set_tasks(&self, tasks: Vec<ClusterTask>) {
        self.lock().tasks = tasks;
    }

    pub fn push_task(&self, task: ClusterTask) {
        self.lock().tasks.push(task);
    }

    /// Change the reported state of a task.
    pub fn set_state(&self, task_id: &str, state: ClusterTaskState) {
        if let Some(task) = self.lock().tasks.iter_mut().find(|t| t.task_id == task_id) {
            task.state = state;
        }
    }

    /// Drop a task from the listing, as if the master forgot it.
    pub fn forget(&self, task_id: &str) {
        self.lock().tasks.retain(|t| t.task_id != task_id);
    }

    pub fn tasks(&self) -> Vec<ClusterTask> {
        self.lock().tasks.clone()
    }

    /// Fail the next `n` task listings.
    pub fn fail_list_tasks(&self, n: u32) {
        self.lock().list_failures = n;
    }

    pub fn fail_accepts(&self, fail: bool) {
        self.lock().fail_accepts = fail;
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.lock().calls.clone()
    }

    /// Return and clear the recorded calls.
    pub fn take_calls(&self) -> Vec<DriverCall> {
        std::mem::take(&mut self.lock().calls)
    }

    pub fn accepted(&self) -> Vec<(OfferId, TaskId)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                DriverCall::Accept { offer, task } => Some((offer, task)),
                _ => None,
            })
            .collect()
    }

    pub fn declined(&self) -> Vec<OfferId> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                DriverCall::Decline(ids) => Some(ids),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn killed(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                DriverCall::Kill(id) => Some(id),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ClusterDriver for InMemoryCluster {
    async fn accept(&self, offer: &Offer, launch: &LaunchSpec) -> Result<(), DriverError> {
        let mut inner = self.lock();
        if inner.fail_accepts {
            return Err(DriverError::Unavailable("in-memory cluster configured to fail accepts".into()));
        }
        debug!(offer_id = %offer.id, task_id = %launch.task_id, "[MEMORY] Accepting offer");
        inner.calls.push(DriverCall::Accept {
            offer: offer.id.clone(),
            task: launch.task_id.clone(),
        });
        inner.tasks.push(ClusterTask {
            task_id: launch.task_id.to_string(),
            state: ClusterTaskState::Staging,
            agent_id: Some(launch.agent_id.clone()),
            hostname: Some(offer.hostname.clone()),
            spec_hash: Some(launch.service.spec_hash.clone()),
            resources: Some(launch.resources),
        });
        Ok(())
    }

    async fn decline(&self, offers: &[OfferId]) -> Result<(), DriverError> {
        self.lock().calls.push(DriverCall::Decline(offers.to_vec()));
        Ok(())
    }

    async fn kill(&self, task_id: &str, _agent_id: Option<&AgentId>) -> Result<(), DriverError> {
        let mut inner = self.lock();
        inner.calls.push(DriverCall::Kill(task_id.to_string()));
        if let Some(task) = inner.tasks.iter_mut().find(|t| t.task_id == task_id) {
            task.state = ClusterTaskState::Killed;
        }
        Ok(())
    }

    async fn acknowledge(&self, status: &TaskStatus) -> Result<(), DriverError> {
        self.lock()
            .calls
            .push(DriverCall::Acknowledge(status.task_id.clone()));
        Ok(())
    }

    async fn list_tasks(&self) -> Result<Vec<ClusterTask>, DriverError> {
        let mut inner = self.lock();
        if inner.list_failures > 0 {
            inner.list_failures -= 1;
            return Err(DriverError::Unavailable("in-memory cluster configured to fail listings".into()));
        }
        Ok(inner.tasks.clone())
    }

    async fn reconcile_implicit(&self) -> Result<(), DriverError> {
        self.lock().calls.push(DriverCall::Reconcile);
        Ok(())
    }

    async fn revive(&self) -> Result<(), DriverError> {
        self.lock().calls.push(DriverCall::Revive);
        Ok(())
    }

    async fn suppress(&self) -> Result<(), DriverError> {
        self.lock().calls.push(DriverCall::Suppress);
        Ok(())
    }
}
