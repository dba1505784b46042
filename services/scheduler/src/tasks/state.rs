use serde::{Deserialize, Serialize};

/// Lifecycle state of a task as tracked by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for a matching offer.
    Pending,
    /// Offer accepted, launch sent to the cluster.
    Launched,
    /// Cluster confirmed the task is running.
    Running,
    /// Task ended on its own or was lost.
    Failed,
    /// Kill requested, waiting for the cluster to confirm.
    Terminating,
    /// Gone for good.
    Terminated,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Launched => "launched",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Terminated)
    }

    /// Counts toward a service's replica target.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Launched | Self::Running)
    }

    /// Has (or may have) a container on the cluster.
    pub fn is_placed(&self) -> bool {
        matches!(self, Self::Launched | Self::Running | Self::Terminating)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Launched)
                | (Pending, Terminating)
                | (Launched, Running)
                | (Launched, Failed)
                | (Launched, Terminating)
                // Requeue after a failed ACCEPT call.
                | (Launched, Pending)
                | (Running, Failed)
                | (Running, Terminating)
                | (Terminating, Terminated)
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
