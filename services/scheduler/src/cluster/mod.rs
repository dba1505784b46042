//! Cluster manager interface.
//!
//! The scheduler talks to Mesos only through [`ClusterDriver`]. The HTTP
//! implementation lives in [`mesos`]; [`InMemoryCluster`] records calls
//! for tests.

mod memory;
pub mod mesos;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mc_id::{AgentId, FrameworkId, OfferId, TaskId};
use mc_reconcile::SpecHash;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::desired::ResolvedService;

pub use memory::{DriverCall, InMemoryCluster};

/// Label carrying the spec hash on launched tasks, so adopted tasks can be
/// compared against the desired definition.
pub const SPEC_HASH_LABEL: &str = "mesos_compose.spec_hash";

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("master returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("not subscribed to the master")]
    NotSubscribed,

    #[error("decode error: {0}")]
    Decode(String),

    #[error("cluster unavailable: {0}")]
    Unavailable(String),
}

/// CPU and memory (MiB) amounts.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Resources {
    pub cpus: f64,
    pub mem: f64,
}

impl Resources {
    /// True if `self` has at least as much of each resource as `need`.
    pub fn covers(&self, need: &Resources) -> bool {
        self.cpus >= need.cpus && self.mem >= need.mem
    }
}

/// A resource offer from one agent.
#[derive(Debug, Clone, PartialEq)]
pub struct Offer {
    pub id: OfferId,
    pub agent_id: AgentId,
    pub hostname: String,
    pub resources: Resources,
    /// Text attributes of the agent, e.g. `os` and `arch`.
    pub attributes: BTreeMap<String, String>,
}

impl Offer {
    pub fn attribute(&self, key: &str) -> Option<String> {
        self.attributes.get(key).cloned()
    }
}

/// Task states as reported by Mesos.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterTaskState {
    Staging,
    Starting,
    Running,
    Killing,
    Finished,
    Failed,
    Killed,
    Error,
    Lost,
    Dropped,
    Unreachable,
    Gone,
    GoneByOperator,
    Unknown,
}

/// How a task ended, for restart policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Exited cleanly.
    Finished,
    /// Killed on request.
    Killed,
    /// Failed, errored or was lost.
    Failed,
}

impl ClusterTaskState {
    pub fn from_mesos(s: &str) -> Self {
        match s {
            "TASK_STAGING" => Self::Staging,
            "TASK_STARTING" => Self::Starting,
            "TASK_RUNNING" => Self::Running,
            "TASK_KILLING" => Self::Killing,
            "TASK_FINISHED" => Self::Finished,
            "TASK_FAILED" => Self::Failed,
            "TASK_KILLED" => Self::Killed,
            "TASK_ERROR" => Self::Error,
            "TASK_LOST" => Self::Lost,
            "TASK_DROPPED" => Self::Dropped,
            "TASK_UNREACHABLE" => Self::Unreachable,
            "TASK_GONE" => Self::Gone,
            "TASK_GONE_BY_OPERATOR" => Self::GoneByOperator,
            _ => Self::Unknown,
        }
    }

    pub fn as_mesos(&self) -> &'static str {
        match self {
            Self::Staging => "TASK_STAGING",
            Self::Starting => "TASK_STARTING",
            Self::Running => "TASK_RUNNING",
            Self::Killing => "TASK_KILLING",
            Self::Finished => "TASK_FINISHED",
            Self::Failed => "TASK_FAILED",
            Self::Killed => "TASK_KILLED",
            Self::Error => "TASK_ERROR",
            Self::Lost => "TASK_LOST",
            Self::Dropped => "TASK_DROPPED",
            Self::Unreachable => "TASK_UNREACHABLE",
            Self::Gone => "TASK_GONE",
            Self::GoneByOperator => "TASK_GONE_BY_OPERATOR",
            Self::Unknown => "TASK_UNKNOWN",
        }
    }

    /// How the task ended, or `None` if it has not ended.
    ///
    /// The framework is not partition-aware, so an unreachable task is
    /// treated as lost.
    pub fn exit_kind(&self) -> Option<ExitKind> {
        match self {
            Self::Staging | Self::Starting | Self::Running | Self::Killing | Self::Unknown => None,
            Self::Finished => Some(ExitKind::Finished),
            Self::Killed => Some(ExitKind::Killed),
            Self::Failed
            | Self::Error
            | Self::Lost
            | Self::Dropped
            | Self::Unreachable
            | Self::Gone
            | Self::GoneByOperator => Some(ExitKind::Failed),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.exit_kind().is_some()
    }
}

/// A task status update from the cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskStatus {
    /// Raw task ID; tasks from other schedulers may not parse as [`TaskId`].
    pub task_id: String,
    pub state: ClusterTaskState,
    pub agent_id: Option<AgentId>,
    pub message: Option<String>,
    /// Acknowledgement UUID (base64), present when the update needs an ACK.
    pub uuid: Option<String>,
}

/// A task as listed by the master.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterTask {
    pub task_id: String,
    pub state: ClusterTaskState,
    pub agent_id: Option<AgentId>,
    pub hostname: Option<String>,
    pub spec_hash: Option<SpecHash>,
    pub resources: Option<Resources>,
}

/// Events delivered by the cluster manager to the scheduling loop.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    Subscribed {
        framework_id: FrameworkId,
        heartbeat_interval: Option<Duration>,
    },
    Offers(Vec<Offer>),
    Rescind(OfferId),
    Update(TaskStatus),
    Heartbeat,
    Error(String),
    /// The event stream ended or could not be established.
    Disconnected,
}

/// Everything needed to launch one task on an accepted offer.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub resources: Resources,
    pub service: Arc<ResolvedService>,
}

/// Calls the scheduler makes against the cluster manager.
#[async_trait]
pub trait ClusterDriver: Send + Sync {
    /// Accept an offer and launch one task on it.
    async fn accept(&self, offer: &Offer, launch: &LaunchSpec) -> Result<(), DriverError>;

    /// Decline offers that no pending task could use.
    async fn decline(&self, offers: &[OfferId]) -> Result<(), DriverError>;

    async fn kill(&self, task_id: &str, agent_id: Option<&AgentId>) -> Result<(), DriverError>;

    async fn acknowledge(&self, status: &TaskStatus) -> Result<(), DriverError>;

    /// Authoritative list of this framework's tasks.
    async fn list_tasks(&self) -> Result<Vec<ClusterTask>, DriverError>;

    /// Ask the master to resend the latest status of every task.
    async fn reconcile_implicit(&self) -> Result<(), DriverError>;

    async fn revive(&self) -> Result<(), DriverError>;

    async fn suppress(&self) -> Result<(), DriverError>;
}
