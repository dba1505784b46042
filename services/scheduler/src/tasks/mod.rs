//! Task state machine, table and lifecycle.

mod lifecycle;
mod state;
mod table;

pub use lifecycle::{
    should_restart, AdoptOutcome, Effects, KillRequest, ProjectDrift, StatusOutcome, TaskLifecycle,
};
pub use state::TaskState;
pub use table::{Task, TaskTable};
