//! Scheduler module: compose operations, the scheduling loop and
//! reconciliation.
//!
//! The scheduler is responsible for:
//! - Persisting desired state before acting on it
//! - Converging each project's tasks to its desired state
//! - Matching offers to pending tasks
//! - Reconciling the task table against the cluster

mod engine;
mod event_loop;
mod locks;
mod reconciler;
mod worker;

pub use engine::{ApplyMode, ApplyReport, Scheduler};
pub use event_loop::EventLoop;
pub use locks::ProjectLocks;
pub use reconciler::{ReconcileStats, Reconciler};
pub use worker::ReconcileWorker;
