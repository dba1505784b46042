//! # mc-scheduler
//!
//! Runs docker-compose projects on an Apache Mesos cluster.
//!
//! A compose document is parsed into service definitions, persisted as the
//! project's desired state and converged into tasks. Tasks are placed on
//! resource offers first-fit, followed through their lifecycle by status
//! updates and periodically reconciled against what the master reports.

pub mod api;
pub mod cluster;
pub mod compose;
pub mod config;
pub mod desired;
pub mod error;
pub mod labels;
pub mod offers;
pub mod scheduler;
pub mod state;
pub mod status;
pub mod store;
pub mod tasks;
