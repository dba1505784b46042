//! Desired-state store.
//!
//! The store is the durability boundary: a mutating operation is committed
//! only once its project snapshot has been written. Task state is never
//! stored; it is rebuilt from the cluster by the reconciler.

mod memory;
mod sqlite;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mc_id::FrameworkId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::compose::ServiceSpec;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store task failed: {0}")]
    Task(String),
}

/// Durable record of a project's intended services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    pub project: String,
    /// Incremented on every committed change.
    pub version: u64,
    /// Compose schema version of the last applied document.
    pub compose_version: String,
    pub updated_at: DateTime<Utc>,
    pub services: BTreeMap<String, ServiceSpec>,
}

impl ProjectSnapshot {
    pub fn new(project: impl Into<String>, compose_version: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            version: 0,
            compose_version: compose_version.into(),
            updated_at: Utc::now(),
            services: BTreeMap::new(),
        }
    }

    /// The next revision of this snapshot with the given service set.
    pub fn next(&self, compose_version: &str, services: BTreeMap<String, ServiceSpec>) -> Self {
        Self {
            project: self.project.clone(),
            version: self.version + 1,
            compose_version: compose_version.to_string(),
            updated_at: Utc::now(),
            services,
        }
    }
}

/// Key-value store holding one snapshot per project.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Write a project's snapshot, replacing any previous one.
    async fn put(&self, snapshot: &ProjectSnapshot) -> Result<(), StoreError>;

    /// Read a project's snapshot.
    async fn get(&self, project: &str) -> Result<Option<ProjectSnapshot>, StoreError>;

    /// Remove a project's snapshot. Returns false if none existed.
    async fn delete(&self, project: &str) -> Result<bool, StoreError>;

    /// All stored snapshots, ordered by project name.
    async fn list(&self) -> Result<Vec<ProjectSnapshot>, StoreError>;

    /// Framework ID from the last Mesos subscription.
    async fn framework_id(&self) -> Result<Option<FrameworkId>, StoreError>;

    async fn set_framework_id(&self, id: &FrameworkId) -> Result<(), StoreError>;

    /// Cheap connectivity check.
    async fn ping(&self) -> Result<(), StoreError>;
}
