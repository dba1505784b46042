use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use mc_id::FrameworkId;
use tokio::sync::RwLock;

use super::{ProjectSnapshot, StateStore, StoreError};

/// In-memory store for tests and development.
///
/// Writes can be made to fail to exercise the persist-before-launch path.
#[derive(Default)]
pub struct MemoryStore {
    projects: RwLock<BTreeMap<String, ProjectSnapshot>>,
    framework_id: RwLock<Option<FrameworkId>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail (or succeed again).
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store configured to fail".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn put(&self, snapshot: &ProjectSnapshot) -> Result<(), StoreError> {
        self.check_writable()?;
        self.projects
            .write()
            .await
            .insert(snapshot.project.clone(), snapshot.clone());
        Ok(())
    }

    async fn get(&self, project: &str) -> Result<Option<ProjectSnapshot>, StoreError> {
        Ok(self.projects.read().await.get(project).cloned())
    }

    async fn delete(&self, project: &str) -> Result<bool, StoreError> {
        self.check_writable()?;
        Ok(self.projects.write().await.remove(project).is_some())
    }

    async fn list(&self) -> Result<Vec<ProjectSnapshot>, StoreError> {
        Ok(self.projects.read().await.values().cloned().collect())
    }

    async fn framework_id(&self) -> Result<Option<FrameworkId>, StoreError> {
        Ok(self.framework_id.read().await.clone())
    }

    async fn set_framework_id(&self, id: &FrameworkId) -> Result<(), StoreError> {
        self.check_writable()?;
        *self.framework_id.write().await = Some(id.clone());
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
