//! Status board: the latest error per scope, for asynchronous reporting.
//!
//! Store and reconcile failures happen outside the request that caused
//! them (or with no request at all), so they are kept here and served by
//! `GET /v0/status`.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{ErrorCode, SchedulerError};

/// Scope used for errors that are not tied to a project.
pub const FRAMEWORK_SCOPE: &str = "framework";

#[derive(Debug, Clone, Serialize)]
pub struct StatusEntry {
    /// `framework` or a project name.
    pub scope: String,
    pub code: ErrorCode,
    pub kind: &'static str,
    pub operation: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct StatusBoard {
    entries: Mutex<BTreeMap<String, StatusEntry>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error, replacing any earlier one for the same scope.
    pub fn record(&self, scope: &str, operation: &str, error: &SchedulerError) {
        let entry = StatusEntry {
            scope: scope.to_string(),
            code: error.code(),
            kind: error.kind(),
            operation: operation.to_string(),
            message: error.to_string(),
            at: Utc::now(),
        };
        self.lock().insert(scope.to_string(), entry);
    }

    /// Forget the error for a scope after a successful operation.
    pub fn clear(&self, scope: &str) {
        self.lock().remove(scope);
    }

    pub fn get(&self, scope: &str) -> Option<StatusEntry> {
        self.lock().get(scope).cloned()
    }

    pub fn snapshot(&self) -> Vec<StatusEntry> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, StatusEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;

    #[test]
    fn test_latest_error_per_scope() {
        let board = StatusBoard::new();
        board.record("shop", "apply", &SchedulerError::Unspecified("first".into()));
        board.record(
            "shop",
            "apply",
            &SchedulerError::StorePersist(StoreError::Unavailable("disk full".into())),
        );
        board.record(FRAMEWORK_SCOPE, "reconcile", &SchedulerError::Reconcile("timeout".into()));

        let entries = board.snapshot();
        assert_eq!(entries.len(), 2);
        let shop = board.get("shop").unwrap();
        assert_eq!(shop.code, ErrorCode::StorePersist);
        assert_eq!(shop.kind, "store_persist");

        board.clear("shop");
        assert!(board.get("shop").is_none());
        assert_eq!(board.get(FRAMEWORK_SCOPE).unwrap().code.as_u8(), 3);
    }
}
