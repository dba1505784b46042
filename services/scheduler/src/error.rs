//! Scheduler error taxonomy and wire error codes.

use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::cluster::DriverError;
use crate::compose::ComposeError;
use crate::labels::LabelError;
use crate::store::StoreError;

/// Numeric error code reported on the HTTP and status surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    /// No error.
    Ok = 0,
    /// Could not persist configuration to the state store.
    StorePersist = 1,
    /// Unspecified error.
    Unspecified = 2,
    /// Reconcile error.
    Reconcile = 3,
}

impl ErrorCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl Serialize for ErrorCode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u8(self.as_u8())
    }
}

/// Errors surfaced by scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Compose(#[from] ComposeError),

    #[error(transparent)]
    Label(#[from] LabelError),

    #[error("could not save configuration: {0}")]
    StorePersist(#[source] StoreError),

    #[error("could not read configuration: {0}")]
    StoreRead(#[source] StoreError),

    #[error("reconcile error: {0}")]
    Reconcile(String),

    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("cluster driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("unspecified error: {0}")]
    Unspecified(String),
}

impl SchedulerError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Wire code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::StorePersist(_) => ErrorCode::StorePersist,
            Self::Reconcile(_) => ErrorCode::Reconcile,
            Self::Compose(_)
            | Self::Label(_)
            | Self::StoreRead(_)
            | Self::NotFound { .. }
            | Self::Driver(_)
            | Self::Unspecified(_) => ErrorCode::Unspecified,
        }
    }

    /// Stable machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Compose(ComposeError::Malformed(_)) => "malformed_spec",
            Self::Compose(ComposeError::UnsupportedVersion(_)) => "unsupported_version",
            Self::Label(_) => "invalid_label_value",
            Self::StorePersist(_) => "store_persist",
            Self::StoreRead(_) => "store_read",
            Self::Reconcile(_) => "reconcile",
            Self::NotFound { .. } => "not_found",
            Self::Driver(_) => "cluster_driver",
            Self::Unspecified(_) => "unspecified",
        }
    }

    /// True for errors caused by the caller's input.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Compose(_) | Self::Label(_))
    }
}
