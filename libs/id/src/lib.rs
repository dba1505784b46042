//! # mc-id
//!
//! Typed identifiers for the mesos-compose scheduler.
//!
//! ## Design Principles
//!
//! - Task IDs are generated by the scheduler and encode their owner
//! - Offer, agent and framework IDs are opaque strings minted by Mesos
//! - All IDs have a canonical string representation with strict parsing
//! - IDs are typed to prevent mixing different resource types
//!
//! ## Task ID Format
//!
//! Task IDs use the format `{project}:{service}.{ulid}`:
//!
//! - `shop:web.01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `billing:worker.queue.01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//!
//! The owning project and service can be recovered from the ID alone, which
//! is what lets the reconciler attribute tasks it has never seen before.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
