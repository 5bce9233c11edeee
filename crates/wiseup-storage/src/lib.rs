//! # wiseup-storage
//!
//! The authoritative store is the durable row store behind the cache tiers and
//! the batch writer. It is an external collaborator: the session core only
//! assumes single-row atomicity, so every operation here touches one row.
//!
//! - [`AuthoritativeStore`]: get/put/delete plus compare-and-put on the row
//!   version and idempotent single-row batch application
//! - [`MemoryStore`]: in-process backend with fault injection, used for
//!   single-node deployments and tests
//!
//! ```ignore
//! use wiseup_storage::{AuthoritativeStore, StoreError};
//!
//! async fn load_user(store: &dyn AuthoritativeStore, id: &str) -> Result<serde_json::Value, StoreError> {
//!     store
//!         .get("users", id)
//!         .await?
//!         .map(|row| row.value)
//!         .ok_or_else(|| StoreError::not_found("users", id))
//! }
//! ```

mod error;
mod memory;
mod traits;
mod types;

pub use error::StoreError;
pub use memory::{AppliedOperation, MemoryStore};
pub use traits::{AuthoritativeStore, DynStore};
pub use types::{BatchOutcome, MutationBatch, RowOperation, StoredRow, row_key};
