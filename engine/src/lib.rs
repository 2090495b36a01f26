//! # Harbor Engine
//!
//! A deterministic, in-process revision store used as the storage layer
//! underneath the Harbor client.
//!
//! The client is written against the narrow [`Storage`] contract; this crate
//! defines that contract and ships [`MemoryStore`], a reference
//! implementation small enough to reason about in tests.
//!
//! ## Design Principles
//!
//! - **No IO**: documents live in memory; persistence is someone else's job
//! - **Deterministic**: revision ids are derived from content and sequence
//! - **Single-threaded**: callers serialize access; the store is only `Send`
//!
//! ## Core Concepts
//!
//! ### Revisions
//!
//! Every write produces an immutable [`Revision`] named by a [`RevisionId`]
//! (`generation-digest`). A write names the revision it is based on; if that
//! is no longer current the write fails with [`Error::Conflict`].
//!
//! ### Conflicts
//!
//! Revisions pulled from a remote peer that do not descend from the current
//! revision are kept as conflicting branches until
//! [`Storage::resolve_conflict`] folds them.
//!
//! ### Change observation
//!
//! Committed writes queue [`ChangeRecord`]s. An observer callback is fired
//! per commit; the changes themselves are pulled in origin-homogeneous
//! batches with [`Storage::read_changes`].
//!
//! ## Quick Start
//!
//! ```rust
//! use harbor_engine::{MemoryStore, PutRevision, Storage};
//! use serde_json::json;
//!
//! let mut store = MemoryStore::new("device_1");
//!
//! store.begin_transaction().unwrap();
//! let rev = store
//!     .put_revision(PutRevision::new("user_1", json!({"name": "Alice"}), None))
//!     .unwrap();
//! store.end_transaction(true).unwrap();
//!
//! assert_eq!(rev.generation(), 1);
//! assert_eq!(store.document_count(), 1);
//! ```

pub mod change;
pub mod error;
pub mod query;
pub mod revid;
pub mod revision;
pub mod storage;
pub mod store;

// Re-export main types at crate root
pub use change::{ChangeObserver, ChangeRecord, ObservedChanges};
pub use error::{Error, Result, ERROR_DOMAIN};
pub use query::{Predicate, Query, QueryResults, ResultRow};
pub use revid::RevisionId;
pub use revision::{contains_blob, Origin, Revision, RevisionFlags};
pub use storage::{MergedRevision, PutRevision, Storage};
pub use store::MemoryStore;

/// Type aliases for clarity
pub type DocumentId = String;
pub type NodeId = String;
pub type Generation = u64;
pub type Sequence = u64;
