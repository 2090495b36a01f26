//! # Harbor
//!
//! The concurrency and conflict-resolution layer of a local-first document
//! database, built on the [`harbor_engine`] storage contract.
//!
//! ## What lives here
//!
//! - **Saves under concurrency control**: [`Database::save_with_concurrency_control`]
//!   either overwrites concurrent changes or fails fast; a
//!   [`ConflictHandler`] can merge and retry instead.
//! - **Replication conflicts**: pulled revisions that branch from local
//!   history are resolved in the background by a [`ConflictResolver`]
//!   under the [`ResolverService`].
//! - **Replicator ordering**: a [`Replicator`] delivers status changes and
//!   per-document events in an order that never reports progress ahead of
//!   pending conflict resolutions.
//! - **Change notifications**: committed changes are coalesced into bounded
//!   [`DatabaseChange`] batches; [`LiveQuery`] keeps query results current.
//! - **Orderly close**: [`Database::close`] stops live queries and
//!   replicators and waits for them.
//!
//! ## Threading
//!
//! Each database serializes storage access behind one lock and runs its
//! background work on a runtime it owns. All listener callbacks run on a
//! single delivery queue per database, in the order they were posted, with
//! no lock held.
//!
//! ## Quick Start
//!
//! ```rust
//! use harbor::{Database, Document};
//! use serde_json::json;
//!
//! let db = Database::open_in_memory("notes").unwrap();
//!
//! let mut doc = Document::with_body("note-1", json!({"text": "hello"}));
//! db.save(&mut doc).unwrap();
//!
//! let loaded = db.get_document("note-1").unwrap().unwrap();
//! assert_eq!(loaded.get("text"), Some(&json!("hello")));
//!
//! db.close().unwrap();
//! ```

mod active;
pub mod config;
pub mod conflict;
mod database;
mod delivery;
pub mod document;
pub mod error;
mod executor;
pub mod live_query;
pub mod notifier;
pub mod replicator;
mod resolve;
pub mod save;
pub mod scheduler;
pub mod telemetry;

pub use config::{ConfigError, DatabaseConfig};
pub use conflict::{
    handler_fn, resolver_fn, BoxError, Conflict, ConflictHandler, ConflictResolver,
    DefaultConflictResolver,
};
pub use database::Database;
pub use document::{DatabaseId, Document};
pub use error::{ConflictCause, Error, Result};
pub use live_query::{LiveQuery, LiveQueryState, QueryChange};
pub use notifier::{DatabaseChange, DocumentChange, ListenerToken};
pub use replicator::{
    ActivityLevel, DocumentEnded, DocumentFlags, DocumentReplication, Progress,
    ReplicationEngine, Replicator, ReplicatorCallbacks, ReplicatorConfig, ReplicatorStatus,
};
pub use resolve::MAX_CONFLICT_RETRIES;
pub use save::ConcurrencyControl;
pub use scheduler::{ResolutionTask, ResolverService, ServiceState};

pub use harbor_engine::{MemoryStore, Query, QueryResults, Storage};
