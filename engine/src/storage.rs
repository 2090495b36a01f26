//! The storage contract the client layer is written against.
//!
//! Implementations provide transactional revision storage for a single
//! database. They are not required to be thread-safe beyond `Send`: callers
//! serialize every access behind one database-wide lock.

use crate::{
    error::Result, ChangeObserver, DocumentId, ObservedChanges, Query, QueryResults, Revision,
    RevisionFlags, RevisionId, Sequence,
};

/// Request to create or update a document revision.
#[derive(Debug, Clone, PartialEq)]
pub struct PutRevision {
    /// Target document
    pub doc_id: DocumentId,
    /// New body (ignored for tombstones)
    pub body: serde_json::Value,
    /// Revision the write is based on; `None` creates the document
    pub parent: Option<RevisionId>,
    /// Flags for the new revision
    pub flags: RevisionFlags,
}

impl PutRevision {
    /// Write `body` on top of `parent`.
    pub fn new(
        doc_id: impl Into<DocumentId>,
        body: serde_json::Value,
        parent: Option<RevisionId>,
    ) -> Self {
        let flags = RevisionFlags {
            deleted: false,
            has_attachments: crate::revision::contains_blob(&body),
        };
        Self {
            doc_id: doc_id.into(),
            body,
            parent,
            flags,
        }
    }

    /// Write a tombstone on top of `parent`.
    pub fn tombstone(doc_id: impl Into<DocumentId>, parent: Option<RevisionId>) -> Self {
        Self {
            doc_id: doc_id.into(),
            body: serde_json::Value::Object(Default::default()),
            parent,
            flags: RevisionFlags::tombstone(),
        }
    }
}

/// Content folded onto the winning branch when a conflict is resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedRevision {
    pub body: serde_json::Value,
    pub flags: RevisionFlags,
}

/// Transactional revision storage for one database.
pub trait Storage: Send {
    /// Open a (possibly nested) transaction.
    fn begin_transaction(&mut self) -> Result<()>;

    /// Close the innermost transaction. Only the outermost call commits or
    /// rolls back; a nested rollback poisons the whole transaction.
    fn end_transaction(&mut self, commit: bool) -> Result<()>;

    /// True while a transaction is open.
    fn in_transaction(&self) -> bool;

    /// Current revision of a document, tombstones included.
    fn get_document(&self, doc_id: &str) -> Result<Option<Revision>>;

    /// Create or update a revision. Fails with [`crate::Error::Conflict`]
    /// when `parent` is not the document's current revision.
    fn put_revision(&mut self, request: PutRevision) -> Result<Revision>;

    /// Record a revision pulled from a remote peer, outside the local
    /// revision chain. Becomes current when it descends from the current
    /// revision, otherwise it is kept as a conflicting branch.
    fn insert_remote_revision(
        &mut self,
        doc_id: &str,
        body: serde_json::Value,
        deleted: bool,
        parent: Option<RevisionId>,
    ) -> Result<Revision>;

    /// The next unresolved conflicting branch of a document, if any.
    fn next_conflicting_revision(&self, doc_id: &str) -> Result<Option<Revision>>;

    /// Fold a conflict so that `winning` becomes the recorded branch and
    /// `losing` (the current local revision) is closed. `merged`, when given,
    /// is written as a child of `winning`.
    fn resolve_conflict(
        &mut self,
        doc_id: &str,
        winning: &RevisionId,
        losing: &RevisionId,
        merged: Option<MergedRevision>,
    ) -> Result<Revision>;

    /// Install or clear the change observer.
    fn set_change_observer(&mut self, observer: Option<ChangeObserver>);

    /// Pull up to `max` pending change records of one origin.
    fn read_changes(&mut self, max: usize) -> ObservedChanges;

    /// Run a query against current revisions.
    fn execute_query(&self, query: &Query) -> Result<QueryResults>;

    /// Re-run the query behind `previous`; `None` if the rows are unchanged.
    fn refresh_query(&self, previous: &QueryResults) -> Result<Option<QueryResults>>;

    /// Number of live (non-deleted) documents.
    fn document_count(&self) -> usize;

    /// Sequence of the most recent committed change.
    fn last_sequence(&self) -> Sequence;
}
