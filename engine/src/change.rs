//! Change records produced by committed writes.
//!
//! Every committed revision appends one [`ChangeRecord`] to the store's
//! observer queue. Consumers pull them back out in bounded, origin-homogeneous
//! batches via [`crate::Storage::read_changes`].

use crate::{DocumentId, RevisionId, Sequence};
use serde::{Deserialize, Serialize};

/// Callback fired once per commit that produced changes.
///
/// Runs on the committing thread while the store is still borrowed, so it
/// must only signal; reading the changes happens later.
pub type ChangeObserver = Box<dyn Fn() + Send + Sync>;

/// One committed change to one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    /// Changed document
    pub doc_id: DocumentId,
    /// Revision that became current
    pub rev_id: RevisionId,
    /// Sequence assigned to the change
    pub sequence: Sequence,
    /// True if the change came from outside this process (replication)
    pub external: bool,
}

/// A batch of change records sharing the same origin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservedChanges {
    /// Origin shared by every record in the batch
    pub external: bool,
    /// Records in commit order
    pub changes: Vec<ChangeRecord>,
}

impl ObservedChanges {
    /// Number of records in the batch.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// True when the observer queue was drained.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Document ids in commit order.
    pub fn doc_ids(&self) -> impl Iterator<Item = &DocumentId> {
        self.changes.iter().map(|c| &c.doc_id)
    }
}
