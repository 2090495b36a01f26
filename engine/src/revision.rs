//! Revision types: immutable snapshots of a document body.

use crate::{DocumentId, Generation, RevisionId, Sequence};
use serde::{Deserialize, Serialize};

/// Origin of a revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Written by this process
    Local,
    /// Pulled in by replication
    Remote,
}

/// Flags stored alongside a revision body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionFlags {
    /// Revision is a tombstone
    pub deleted: bool,
    /// Body references at least one blob
    pub has_attachments: bool,
}

impl RevisionFlags {
    /// Flags for a tombstone.
    pub fn tombstone() -> Self {
        Self {
            deleted: true,
            has_attachments: false,
        }
    }
}

/// A single revision of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Revision {
    /// Document this revision belongs to
    pub doc_id: DocumentId,
    /// Identifier of this revision
    pub rev_id: RevisionId,
    /// Revision this one was derived from
    pub parent: Option<RevisionId>,
    /// Document body (empty object for tombstones)
    pub body: serde_json::Value,
    /// Revision flags
    pub flags: RevisionFlags,
    /// Database sequence at which this revision became current
    pub sequence: Sequence,
    /// Whether this revision was written locally or pulled
    pub origin: Origin,
}

impl Revision {
    /// Check if the revision is a tombstone.
    pub fn is_deleted(&self) -> bool {
        self.flags.deleted
    }

    /// Generation of this revision.
    pub fn generation(&self) -> Generation {
        self.rev_id.generation
    }
}

/// Returns true if any object inside `body` is a blob reference (`"@type": "blob"`).
pub fn contains_blob(body: &serde_json::Value) -> bool {
    match body {
        serde_json::Value::Object(map) => {
            map.get("@type").and_then(|t| t.as_str()) == Some("blob")
                || map.values().any(contains_blob)
        }
        serde_json::Value::Array(items) => items.iter().any(contains_blob),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn revision(flags: RevisionFlags) -> Revision {
        Revision {
            doc_id: "doc-1".into(),
            rev_id: RevisionId::new(3, "abc"),
            parent: Some(RevisionId::new(2, "def")),
            body: json!({"name": "Alice"}),
            flags,
            sequence: 7,
            origin: Origin::Local,
        }
    }

    #[test]
    fn accessors() {
        let rev = revision(RevisionFlags::default());
        assert_eq!(rev.generation(), 3);
        assert!(!rev.is_deleted());

        let tombstone = revision(RevisionFlags::tombstone());
        assert!(tombstone.is_deleted());
    }

    #[test]
    fn blob_detection() {
        assert!(!contains_blob(&json!({"name": "Alice"})));
        assert!(contains_blob(
            &json!({"avatar": {"@type": "blob", "digest": "sha1-xyz"}})
        ));
        assert!(contains_blob(
            &json!({"photos": [{"x": 1}, {"@type": "blob", "length": 3}]})
        ));
        assert!(!contains_blob(&json!({"@type": "not-a-blob"})));
    }

    #[test]
    fn serialization_roundtrip() {
        let rev = revision(RevisionFlags::default());
        let json = serde_json::to_string(&rev).unwrap();
        assert!(json.contains("revId"));
        let parsed: Revision = serde_json::from_str(&json).unwrap();
        assert_eq!(rev, parsed);
    }
}
