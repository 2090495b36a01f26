//! Revision identifiers.
//!
//! A revision id pairs a generation (how many edits deep the revision is)
//! with a digest naming the concrete edit. Together they give a total order
//! across every revision of a document, which conflict resolution relies on
//! to pick a deterministic winner.

use crate::{error::Result, Error, Generation};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Identifier of a single document revision.
///
/// Ordering rules:
/// 1. Higher generation wins
/// 2. If generations are equal, lexicographically higher digest wins
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionId {
    /// Depth of this revision in the document's history (first revision is 1)
    pub generation: Generation,
    /// Content digest distinguishing sibling revisions
    pub digest: String,
}

impl RevisionId {
    /// Create a revision id from its parts.
    pub fn new(generation: Generation, digest: impl Into<String>) -> Self {
        Self {
            generation,
            digest: digest.into(),
        }
    }

    /// Id for the first revision of a document.
    pub fn first(digest: impl Into<String>) -> Self {
        Self::new(1, digest)
    }

    /// Id for a child of this revision.
    pub fn child(&self, digest: impl Into<String>) -> Self {
        Self::new(self.generation + 1, digest)
    }

    /// Generation a child of `parent` would get; 1 for a new document.
    pub fn next_generation(parent: Option<&RevisionId>) -> Generation {
        parent.map_or(1, |p| p.generation + 1)
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.digest)
    }
}

impl FromStr for RevisionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (generation, digest) = s
            .split_once('-')
            .ok_or_else(|| Error::InvalidRevisionId(s.to_string()))?;
        let generation: Generation = generation
            .parse()
            .map_err(|_| Error::InvalidRevisionId(s.to_string()))?;
        if generation == 0 || digest.is_empty() {
            return Err(Error::InvalidRevisionId(s.to_string()));
        }
        Ok(Self::new(generation, digest))
    }
}

impl Ord for RevisionId {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.generation.cmp(&other.generation) {
            Ordering::Equal => self.digest.cmp(&other.digest),
            other => other,
        }
    }
}

impl PartialOrd for RevisionId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_revision_is_generation_one() {
        let rev = RevisionId::first("abc");
        assert_eq!(rev.generation, 1);
        assert_eq!(rev.digest, "abc");
    }

    #[test]
    fn child_increments_generation() {
        let rev = RevisionId::first("abc");
        let child = rev.child("def");
        assert_eq!(child.generation, 2);
        assert_eq!(RevisionId::next_generation(Some(&child)), 3);
        assert_eq!(RevisionId::next_generation(None), 1);
    }

    #[test]
    fn ordering_by_generation() {
        let a = RevisionId::new(1, "zzz");
        let b = RevisionId::new(2, "aaa");
        assert!(a < b);
    }

    #[test]
    fn ordering_by_digest_when_generation_equal() {
        let a = RevisionId::new(3, "aaa");
        let b = RevisionId::new(3, "bbb");
        assert!(a < b);
    }

    #[test]
    fn display_and_parse() {
        let rev = RevisionId::new(12, "0badc0de");
        assert_eq!(rev.to_string(), "12-0badc0de");
        assert_eq!("12-0badc0de".parse::<RevisionId>().unwrap(), rev);
    }

    #[test]
    fn parse_rejects_garbage() {
        for bad in ["", "12", "x-abc", "0-abc", "3-"] {
            assert!(bad.parse::<RevisionId>().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn serialization_format() {
        let rev = RevisionId::new(2, "ab");
        let json = serde_json::to_string(&rev).unwrap();
        assert!(json.contains("generation"));
        assert!(json.contains("digest"));
    }
}
