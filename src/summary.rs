//! Content-addressed file summaries
//!
//! A [`Summary`] is the marshaled form of one file's identity and content:
//! a random 128-bit id, an optional parent id linking to the previous
//! revision, the path on the producing host, and the ordered block
//! fingerprints. Summaries are what indices store, what peers exchange,
//! and what gets persisted to disk.

use crate::block::Block;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Description of one file at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub id: Uuid,
    /// Previous revision of this file, if any. Rendered as the empty
    /// string in JSON when absent.
    #[serde(with = "nil_parent")]
    pub parent: Option<Uuid>,
    pub path: PathBuf,
    pub blocks: Vec<u64>,
}

impl Summary {
    pub fn new(id: Uuid, parent: Option<Uuid>, path: PathBuf, blocks: Vec<u64>) -> Self {
        Self { id, parent, path, blocks }
    }

    /// Summarize a sliced file under a fresh id with no parent.
    pub fn of_file(path: &Path, blocks: &[Block]) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent: None,
            path: path.to_path_buf(),
            blocks: blocks.iter().map(Block::fingerprint).collect(),
        }
    }

    /// Content equality: equal-length, pairwise-equal block fingerprints.
    pub fn equals(&self, other: &Summary) -> bool {
        self.blocks == other.blocks
    }

    /// Content equality plus equal id and parent.
    pub fn is_same(&self, other: &Summary) -> bool {
        self.id == other.id && self.parent == other.parent && self.equals(other)
    }

    /// Element-wise comparison of block fingerprints, `self` being the
    /// older revision.
    ///
    /// The result has `new.blocks.len()` entries: position `i` holds
    /// `new.blocks[i]` when it differs from `self.blocks[i]` (or when
    /// `self` has no block `i`), and `0` otherwise. `0` is the wire
    /// sentinel for "unchanged, reuse local". The flag is true iff any
    /// position differs; a removed tail is invisible here and callers
    /// that care about shrinkage must compare lengths themselves.
    pub fn diff(&self, new: &Summary) -> (Vec<u64>, bool) {
        let mut changed = false;
        let diff = new
            .blocks
            .iter()
            .enumerate()
            .map(|(i, &b)| {
                if self.blocks.get(i) == Some(&b) {
                    0
                } else {
                    changed = true;
                    b
                }
            })
            .collect();
        (diff, changed)
    }
}

/// Serde adapter rendering an absent parent as the empty string, matching
/// the persisted index layout. The all-zero uuid reads back as absent.
mod nil_parent {
    use serde::{Deserialize, Deserializer, Serializer};
    use uuid::Uuid;

    pub fn serialize<S: Serializer>(parent: &Option<Uuid>, ser: S) -> Result<S::Ok, S::Error> {
        match parent {
            Some(id) => ser.collect_str(id),
            None => ser.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Uuid>, D::Error> {
        let raw = String::deserialize(de)?;
        if raw.is_empty() {
            return Ok(None);
        }
        let id = raw.parse::<Uuid>().map_err(serde::de::Error::custom)?;
        Ok(if id.is_nil() { None } else { Some(id) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(blocks: Vec<u64>) -> Summary {
        Summary::new(Uuid::new_v4(), None, PathBuf::from("/f"), blocks)
    }

    #[test]
    fn test_reflexive_identity() {
        let s = summary(vec![1, 2, 3]);
        assert!(s.equals(&s));
        assert!(s.is_same(&s));
    }

    #[test]
    fn test_equals_is_content_only() {
        let a = summary(vec![1, 2]);
        let mut b = summary(vec![1, 2]);
        b.path = PathBuf::from("/elsewhere");
        assert!(a.equals(&b));
        assert!(!a.is_same(&b), "distinct ids are not the same file");
    }

    #[test]
    fn test_is_same_requires_parent() {
        let a = summary(vec![1]);
        let mut b = a.clone();
        b.parent = Some(Uuid::new_v4());
        assert!(a.equals(&b));
        assert!(!a.is_same(&b));
    }

    #[test]
    fn test_diff_of_self_is_all_zeros() {
        let s = summary(vec![10, 20, 30]);
        let (diff, changed) = s.diff(&s);
        assert_eq!(diff, vec![0, 0, 0]);
        assert!(!changed);
    }

    #[test]
    fn test_diff_reports_changed_positions() {
        let old = summary(vec![1, 2, 3]);
        let new = summary(vec![1, 9, 3]);
        let (diff, changed) = old.diff(&new);
        assert_eq!(diff, vec![0, 9, 0]);
        assert!(changed);
    }

    #[test]
    fn test_diff_grown_file() {
        let old = summary(vec![1]);
        let new = summary(vec![1, 7, 8]);
        let (diff, changed) = old.diff(&new);
        assert_eq!(diff, vec![0, 7, 8]);
        assert!(changed);
    }

    #[test]
    fn test_diff_is_blind_to_a_removed_tail() {
        // Every emitted position matches, so the flag stays false even
        // though the file shrank; length changes are the caller's to spot
        let old = summary(vec![1, 2, 3]);
        let new = summary(vec![1, 2]);
        let (diff, changed) = old.diff(&new);
        assert_eq!(diff, vec![0, 0]);
        assert!(!changed);
    }

    #[test]
    fn test_json_shape() {
        let id: Uuid = "9b2f0b86-72f1-4a9c-8f3c-6a1f6b7f8d90".parse().unwrap();
        let s = Summary::new(id, None, PathBuf::from("/dir/f"), vec![5, 0, 7]);
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": "9b2f0b86-72f1-4a9c-8f3c-6a1f6b7f8d90",
                "parent": "",
                "path": "/dir/f",
                "blocks": [5, 0, 7],
            })
        );
    }

    #[test]
    fn test_json_round_trip_with_parent() {
        let mut s = summary(vec![1, 2]);
        s.parent = Some(Uuid::new_v4());
        let json = serde_json::to_string(&s).unwrap();
        let back: Summary = serde_json::from_str(&json).unwrap();
        assert!(s.is_same(&back));
        assert_eq!(s, back);
    }

    #[test]
    fn test_nil_parent_reads_as_absent() {
        let json = format!(
            r#"{{"id":"{}","parent":"{}","path":"/f","blocks":[]}}"#,
            Uuid::new_v4(),
            Uuid::nil(),
        );
        let s: Summary = serde_json::from_str(&json).unwrap();
        assert_eq!(s.parent, None);
    }

    #[test]
    fn test_of_file_fingerprints_blocks() {
        let blocks = vec![Block::new(b"one".to_vec()), Block::new(b"two".to_vec())];
        let s = Summary::of_file(Path::new("/f"), &blocks);
        assert_eq!(s.blocks, vec![blocks[0].fingerprint(), blocks[1].fingerprint()]);
        assert_eq!(s.parent, None);
        assert!(!s.id.is_nil());
    }
}
