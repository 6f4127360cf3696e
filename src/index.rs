//! Directory indices and their update/compare/merge algebra
//!
//! An [`Index`] holds three keyed collections of [`Summary`] records: the
//! current tree by path, historical parents by id, and deletion tombstones
//! by id. [`Index::update`] reconciles two scans of the same directory,
//! [`Index::compare`] produces the change list one peer requests from
//! another, and [`merge`] reconciles two peers' divergent indices through
//! their shared ancestry graph.
//!
//! All three collections are `BTreeMap`s: iteration order is the
//! lexicographic path (or id) order, which makes move detection and merge
//! output deterministic across platforms.

use crate::summary::Summary;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

/// Errors from index construction and mutation.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("path already indexed: {}", .0.display())]
    PathCollision(PathBuf),

    #[error("id already indexed: {0}")]
    IdCollision(Uuid),

    #[error("not indexed: {0}")]
    NotFound(String),
}

/// Errors from [`merge`].
#[derive(Error, Debug)]
pub enum MergeError {
    #[error("conflicting parent entries for id {0}")]
    ParentConflict(Uuid),

    #[error("no shared ancestry for files at {}", .0.display())]
    Unrelated(PathBuf),
}

/// The changes needed to bring one index up to date with another.
///
/// `additions` maps each changed or new path to a partial summary whose
/// `blocks` hold the remote fingerprint at changed positions and the `0`
/// sentinel where the local block can be reused. `deletions` lists paths
/// removed remotely with a matching tombstone.
#[derive(Debug, Clone, Default)]
pub struct Comparison {
    pub additions: BTreeMap<PathBuf, Summary>,
    pub deletions: Vec<PathBuf>,
}

/// Three disjoint-by-role views of one directory's history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    /// Current tree, keyed by path.
    pub files: BTreeMap<PathBuf, Summary>,
    /// Historical revisions retained for ancestry queries, keyed by id.
    pub parents: BTreeMap<Uuid, Summary>,
    /// Tombstones for removed files, keyed by id.
    pub deletions: BTreeMap<Uuid, Summary>,
}

impl Index {
    /// Build an index from current-tree summaries. Duplicate paths fail.
    pub fn new(summaries: impl IntoIterator<Item = Summary>) -> Result<Self, IndexError> {
        let mut index = Self::default();
        for s in summaries {
            index.add(s)?;
        }
        Ok(index)
    }

    /// Insert into `files`, rejecting duplicate paths.
    pub fn add(&mut self, summary: Summary) -> Result<(), IndexError> {
        if self.files.contains_key(&summary.path) {
            return Err(IndexError::PathCollision(summary.path));
        }
        self.files.insert(summary.path.clone(), summary);
        Ok(())
    }

    /// Insert into `parents`, rejecting duplicate ids.
    pub fn add_parent(&mut self, summary: Summary) -> Result<(), IndexError> {
        if self.parents.contains_key(&summary.id) {
            return Err(IndexError::IdCollision(summary.id));
        }
        self.parents.insert(summary.id, summary);
        Ok(())
    }

    /// Insert into `deletions`, rejecting duplicate ids.
    pub fn add_deletion(&mut self, summary: Summary) -> Result<(), IndexError> {
        if self.deletions.contains_key(&summary.id) {
            return Err(IndexError::IdCollision(summary.id));
        }
        self.deletions.insert(summary.id, summary);
        Ok(())
    }

    pub fn delete(&mut self, path: &Path) -> Result<Summary, IndexError> {
        self.files
            .remove(path)
            .ok_or_else(|| IndexError::NotFound(path.display().to_string()))
    }

    pub fn delete_parent(&mut self, id: Uuid) -> Result<Summary, IndexError> {
        self.parents
            .remove(&id)
            .ok_or_else(|| IndexError::NotFound(id.to_string()))
    }

    pub fn delete_deletion(&mut self, id: Uuid) -> Result<Summary, IndexError> {
        self.deletions
            .remove(&id)
            .ok_or_else(|| IndexError::NotFound(id.to_string()))
    }

    /// Path of the first current file whose blocks equal the query's, if
    /// any. Content identity only; ids are not consulted.
    pub fn contains(&self, summary: &Summary) -> Option<&Path> {
        self.files
            .iter()
            .find(|(_, s)| s.equals(summary))
            .map(|(path, _)| path.as_path())
    }

    /// Reconcile two scans of the same directory, `self` being the older.
    ///
    /// Detects modifications (new child summary, old moved to parents),
    /// moves (same blocks at a new path; first match in path order),
    /// deletions (tombstone) and creations. A new path claimed by a move
    /// is consumed: it is skipped by later move scans and by the creation
    /// pass, so a second old file with the same content becomes a
    /// deletion rather than a double claim.
    pub fn update(&self, newer: &Index) -> Index {
        let mut result = Index::default();
        let mut claimed: BTreeSet<&Path> = BTreeSet::new();

        for (path, s) in &self.files {
            if let Some(ns) = newer.files.get(path) {
                if s.equals(ns) {
                    result.files.insert(path.clone(), ns.clone());
                } else {
                    // Modified in place: chain the new revision to the old
                    let child = Summary::new(ns.id, Some(s.id), path.clone(), ns.blocks.clone());
                    result.files.insert(path.clone(), child);
                    result.parents.insert(s.id, s.clone());
                }
                continue;
            }

            // Path is gone; look for the content at a genuinely new path
            let moved = newer.files.iter().find(|(np, ns)| {
                !self.files.contains_key(np.as_path())
                    && !claimed.contains(np.as_path())
                    && ns.blocks == s.blocks
            });
            match moved {
                Some((np, ns)) => {
                    let child = Summary::new(ns.id, Some(s.id), np.clone(), ns.blocks.clone());
                    result.files.insert(np.clone(), child);
                    result.parents.insert(s.id, s.clone());
                    claimed.insert(np.as_path());
                }
                None => {
                    result.deletions.insert(s.id, s.clone());
                }
            }
        }

        // Newly created files
        for (path, ns) in &newer.files {
            if !result.files.contains_key(path) && !claimed.contains(path.as_path()) {
                result.files.insert(path.clone(), ns.clone());
            }
        }

        result
    }

    /// List the changes from `self` to `newer`, as seen by the peer that
    /// holds `self` and wants to match `newer`.
    ///
    /// A path missing remotely without a matching tombstone is ignored:
    /// absence alone is not evidence of deletion. Partial summaries for
    /// modified paths keep the remote id and parent so the caller can
    /// request blocks for the right file.
    pub fn compare(&self, newer: &Index) -> Comparison {
        let mut comparison = Comparison::default();

        for (path, s) in &self.files {
            if !newer.files.contains_key(path) && newer.deletions.contains_key(&s.id) {
                comparison.deletions.push(path.clone());
            }
        }

        for (path, ns) in &newer.files {
            match self.files.get(path) {
                Some(s) => {
                    let (diff, changed) = s.diff(ns);
                    // diff is blind to a removed tail, so a shrunk file
                    // must be surfaced by the length comparison
                    if changed || ns.blocks.len() < s.blocks.len() {
                        let partial = Summary::new(ns.id, ns.parent, path.clone(), diff);
                        comparison.additions.insert(path.clone(), partial);
                    }
                }
                None => {
                    comparison.additions.insert(path.clone(), ns.clone());
                }
            }
        }

        comparison
    }
}

/// Union of two summary maps keyed by id.
///
/// Entries sharing an id coalesce when they describe the same revision
/// (`is_same`). When they disagree, the union fails unless
/// `ignore_collisions` is set, in which case the second map's entry wins.
fn merge_summary_map(
    ignore_collisions: bool,
    first: &BTreeMap<Uuid, Summary>,
    second: &BTreeMap<Uuid, Summary>,
) -> Result<BTreeMap<Uuid, Summary>, MergeError> {
    let mut merged = first.clone();
    for (id, s) in second {
        match merged.get(id) {
            Some(existing) if existing.is_same(s) => {}
            Some(_) if !ignore_collisions => return Err(MergeError::ParentConflict(*id)),
            _ => {
                merged.insert(*id, s.clone());
            }
        }
    }
    Ok(merged)
}

/// Walk `descendant`'s parent chain through `graph`; true iff some step
/// reaches `ancestor`.
fn is_descendant(
    descendant: &Summary,
    ancestor: &Summary,
    graph: &BTreeMap<Uuid, Summary>,
) -> bool {
    let mut current = descendant.parent;
    while let Some(id) = current {
        if id == ancestor.id {
            return true;
        }
        current = graph.get(&id).and_then(|s| s.parent);
    }
    false
}

/// Whether two summaries share an ancestor reachable through `parents`.
fn common_root(s1: &Summary, s2: &Summary, parents: &BTreeMap<Uuid, Summary>) -> bool {
    if s1.parent.is_some() && s1.parent == s2.parent {
        return true;
    }

    let mut ancestors = BTreeSet::new();
    let mut current = s1.parent;
    while let Some(id) = current {
        ancestors.insert(id);
        current = parents.get(&id).and_then(|s| s.parent);
    }

    let mut current = s2.parent;
    while let Some(id) = current {
        if ancestors.contains(&id) {
            return true;
        }
        current = parents.get(&id).and_then(|s| s.parent);
    }
    false
}

/// Reconcile two peers' indices through their shared ancestry.
///
/// Symmetric: `merge(a, b)` equals `merge(b, a)`. Parents are unioned
/// strictly, tombstones loosely, and a tombstone whose id reappears in
/// the merged parents is suppressed. Files present on both sides resolve
/// by ancestry; divergent branches with a common root are preserved side
/// by side under `"{path}_{id}"` names; same-path files with no shared
/// history at all fail [`MergeError::Unrelated`].
pub fn merge(a: &Index, b: &Index) -> Result<Index, MergeError> {
    let mut result = Index {
        files: BTreeMap::new(),
        parents: merge_summary_map(false, &a.parents, &b.parents)?,
        deletions: merge_summary_map(true, &a.deletions, &b.deletions)?,
    };

    // A parent supersedes a stale tombstone
    let parents = &result.parents;
    result.deletions.retain(|id, _| !parents.contains_key(id));

    for (path, sa) in &a.files {
        if let Some(sb) = b.files.get(path) {
            if sa.id == sb.id {
                result.files.insert(path.clone(), sa.clone());
            } else if is_descendant(sa, sb, &a.parents) {
                result.files.insert(path.clone(), sa.clone());
            } else if is_descendant(sb, sa, &b.parents) {
                result.files.insert(path.clone(), sb.clone());
            } else if common_root(sa, sb, &result.parents) {
                // Concurrent edits of the same file: keep both branches
                for s in [sa, sb] {
                    let branch_path = branch_path(path, s.id);
                    let mut branch = s.clone();
                    branch.path = branch_path.clone();
                    result.files.insert(branch_path, branch);
                }
            } else {
                return Err(MergeError::Unrelated(path.clone()));
            }
        } else if !result.parents.contains_key(&sa.id) && !result.deletions.contains_key(&sa.id) {
            result.files.insert(path.clone(), sa.clone());
        }
    }

    for (path, sb) in &b.files {
        if a.files.contains_key(path) {
            continue;
        }
        if result.parents.contains_key(&sb.id) || result.deletions.contains_key(&sb.id) {
            continue;
        }
        result.files.insert(path.clone(), sb.clone());
    }

    Ok(result)
}

fn branch_path(path: &Path, id: Uuid) -> PathBuf {
    PathBuf::from(format!("{}_{}", path.display(), id))
}
