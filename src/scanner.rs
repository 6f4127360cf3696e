//! Local directory scanning and index persistence
//!
//! The scanner walks the root, slices and fingerprints every regular file
//! in parallel, and builds a fresh [`Index`] keyed by root-relative path.
//! Paired with the previously persisted index, [`Index::update`] yields
//! the successor index that gets persisted back to
//! `<root>/.sakaban/sakaban.json`.

use crate::block::slice_file;
use crate::index::{Index, IndexError};
use crate::io::write_atomic;
use crate::summary::Summary;
use rayon::prelude::*;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::warn;

/// Sentinel directory holding the persisted index and roster.
pub const INDEX_DIR: &str = ".sakaban";
/// Persisted index file name inside [`INDEX_DIR`].
pub const INDEX_FILE: &str = "sakaban.json";

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("invalid persisted index: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Path of the persisted index under `root`.
pub fn index_path(root: &Path) -> PathBuf {
    root.join(INDEX_DIR).join(INDEX_FILE)
}

/// Load the persisted index, or `None` when the root has never been
/// scanned.
pub fn load_index(root: &Path) -> Result<Option<Index>, ScanError> {
    let raw = match fs::read(index_path(root)) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_slice(&raw)?))
}

/// Persist `index` under `root` atomically.
pub fn store_index(root: &Path, index: &Index) -> Result<(), ScanError> {
    fs::create_dir_all(root.join(INDEX_DIR))?;
    let json = serde_json::to_vec_pretty(index)?;
    write_atomic(&index_path(root), &json, None)?;
    Ok(())
}

/// Walk `root` and summarize every regular file under a fresh id.
///
/// The sentinel directory is skipped. Files that cannot be read are
/// logged and left out rather than failing the whole scan.
pub fn scan(root: &Path) -> Result<Index, ScanError> {
    if !root.is_dir() {
        return Err(ScanError::NotADirectory(root.to_path_buf()));
    }

    let mut builder = ignore::WalkBuilder::new(root);
    builder
        .hidden(false)
        .git_ignore(true)
        .git_exclude(true)
        .threads(std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1));

    let mut overrides = ignore::overrides::OverrideBuilder::new(root);
    overrides
        .add(&format!("!{INDEX_DIR}"))
        .expect("static exclude pattern");
    if let Ok(overrides) = overrides.build() {
        builder.overrides(overrides);
    }

    let walker = builder.build_parallel();
    let paths = Mutex::new(Vec::with_capacity(1024));
    walker.run(|| {
        Box::new(|entry| {
            if let Ok(entry) = entry {
                if entry.file_type().is_some_and(|t| t.is_file()) {
                    paths.lock().unwrap().push(entry.path().to_path_buf());
                }
            }
            ignore::WalkState::Continue
        })
    });
    let paths = paths.into_inner().unwrap();

    // Fingerprint in parallel; a file that vanished mid-scan is skipped
    let summaries: Vec<Option<Summary>> = paths
        .par_iter()
        .map(|path| {
            let rel = path.strip_prefix(root).unwrap_or(path);
            match slice_file(path) {
                Ok(blocks) => Some(Summary::of_file(rel, &blocks)),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable file");
                    None
                }
            }
        })
        .collect();

    Ok(Index::new(summaries.into_iter().flatten())?)
}

/// One rescan of a root: the persisted index and the freshly scanned one.
#[derive(Debug)]
pub struct Scanner {
    root: PathBuf,
    pub old_index: Index,
    pub new_index: Index,
}

impl Scanner {
    /// Scan `root`, loading the previously persisted index when present.
    pub fn new(root: &Path) -> Result<Self, ScanError> {
        let old_index = load_index(root)?.unwrap_or_default();
        let new_index = scan(root)?;
        Ok(Self { root: root.to_path_buf(), old_index, new_index })
    }

    /// The successor index for this rescan.
    pub fn updated(&self) -> Index {
        self.old_index.update(&self.new_index)
    }

    /// Compute the successor index and persist it.
    pub fn commit(&self) -> Result<Index, ScanError> {
        let updated = self.updated();
        store_index(&self.root, &updated)?;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{fingerprint, BLOCK_SIZE};
    use tempfile::tempdir;

    #[test]
    fn test_scan_summarizes_relative_paths() -> Result<(), ScanError> {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"alpha")?;
        fs::create_dir(dir.path().join("sub"))?;
        fs::write(dir.path().join("sub/b.txt"), b"beta")?;

        let index = scan(dir.path())?;
        assert_eq!(index.files.len(), 2);

        let a = &index.files[&PathBuf::from("a.txt")];
        assert_eq!(a.blocks, vec![fingerprint(b"alpha")]);
        assert_eq!(a.parent, None);
        assert!(index.files.contains_key(&PathBuf::from("sub/b.txt")));
        Ok(())
    }

    #[test]
    fn test_scan_skips_sentinel_dir() -> Result<(), ScanError> {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("real.txt"), b"keep")?;
        fs::create_dir(dir.path().join(INDEX_DIR))?;
        fs::write(dir.path().join(INDEX_DIR).join(INDEX_FILE), b"{}")?;

        let index = scan(dir.path())?;
        assert_eq!(index.files.len(), 1);
        assert!(index.files.contains_key(&PathBuf::from("real.txt")));
        Ok(())
    }

    #[test]
    fn test_scan_empty_file_has_no_blocks() -> Result<(), ScanError> {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("empty"), b"")?;

        let index = scan(dir.path())?;
        assert!(index.files[&PathBuf::from("empty")].blocks.is_empty());
        Ok(())
    }

    #[test]
    fn test_scan_multi_block_file() -> Result<(), ScanError> {
        let dir = tempdir().unwrap();
        let data = vec![0x5Au8; BLOCK_SIZE + 10];
        fs::write(dir.path().join("big.bin"), &data)?;

        let index = scan(dir.path())?;
        let s = &index.files[&PathBuf::from("big.bin")];
        assert_eq!(s.blocks.len(), 2);
        assert_eq!(s.blocks[0], fingerprint(&data[..BLOCK_SIZE]));
        assert_eq!(s.blocks[1], fingerprint(&data[BLOCK_SIZE..]));
        Ok(())
    }

    #[test]
    fn test_scan_rejects_non_directory() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("f");
        fs::write(&file, b"x").unwrap();
        assert!(matches!(scan(&file), Err(ScanError::NotADirectory(_))));
    }

    #[test]
    fn test_index_persistence_round_trip() -> Result<(), ScanError> {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("f.txt"), b"content")?;

        assert!(load_index(dir.path())?.is_none());

        let index = scan(dir.path())?;
        store_index(dir.path(), &index)?;
        assert_eq!(load_index(dir.path())?, Some(index));
        Ok(())
    }

    #[test]
    fn test_rescan_links_revisions_and_persists() -> Result<(), ScanError> {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("f.txt"), b"first")?;

        let first = Scanner::new(dir.path())?.commit()?;
        let original = first.files[&PathBuf::from("f.txt")].clone();

        fs::write(dir.path().join("f.txt"), b"second")?;
        let second = Scanner::new(dir.path())?.commit()?;

        let revised = &second.files[&PathBuf::from("f.txt")];
        assert_eq!(revised.parent, Some(original.id));
        assert_eq!(revised.blocks, vec![fingerprint(b"second")]);
        assert_eq!(second.parents[&original.id], original);
        Ok(())
    }

    #[test]
    fn test_rescan_records_deletion() -> Result<(), ScanError> {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("doomed.txt"), b"bye")?;

        let first = Scanner::new(dir.path())?.commit()?;
        let doomed = first.files[&PathBuf::from("doomed.txt")].clone();

        fs::remove_file(dir.path().join("doomed.txt"))?;
        let second = Scanner::new(dir.path())?.commit()?;

        assert!(second.files.is_empty());
        assert_eq!(second.deletions[&doomed.id], doomed);
        Ok(())
    }

    #[test]
    fn test_rescan_detects_move() -> Result<(), ScanError> {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("old_name"), b"same bytes")?;

        let first = Scanner::new(dir.path())?.commit()?;
        let original = first.files[&PathBuf::from("old_name")].clone();

        fs::rename(dir.path().join("old_name"), dir.path().join("new_name"))?;
        let second = Scanner::new(dir.path())?.commit()?;

        let moved = &second.files[&PathBuf::from("new_name")];
        assert_eq!(moved.parent, Some(original.id));
        assert!(second.deletions.is_empty());
        Ok(())
    }
}
