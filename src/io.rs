//! Crash-safe file writes shared by the scanner and the peer

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const TEMP_SUFFIX: &str = ".skb-tmp";

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(TEMP_SUFFIX);
    path.with_file_name(name)
}

/// Write `content` to `path` atomically: sibling temp file, fsync, rename.
///
/// The destination is never observable in a partial state; on failure the
/// temp file is removed and the prior content (if any) survives. On Unix
/// the file ends up with `mode` when one is given.
pub fn write_atomic(path: &Path, content: &[u8], mode: Option<u32>) -> io::Result<()> {
    let temp = temp_path(path);
    let result = (|| {
        let mut file = File::create(&temp)?;
        file.write_all(content)?;
        file.sync_all()?;

        #[cfg(unix)]
        if let Some(mode) = mode {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&temp, fs::Permissions::from_mode(mode))?;
        }
        #[cfg(not(unix))]
        let _ = mode;

        fs::rename(&temp, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    result
}

/// Remove a file, treating "not found" as success.
pub fn remove_file_safe(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_atomic_creates_file() -> io::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("out.txt");

        write_atomic(&path, b"atomic content", None)?;

        assert_eq!(fs::read(&path)?, b"atomic content");
        assert!(!temp_path(&path).exists());
        Ok(())
    }

    #[test]
    fn test_write_atomic_replaces_existing() -> io::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("out.txt");
        fs::write(&path, b"old")?;

        write_atomic(&path, b"new", None)?;

        assert_eq!(fs::read(&path)?, b"new");
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_write_atomic_sets_mode() -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir()?;
        let path = dir.path().join("exec.sh");

        write_atomic(&path, b"#!/bin/sh\n", Some(0o755))?;

        let mode = fs::metadata(&path)?.permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        Ok(())
    }

    #[test]
    fn test_remove_file_safe_is_idempotent() -> io::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("gone.txt");
        fs::write(&path, b"x")?;

        remove_file_safe(&path)?;
        remove_file_safe(&path)?;
        assert!(!path.exists());
        Ok(())
    }
}
