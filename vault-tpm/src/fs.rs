//! File helpers shared by the ledger and blob stores

use crate::error::{TpmError, TpmResult};
use std::ffi::OsString;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// `path` with `suffix` appended to its final component (`a/b` + `.prv` = `a/b.prv`)
pub(crate) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Directory holding `path`; bare file names live in the current directory
pub(crate) fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Contents written and synced to a uniquely named temp file in the
/// directory of `path`, ready to be renamed over it with [`commit`].
///
/// The temp file is deleted if it is dropped uncommitted.
pub(crate) fn stage(path: &Path, contents: &[u8]) -> TpmResult<NamedTempFile> {
    let dir = parent_dir(path);
    let mut temp = NamedTempFile::new_in(&dir).map_err(|e| TpmError::storage(&dir, e))?;
    temp.write_all(contents)
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|e| TpmError::storage(temp.path(), e))?;
    Ok(temp)
}

/// Atomically rename a staged file over `path`
pub(crate) fn commit(temp: NamedTempFile, path: &Path) -> TpmResult<()> {
    temp.persist(path)
        .map(|_| ())
        .map_err(|e| TpmError::storage(path, e.error))
}

/// Replace `path` atomically: a crash leaves either the old or the new
/// contents, never a partial file
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> TpmResult<()> {
    commit(stage(path, contents)?, path)
}

/// Remove a file; returns whether it existed
pub(crate) fn remove_if_exists(path: &Path) -> TpmResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(TpmError::storage(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_suffix_keeps_existing_extension() {
        assert_eq!(
            with_suffix(Path::new("/var/vault/unseal.key"), ".prv"),
            PathBuf::from("/var/vault/unseal.key.prv")
        );
    }

    #[test]
    fn test_parent_dir() {
        assert_eq!(parent_dir(Path::new("secret")), PathBuf::from("."));
        assert_eq!(parent_dir(Path::new("/a/b/secret")), PathBuf::from("/a/b"));
    }

    #[test]
    fn test_write_atomic_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("record");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1, "no temp files left behind");

        assert!(remove_if_exists(&path).unwrap());
        assert!(!remove_if_exists(&path).unwrap());
    }

    #[test]
    fn test_uncommitted_stage_leaves_target_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("record");
        write_atomic(&path, b"old").unwrap();

        let staged = stage(&path, b"new").unwrap();
        drop(staged);
        assert_eq!(fs::read(&path).unwrap(), b"old");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_commit_onto_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("occupied");
        fs::create_dir(&path).unwrap();

        let err = write_atomic(&path, b"x").unwrap_err();
        assert!(matches!(err, TpmError::Storage { .. }));
        assert!(path.is_dir());
    }
}
