use std::fs::{DirBuilder, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::Result;

/// Persists the resolved delegate list per ContainerID (spec.md §4.6) so a
/// later DEL can proceed even when the control plane is gone. Grounded on
/// the disk-backed IPAM store's owner-only file handling.
pub struct ScratchStore {
    data_dir: PathBuf,
}

impl ScratchStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        ScratchStore {
            data_dir: data_dir.into(),
        }
    }

    fn entry_path(&self, container_id: &str) -> PathBuf {
        self.data_dir.join(container_id)
    }

    /// `Save(containerID, bytes)`: ensure the data directory exists with
    /// owner-only permissions, write the bytes with owner-only read/write.
    pub fn save(&self, container_id: &str, bytes: &[u8]) -> Result<PathBuf> {
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&self.data_dir)?;

        let path = self.entry_path(container_id);
        let mut f = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)?;
        f.write_all(bytes)?;
        debug!("scratch store: saved {} bytes for {container_id}", bytes.len());
        Ok(path)
    }

    /// `Load(containerID)`: read and return the bytes plus the full path,
    /// or `None` if no entry exists.
    pub fn load(&self, container_id: &str) -> Result<Option<(PathBuf, Vec<u8>)>> {
        let path = self.entry_path(container_id);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some((path, bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// `Delete(path)`: unlink the file.
    fn unlink(path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Applies the `RetryDeleteOnError` deletion policy from spec.md §4.6:
    /// with the flag unset, the entry is removed unconditionally; with it
    /// set, the entry survives any rollback error other than one that
    /// looks like the state is already gone, so a later retry has
    /// something to consume.
    pub fn delete_after_rollback(
        &self,
        container_id: &str,
        retry_delete_on_error: bool,
        rollback_result: &Result<()>,
    ) -> Result<()> {
        let path = self.entry_path(container_id);

        if !retry_delete_on_error {
            return Self::unlink(&path);
        }

        match rollback_result {
            Ok(()) => Self::unlink(&path),
            Err(e) if e.looks_like_not_found() => Self::unlink(&path),
            Err(_) => {
                debug!("scratch store: keeping entry for {container_id}, rollback left recoverable state");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScratchStore::new(dir.path());
        store.save("container-a", b"[]").unwrap();

        let (path, bytes) = store.load("container-a").unwrap().unwrap();
        assert_eq!(bytes, b"[]");
        assert!(path.exists());
    }

    #[test]
    fn load_missing_entry_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScratchStore::new(dir.path());
        assert!(store.load("nope").unwrap().is_none());
    }

    #[test]
    fn delete_unconditional_when_retry_flag_unset() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScratchStore::new(dir.path());
        store.save("container-a", b"[]").unwrap();

        let rollback_result: Result<()> = Err(crate::error::NetAttachError::Plugin("boom".into()));
        store.delete_after_rollback("container-a", false, &rollback_result).unwrap();

        assert!(store.load("container-a").unwrap().is_none());
    }

    #[test]
    fn delete_kept_on_recoverable_error_when_retry_flag_set() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScratchStore::new(dir.path());
        store.save("container-a", b"[]").unwrap();

        let rollback_result: Result<()> = Err(crate::error::NetAttachError::Plugin("boom".into()));
        store.delete_after_rollback("container-a", true, &rollback_result).unwrap();

        assert!(store.load("container-a").unwrap().is_some());
    }

    #[test]
    fn delete_happens_on_not_found_error_when_retry_flag_set() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScratchStore::new(dir.path());
        store.save("container-a", b"[]").unwrap();

        let rollback_result: Result<()> =
            Err(crate::error::NetAttachError::Plugin("no such file or directory".into()));
        store.delete_after_rollback("container-a", true, &rollback_result).unwrap();

        assert!(store.load("container-a").unwrap().is_none());
    }
}
