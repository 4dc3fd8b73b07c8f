//! Artifact storage collaborator.
//!
//! The reconciliation module only ever talks to an [`ArtifactStore`];
//! how received bytes become a usable object (validation, indexing,
//! format checks) is the embedding application's business. A plain
//! filesystem-backed implementation is provided as the reference and
//! for tests.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::{Result, SyncError};

/// Narrow interface to the artifact storage/validation subsystem.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Names of all stored artifacts (non-directory entries only).
    async fn list_names(&self) -> Result<Vec<String>>;

    /// Size in bytes of a named artifact, `None` if absent.
    async fn size_of(&self, name: &str) -> Result<Option<u64>>;

    /// Full contents of a named artifact, `None` if absent.
    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Delete a named artifact. Deleting an absent artifact is not an
    /// error.
    async fn remove(&self, name: &str) -> Result<()>;

    /// Validate and persist received bytes under the given name. An
    /// error here is a local validation failure: the caller reports it
    /// and discards the artifact, but the wire exchange is unaffected.
    async fn install(&self, name: &str, bytes: &[u8]) -> Result<()>;
}

/// Filesystem-backed artifact store: one artifact per file in a single
/// directory, no validation beyond what the filesystem enforces.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(SyncError::NotADirectory(root));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn list_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| SyncError::io_with_path(e, &self.root))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SyncError::io_with_path(e, &self.root))?
        {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(raw) => {
                    tracing::warn!("Skipping artifact with non-UTF-8 name: {:?}", raw);
                }
            }
        }
        names.sort();
        Ok(names)
    }

    async fn size_of(&self, name: &str) -> Result<Option<u64>> {
        match tokio::fs::metadata(self.path_of(name)).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::io_with_path(e, self.path_of(name))),
        }
    }

    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_of(name)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::io_with_path(e, self.path_of(name))),
        }
    }

    async fn remove(&self, name: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_of(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::io_with_path(e, self.path_of(name))),
        }
    }

    async fn install(&self, name: &str, bytes: &[u8]) -> Result<()> {
        // Write to a temp name first so a crash mid-write never leaves
        // a plausible-looking partial artifact.
        let tmp = self.path_of(&format!("{}.part", name));
        let dest = self.path_of(name);
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| SyncError::io_with_path(e, &tmp))?;
        tokio::fs::rename(&tmp, &dest)
            .await
            .map_err(|e| SyncError::io_with_path(e, &dest))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store_with(files: &[(&str, &[u8])]) -> (TempDir, FsArtifactStore) {
        let dir = TempDir::new().unwrap();
        for (name, bytes) in files {
            std::fs::write(dir.path().join(name), bytes).unwrap();
        }
        let store = FsArtifactStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_list_skips_directories() {
        let (dir, store) = store_with(&[("a.msch", b"aa"), ("b.msch", b"bb")]).await;
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let names = store.list_names().await.unwrap();
        assert_eq!(names, vec!["a.msch", "b.msch"]);
    }

    #[tokio::test]
    async fn test_size_and_read() {
        let (_dir, store) = store_with(&[("a.msch", b"abc")]).await;
        assert_eq!(store.size_of("a.msch").await.unwrap(), Some(3));
        assert_eq!(store.size_of("missing").await.unwrap(), None);
        assert_eq!(store.read("a.msch").await.unwrap(), Some(b"abc".to_vec()));
        assert_eq!(store.read("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_install_then_read_back() {
        let (_dir, store) = store_with(&[]).await;
        store.install("new.msch", b"payload").await.unwrap();
        assert_eq!(
            store.read("new.msch").await.unwrap(),
            Some(b"payload".to_vec())
        );
        // No stray temp file left behind.
        assert_eq!(store.list_names().await.unwrap(), vec!["new.msch"]);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let (_dir, store) = store_with(&[("a.msch", b"aa")]).await;
        store.remove("a.msch").await.unwrap();
        store.remove("a.msch").await.unwrap();
        assert_eq!(store.size_of("a.msch").await.unwrap(), None);
    }

    #[test]
    fn test_new_rejects_non_directory() {
        assert!(matches!(
            FsArtifactStore::new("/nonexistent/path/nowhere"),
            Err(SyncError::NotADirectory(_))
        ));
    }
}
