//! Content-Addressable Store (C5): a version-namespaced tree of transformed
//! artifacts on disk, keyed by module hash. Writes are atomic via a
//! temp-file-then-rename so concurrent writers never observe a half-written
//! file, and reads under one version never see bytes from another.

use crate::data::VersionHash;
use crate::error::CasError;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

pub struct Cas {
    root: PathBuf,
}

impl Cas {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, version: &VersionHash, module_hash: &str) -> PathBuf {
        self.root.join(&version.0).join(module_hash)
    }

    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn exists(&self, version: &VersionHash, module_hash: &str, name: &str) -> bool {
        tokio::fs::metadata(self.path_for(version, module_hash).join(name))
            .await
            .is_ok()
    }

    #[tracing::instrument(level = "trace", skip(self, bytes))]
    pub async fn write(
        &self,
        version: &VersionHash,
        module_hash: &str,
        name: &str,
        bytes: &[u8],
    ) -> Result<(), CasError> {
        let dir = self.path_for(version, module_hash);
        tokio::fs::create_dir_all(&dir).await?;

        let final_path = dir.join(name);
        let tmp_path = dir.join(format!(".{name}.{}.tmp", std::process::id()));

        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        drop(file);

        // Overwriting via rename makes concurrent writers of identical bytes
        // safe and avoids a reader ever observing a partial file.
        tokio::fs::rename(&tmp_path, &final_path).await?;
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn read(
        &self,
        version: &VersionHash,
        module_hash: &str,
        name: &str,
    ) -> Result<Option<Vec<u8>>, CasError> {
        let path = self.path_for(version, module_hash).join(name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove every version directory other than `keep`. Used by the `clean`
    /// CLI command to demonstrate that cache invalidation after a config
    /// change is free: the new version simply sees an empty directory and
    /// stale ones are reclaimed on demand rather than automatically.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn gc_except(&self, keep: &VersionHash) -> Result<Vec<PathBuf>, CasError> {
        let mut removed = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(removed),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name().to_string_lossy() == keep.0 {
                continue;
            }
            let path = entry.path();
            if path.is_dir() {
                ::remove_dir_all::remove_dir_all(&path)?;
                removed.push(path);
            }
        }
        Ok(removed)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cas = Cas::new(dir.path());
        let version = VersionHash("abc123".into());
        cas.write(&version, "modhash", "transformed.js", b"console.log(1)")
            .await
            .unwrap();
        let bytes = cas.read(&version, "modhash", "transformed.js").await.unwrap();
        assert_eq!(bytes, Some(b"console.log(1)".to_vec()));
    }

    #[tokio::test]
    async fn different_versions_never_share_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let cas = Cas::new(dir.path());
        let v1 = VersionHash("v1".into());
        let v2 = VersionHash("v2".into());
        cas.write(&v1, "modhash", "transformed.js", b"a").await.unwrap();
        assert_eq!(cas.read(&v2, "modhash", "transformed.js").await.unwrap(), None);
    }

    #[tokio::test]
    async fn gc_except_keeps_current_version() {
        let dir = tempfile::tempdir().unwrap();
        let cas = Cas::new(dir.path());
        let v1 = VersionHash("v1".into());
        let v2 = VersionHash("v2".into());
        cas.write(&v1, "m", "transformed.js", b"a").await.unwrap();
        cas.write(&v2, "m", "transformed.js", b"b").await.unwrap();
        let removed = cas.gc_except(&v2).await.unwrap();
        assert_eq!(removed.len(), 1);
        assert!(cas.read(&v1, "m", "transformed.js").await.unwrap().is_none());
        assert!(cas.read(&v2, "m", "transformed.js").await.unwrap().is_some());
    }
}
