//! Content upload seam and its filesystem backend.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use gits_core::OwnerId;
use tracing::{debug, info};

use crate::error::{Result, SchedulerError};

const FILE_SCHEME: &str = "file://";

/// Stores change content before its job is written and hands back an
/// opaque reference the executor can resolve later.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn put(&self, owner: &OwnerId, filename: &str, bytes: &[u8]) -> Result<String>;

    async fn get(&self, content_ref: &str) -> Result<Vec<u8>>;

    /// Remove stored content. Removing something already gone is success.
    async fn remove(&self, content_ref: &str) -> Result<()>;
}

/// Writes under `<root>/<owner>/changes-<unix_ts>-<n>/<filename>` and
/// returns `file://` references.
pub struct FsContentStore {
    root: PathBuf,
    seq: AtomicU64,
}

impl FsContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a reference back to a path, refusing anything outside `root`.
    fn resolve(&self, content_ref: &str) -> Result<PathBuf> {
        let path = content_ref
            .strip_prefix(FILE_SCHEME)
            .map(PathBuf::from)
            .ok_or_else(|| SchedulerError::Upload(format!("not a file reference: {content_ref}")))?;
        let inside = path.starts_with(&self.root)
            && !path
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir));
        if !inside {
            return Err(SchedulerError::Upload(format!(
                "reference outside content root: {content_ref}"
            )));
        }
        Ok(path)
    }
}

/// Owners are used verbatim as a directory name when that is safe,
/// hex-encoded otherwise.
fn owner_segment(owner: &OwnerId) -> String {
    let s = owner.as_str();
    let safe = !s.is_empty()
        && s != "."
        && s != ".."
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if safe {
        s.to_string()
    } else {
        format!("x-{}", hex::encode(s))
    }
}

/// A bare file name: no separators, no dot segments.
pub fn is_safe_filename(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 255
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

#[async_trait]
impl ContentStore for FsContentStore {
    async fn put(&self, owner: &OwnerId, filename: &str, bytes: &[u8]) -> Result<String> {
        if !is_safe_filename(filename) {
            return Err(SchedulerError::Upload(format!("unsafe filename: {filename:?}")));
        }

        let n = self.seq.fetch_add(1, Ordering::Relaxed);
        let dir = self
            .root
            .join(owner_segment(owner))
            .join(format!("changes-{}-{n}", Utc::now().timestamp()));
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| SchedulerError::Upload(format!("{}: {e}", dir.display())))?;

        let path = dir.join(filename);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| SchedulerError::Upload(format!("{}: {e}", path.display())))?;

        let content_ref = format!("{FILE_SCHEME}{}", path.display());
        info!(owner = %owner, content_ref = %content_ref, size = bytes.len(), "content stored");
        Ok(content_ref)
    }

    async fn get(&self, content_ref: &str) -> Result<Vec<u8>> {
        let path = self.resolve(content_ref)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| SchedulerError::Upload(format!("{}: {e}", path.display())))
    }

    async fn remove(&self, content_ref: &str) -> Result<()> {
        let path = self.resolve(content_ref)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(SchedulerError::Upload(format!("{}: {e}", path.display()))),
        }
        // The per-upload directory only ever holds one file.
        if let Some(dir) = path.parent() {
            let _ = tokio::fs::remove_dir(dir).await;
        }
        debug!(content_ref, "content removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsContentStore::new(tmp.path());
        let owner: OwnerId = "u1".into();

        let r = store.put(&owner, "gits-changes-1.json", b"{}").await.unwrap();
        assert!(r.starts_with("file://"));
        assert!(r.contains("/u1/changes-"));
        assert_eq!(store.get(&r).await.unwrap(), b"{}");

        store.remove(&r).await.unwrap();
        assert!(store.get(&r).await.is_err());
        store.remove(&r).await.unwrap();
    }

    #[tokio::test]
    async fn two_uploads_never_collide() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsContentStore::new(tmp.path());
        let owner: OwnerId = "u1".into();
        let a = store.put(&owner, "same.json", b"a").await.unwrap();
        let b = store.put(&owner, "same.json", b"b").await.unwrap();
        assert_ne!(a, b);
        assert_eq!(store.get(&a).await.unwrap(), b"a");
        assert_eq!(store.get(&b).await.unwrap(), b"b");
    }

    #[tokio::test]
    async fn unsafe_names_and_refs_are_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsContentStore::new(tmp.path());
        let owner: OwnerId = "u1".into();
        for name in ["", "..", "a/b.json", "a\\b.json"] {
            assert!(matches!(
                store.put(&owner, name, b"x").await,
                Err(SchedulerError::Upload(_))
            ));
        }
        assert!(store.get("file:///etc/passwd").await.is_err());
        assert!(store.get("s3://bucket/key").await.is_err());
    }

    #[test]
    fn owner_segment_encodes_unsafe_names() {
        assert_eq!(owner_segment(&"alice".into()), "alice");
        assert_eq!(owner_segment(&"a/b".into()), "x-612f62");
        assert_eq!(owner_segment(&"..".into()), "x-2e2e");
    }
}
