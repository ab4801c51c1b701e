use std::io;
use std::path::Path;
use std::time::UNIX_EPOCH;

use md5::Context;
use tokio::io::AsyncReadExt;
use tracing::warn;

use super::index::IndexStore;

pub const HASH_CHUNK_BYTES: usize = 2 * 1024 * 1024;

/// Lower-case hex MD5 of the whole file.
pub async fn file_md5(path: &Path) -> io::Result<String> {
    prefix_md5(path, u64::MAX).await
}

/// MD5 of at most the first `len` bytes of the file.
pub async fn prefix_md5(path: &Path, len: u64) -> io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut ctx = Context::new();
    let mut buf = vec![0u8; HASH_CHUNK_BYTES];
    let mut left = len;

    while left > 0 {
        let want = usize::try_from(left).unwrap_or(usize::MAX).min(buf.len());
        let read = file.read(&mut buf[..want]).await?;
        if read == 0 {
            break;
        }
        ctx.consume(&buf[..read]);
        left -= read as u64;
    }

    Ok(format!("{:x}", ctx.compute()))
}

/// The `(mtime, size)` pair a stored fingerprint is valid for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    pub mtime: i64,
    pub size: i64,
}

impl FileStamp {
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Self {
            mtime,
            size: meta.len() as i64,
        }
    }

    pub async fn read(path: &Path) -> io::Result<Self> {
        let meta = tokio::fs::metadata(path).await?;
        Ok(Self::from_metadata(&meta))
    }
}

/// Fingerprints files under one root, trusting the root's index when the
/// stored stamp still matches the file.
#[derive(Clone, Default)]
pub struct FingerprintCache {
    index: Option<IndexStore>,
}

impl FingerprintCache {
    pub fn new(index: IndexStore) -> Self {
        Self { index: Some(index) }
    }

    pub fn uncached() -> Self {
        Self { index: None }
    }

    pub fn from_option(index: Option<IndexStore>) -> Self {
        Self { index }
    }

    pub fn index(&self) -> Option<&IndexStore> {
        self.index.as_ref()
    }

    pub async fn fingerprint(&self, path: &Path) -> io::Result<String> {
        let stamp = FileStamp::read(path).await?;
        let key = path.to_string_lossy();

        let mut known = false;
        if let Some(index) = &self.index {
            match index.lookup(&key).await {
                Ok(Some(record)) => {
                    if let Some(hash) = record.trusted_hash(stamp) {
                        return Ok(hash.to_string());
                    }
                    known = record.stamp() == stamp;
                }
                Ok(None) => {}
                Err(err) => warn!(path = %path.display(), error = %err, "index lookup failed"),
            }
        }

        let hash = file_md5(path).await?;
        if known {
            self.store(path, &hash).await;
        }
        Ok(hash)
    }

    /// Always rehashes the file, writing the result back when indexed.
    pub async fn refresh(&self, path: &Path) -> io::Result<String> {
        let stamp = FileStamp::read(path).await?;
        let hash = file_md5(path).await?;
        if let Some(index) = &self.index
            && let Ok(Some(record)) = index.lookup(&path.to_string_lossy()).await
            && record.stamp() == stamp
        {
            self.store(path, &hash).await;
        }
        Ok(hash)
    }

    async fn store(&self, path: &Path, hash: &str) {
        if let Some(index) = &self.index
            && let Err(err) = index.set_hash(&path.to_string_lossy(), hash).await
        {
            warn!(path = %path.display(), error = %err, "failed to store fingerprint");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::index::TrackRecord;
    use sqlx::SqlitePool;
    use tempfile::tempdir;

    #[tokio::test]
    async fn hashes_known_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"hello").unwrap();

        assert_eq!(file_md5(&path).await.unwrap(), "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(
            prefix_md5(&path, 0).await.unwrap(),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
        assert_eq!(
            prefix_md5(&path, 100).await.unwrap(),
            file_md5(&path).await.unwrap()
        );
    }

    #[tokio::test]
    async fn cache_trusts_index_only_for_matching_stamp() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"hello").unwrap();
        let stamp = FileStamp::read(&path).await.unwrap();

        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let index = IndexStore::from_pool(pool);
        index.init().await.unwrap();
        index
            .upsert(&TrackRecord {
                path: path.to_string_lossy().into_owned(),
                mtime: stamp.mtime,
                size: stamp.size,
                content_hash: Some("stale-but-trusted".into()),
                ..TrackRecord::default()
            })
            .await
            .unwrap();

        let cache = FingerprintCache::new(index.clone());
        assert_eq!(cache.fingerprint(&path).await.unwrap(), "stale-but-trusted");

        let fresh = cache.refresh(&path).await.unwrap();
        assert_eq!(fresh, "5d41402abc4b2a76b9719d911017c592");
        let stored = index.lookup(&path.to_string_lossy()).await.unwrap().unwrap();
        assert_eq!(stored.content_hash.as_deref(), Some(fresh.as_str()));

        std::fs::write(&path, b"hello world").unwrap();
        assert_eq!(
            cache.fingerprint(&path).await.unwrap(),
            "5eb63bbbe01eeed093cb22bb8f5acdc3"
        );
    }
}
