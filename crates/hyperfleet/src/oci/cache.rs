//! Cache policy (spec §4.3): a single JSON index under an exclusive lock,
//! rewritten atomically on every mutation. Size-capped; eviction drops the
//! least-recently-used entries until usage is at or below 90% of the
//! configured limit.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

const INDEX_SCHEMA_VERSION: u32 = 1;
const EVICTION_TARGET_RATIO: f64 = 0.9;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub digest: String,
    pub rootfs_path: PathBuf,
    pub size_bytes: u64,
    pub cached_at: i64,
    pub last_accessed_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexFile {
    schema_version: u32,
    entries: HashMap<String, CacheEntry>,
}

impl Default for IndexFile {
    fn default() -> Self {
        Self { schema_version: INDEX_SCHEMA_VERSION, entries: HashMap::new() }
    }
}

pub struct Cache {
    dir: PathBuf,
    max_size_bytes: u64,
    index: Mutex<IndexFile>,
}

fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn index_path(dir: &Path) -> PathBuf {
    dir.join("cache-index.json")
}

/// A safe on-disk filename for a normalized reference: slashes, colons,
/// and `@` all collide with path separators or shell-significant
/// characters, so they're replaced.
pub fn safe_filename(normalized: &str) -> String {
    normalized
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

impl Cache {
    pub async fn open(dir: PathBuf, max_size_bytes: u64) -> Result<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        let path = index_path(&dir);
        let index = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<IndexFile>(&bytes) {
                Ok(parsed) if parsed.schema_version == INDEX_SCHEMA_VERSION => parsed,
                _ => IndexFile::default(),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => IndexFile::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { dir, max_size_bytes, index: Mutex::new(index) })
    }

    async fn persist(&self, index: &IndexFile) -> Result<()> {
        let serialized = serde_json::to_vec_pretty(index)
            .map_err(|e| Error::Cache(format!("failed to serialize index: {e}")))?;
        let tmp_path = self.dir.join(format!("cache-index.json.tmp-{}", now()));
        tokio::fs::write(&tmp_path, &serialized).await?;
        tokio::fs::rename(&tmp_path, index_path(&self.dir)).await?;
        Ok(())
    }

    /// Looks up `normalized` and bumps `last_accessed_at` on a hit. Auto-
    /// evicts the entry if its backing file has gone missing.
    pub async fn get(&self, normalized: &str) -> Result<Option<CacheEntry>> {
        let mut index = self.index.lock().await;
        let Some(entry) = index.entries.get(normalized).cloned() else {
            return Ok(None);
        };

        if !entry.rootfs_path.exists() {
            index.entries.remove(normalized);
            self.persist(&index).await?;
            return Ok(None);
        }

        let updated = CacheEntry { last_accessed_at: now(), ..entry };
        index.entries.insert(normalized.to_string(), updated.clone());
        self.persist(&index).await?;
        Ok(Some(updated))
    }

    /// Inserts `entry` under `normalized`, then evicts oldest-by-access
    /// entries until total size is at or below `EVICTION_TARGET_RATIO` of
    /// the configured limit.
    pub async fn put(&self, normalized: &str, entry: CacheEntry) -> Result<()> {
        let mut index = self.index.lock().await;
        index.entries.insert(normalized.to_string(), entry);

        let total: u64 = index.entries.values().map(|e| e.size_bytes).sum();
        if total > self.max_size_bytes {
            let target = (self.max_size_bytes as f64 * EVICTION_TARGET_RATIO) as u64;
            let mut by_access: Vec<(String, i64)> = index
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.last_accessed_at))
                .collect();
            by_access.sort_by_key(|(_, accessed)| *accessed);

            let mut running_total = total;
            for (key, _) in by_access {
                if running_total <= target {
                    break;
                }
                if let Some(evicted) = index.entries.remove(&key) {
                    running_total = running_total.saturating_sub(evicted.size_bytes);
                    let _ = tokio::fs::remove_file(&evicted.rootfs_path).await;
                }
            }
        }

        self.persist(&index).await
    }

    /// Removes an entry without evicting its backing file (spec: `delete`
    /// does not evict the associated cache entry's file by itself;
    /// callers that want the file gone call this explicitly).
    pub async fn remove(&self, normalized: &str) -> Result<()> {
        let mut index = self.index.lock().await;
        index.entries.remove(normalized);
        self.persist(&index).await
    }

    pub fn rootfs_path_for(&self, normalized: &str) -> PathBuf {
        self.dir.join(format!("{}.ext4", safe_filename(normalized)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(digest: &str, size: u64, accessed_at: i64) -> CacheEntry {
        CacheEntry {
            digest: digest.to_string(),
            rootfs_path: PathBuf::from("/dev/null"),
            size_bytes: size,
            cached_at: accessed_at,
            last_accessed_at: accessed_at,
        }
    }

    #[tokio::test]
    async fn put_then_get_round_trips_and_bumps_access_time() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path().to_path_buf(), 10 * 1024 * 1024).await.unwrap();
        cache.put("docker.io/library/alpine:latest", entry("sha256:abc", 100, 1)).await.unwrap();

        let fetched = cache.get("docker.io/library/alpine:latest").await.unwrap().unwrap();
        assert_eq!(fetched.digest, "sha256:abc");
    }

    #[tokio::test]
    async fn missing_backing_file_auto_evicts_on_get() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path().to_path_buf(), 10 * 1024 * 1024).await.unwrap();
        let mut e = entry("sha256:abc", 100, 1);
        e.rootfs_path = dir.path().join("does-not-exist.ext4");
        cache.put("ref", e).await.unwrap();

        assert!(cache.get("ref").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eviction_keeps_total_within_limit_dropping_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        // Each entry is a real file so eviction's removal succeeds cleanly.
        let mut entries = Vec::new();
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            let path = dir.path().join(format!("{name}.ext4"));
            tokio::fs::write(&path, vec![0u8; 1]).await.unwrap();
            entries.push((
                format!("ref-{name}"),
                CacheEntry {
                    digest: format!("sha256:{name}"),
                    rootfs_path: path,
                    size_bytes: 40,
                    cached_at: i as i64,
                    last_accessed_at: i as i64,
                },
            ));
        }

        let cache = Cache::open(dir.path().to_path_buf(), 100).await.unwrap();
        for (key, e) in entries {
            cache.put(&key, e).await.unwrap();
        }

        // total after inserting a,b,c = 120 > 100; target = 90; evict oldest (a) -> 80 <= 90
        assert!(cache.get("ref-a").await.unwrap().is_none());
        assert!(cache.get("ref-b").await.unwrap().is_some());
        assert!(cache.get("ref-c").await.unwrap().is_some());
    }
}
