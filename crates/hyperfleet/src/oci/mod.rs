//! C4: OCI Resolver + Cache. Turns an image reference into a bootable
//! ext4 rootfs, reusing a cached one when available and otherwise
//! pulling, unpacking, and converting — at most one conversion in flight
//! per normalized reference at a time.

pub mod cache;
pub mod convert;
pub mod pull;
pub mod reference;

use crate::error::{Error, Result};
use crate::resilience::CircuitBreaker;
use cache::{Cache, CacheEntry};
use reference::ImageReference;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct Resolved {
    pub digest: String,
    pub rootfs_path: PathBuf,
}

pub struct Resolver {
    cache: Cache,
    init_path: PathBuf,
    default_rootfs_size_mib: u32,
    build_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    breaker: CircuitBreaker,
}

fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

impl Resolver {
    pub async fn open(cache_dir: PathBuf, max_cache_size_bytes: u64, init_path: PathBuf, default_rootfs_size_mib: u32) -> Result<Self> {
        let cache = Cache::open(cache_dir, max_cache_size_bytes).await?;
        Ok(Self {
            cache,
            init_path,
            default_rootfs_size_mib,
            build_locks: Mutex::new(HashMap::new()),
            breaker: CircuitBreaker::new(5, 30_000, 2),
        })
    }

    async fn build_lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.build_locks.lock().await;
        locks.entry(key.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Resolves `input` (a raw image reference string) to a bootable
    /// rootfs, optionally overriding the rootfs size in MiB. Cache-hits
    /// short-circuit entirely; misses pull, unpack, and convert under a
    /// per-reference lock so concurrent requests for the same image
    /// collapse into a single conversion.
    pub async fn resolve(&self, input: &str, size_mib_override: Option<u32>) -> Result<Resolved> {
        if size_mib_override == Some(0) {
            return Err(Error::Validation("image_size_mib must be greater than zero".into()));
        }

        let image = reference::parse(input)?;
        let key = image.normalized.clone();

        if let Some(entry) = self.cache.get(&key).await? {
            return Ok(Resolved { digest: entry.digest, rootfs_path: entry.rootfs_path });
        }

        let lock = self.build_lock_for(&key).await;
        let _guard = lock.lock().await;

        // Re-check: another task may have finished the conversion while we
        // waited for the lock.
        if let Some(entry) = self.cache.get(&key).await? {
            return Ok(Resolved { digest: entry.digest, rootfs_path: entry.rootfs_path });
        }

        self.pull_and_convert(&image, size_mib_override).await
    }

    async fn pull_and_convert(&self, image: &ImageReference, size_mib_override: Option<u32>) -> Result<Resolved> {
        let size_mib = size_mib_override.unwrap_or(self.default_rootfs_size_mib);
        let staging = tempfile::tempdir().map_err(crate::error::Error::from)?;
        let rootfs_dir = staging.path().join("rootfs");

        let pulled = pull::pull(image, staging.path(), &self.breaker).await?;
        convert::unpack_layers(&image.normalized, &pulled.layer_paths, rootfs_dir.clone()).await?;
        convert::inject_init(&image.normalized, &rootfs_dir, &self.init_path).await?;
        convert::write_resolv_conf(&image.normalized, &rootfs_dir).await?;

        let image_path = self.cache.rootfs_path_for(&image.normalized);
        if let Err(e) = convert::build_ext4_image(&image.normalized, &rootfs_dir, &image_path, size_mib).await {
            let _ = tokio::fs::remove_file(&image_path).await;
            return Err(e);
        }

        let size_bytes = tokio::fs::metadata(&image_path).await.map(|m| m.len()).unwrap_or(0);
        let entry = CacheEntry {
            digest: pulled.digest.clone(),
            rootfs_path: image_path.clone(),
            size_bytes,
            cached_at: now(),
            last_accessed_at: now(),
        };
        self.cache.put(&image.normalized, entry).await?;

        Ok(Resolved { digest: pulled.digest, rootfs_path: image_path })
    }

    pub async fn evict(&self, normalized: &str) -> Result<()> {
        self.cache.remove(normalized).await
    }
}
