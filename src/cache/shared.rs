//! Async, mutex-guarded handle to a [`KvCache`].
//!
//! Mirrors the weight store's shared handle: each call owns the lock for its
//! whole duration and spill I/O runs on tokio's blocking pool, so `cleanup`
//! returns only after every spill file is gone.

use std::sync::Arc;

use tokio::sync::Mutex;

use super::block::CacheLocation;
use super::kv_cache::{KvCache, KvCacheError, KvCacheStats};

#[derive(Clone, Debug)]
pub struct SharedKvCache {
    inner: Arc<Mutex<KvCache>>,
}

impl SharedKvCache {
    pub fn new(cache: KvCache) -> Self {
        Self {
            inner: Arc::new(Mutex::new(cache)),
        }
    }

    pub fn inner(&self) -> &Arc<Mutex<KvCache>> {
        &self.inner
    }

    pub async fn store(
        &self,
        data: Vec<f32>,
        seq_pos: u32,
        layer_id: u32,
        is_key: bool,
    ) -> Result<CacheLocation, KvCacheError> {
        self.run(move |cache| cache.try_store(&data, seq_pos, layer_id, is_key))
            .await
    }

    /// `None` when the triple is not cached or cannot be read back.
    pub async fn retrieve(&self, seq_pos: u32, layer_id: u32, is_key: bool) -> Option<Vec<f32>> {
        self.run(move |cache| Ok(cache.retrieve(seq_pos, layer_id, is_key)))
            .await
            .ok()
            .flatten()
    }

    pub async fn cleanup(&self) -> Result<(), KvCacheError> {
        self.run(|cache| {
            cache.cleanup();
            Ok(())
        })
        .await
    }

    pub async fn stats(&self) -> KvCacheStats {
        self.inner.lock().await.stats().clone()
    }

    async fn run<T, F>(&self, f: F) -> Result<T, KvCacheError>
    where
        T: Send + 'static,
        F: FnOnce(&mut KvCache) -> Result<T, KvCacheError> + Send + 'static,
    {
        let mut guard = Arc::clone(&self.inner).lock_owned().await;
        tokio::task::spawn_blocking(move || f(&mut *guard))
            .await
            .map_err(|e| KvCacheError::Worker(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CodecConfig, KvCacheConfig};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_concurrent_stores() {
        let tmp = TempDir::new().unwrap();
        let config = KvCacheConfig {
            block_size: 64,
            max_blocks: 8,
            spill_dir: tmp.path().to_path_buf(),
            ..Default::default()
        };
        let cache = SharedKvCache::new(KvCache::new(config, CodecConfig::default()).unwrap());

        let mut handles = Vec::new();
        for layer in 0..8u32 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.store(vec![layer as f32; 8], 0, layer, true).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        for layer in 0..8u32 {
            assert_eq!(cache.retrieve(0, layer, true).await.unwrap(), vec![layer as f32; 8]);
        }
        assert_eq!(cache.stats().await.stores, 8);
        cache.cleanup().await.unwrap();
        assert!(cache.retrieve(0, 0, true).await.is_none());
    }
}
