//! Async, mutex-guarded handle to a [`WeightStore`].
//!
//! Every call holds the store lock for its whole duration and runs the
//! blocking page-fault and swap I/O on tokio's blocking pool, so `flush_all`
//! returns only after every write has completed.

use std::sync::Arc;

use tokio::sync::Mutex;

use super::{StoreError, StoreStats, WeightStore};

#[derive(Clone, Debug)]
pub struct SharedWeightStore {
    inner: Arc<Mutex<WeightStore>>,
}

impl SharedWeightStore {
    pub fn new(store: WeightStore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    /// Direct access to the guarded store.
    pub fn inner(&self) -> &Arc<Mutex<WeightStore>> {
        &self.inner
    }

    pub async fn read(&self, offset: u64, length: usize) -> Result<Vec<u8>, StoreError> {
        self.run(move |store| {
            let mut buf = Vec::new();
            buf.try_reserve_exact(length)
                .map_err(|_| StoreError::OutOfMemory { size: length })?;
            buf.resize(length, 0);
            store.read(offset, &mut buf)?;
            Ok(buf)
        })
        .await
    }

    pub async fn write(&self, offset: u64, data: Vec<u8>) -> Result<(), StoreError> {
        self.run(move |store| store.write(offset, &data)).await
    }

    pub async fn flush_all(&self) -> Result<(), StoreError> {
        self.run(|store| store.flush_all()).await
    }

    pub async fn stats(&self) -> StoreStats {
        self.inner.lock().await.stats().clone()
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut WeightStore) -> Result<T, StoreError> + Send + 'static,
    {
        let mut guard = Arc::clone(&self.inner).lock_owned().await;
        tokio::task::spawn_blocking(move || f(&mut *guard))
            .await
            .map_err(|e| StoreError::Worker(e.to_string()))?
    }
}
