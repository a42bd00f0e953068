//! Attention-state caches.
//!
//! - [`block`]: slot metadata and tier locations
//! - [`evictor`]: slot replacement policy
//! - [`kv_cache`]: fixed-slot memory / compressed / disk cache
//! - [`layer_cache`]: per-layer rows with rotation and offload
//! - [`shared`]: async handle over [`KvCache`]

pub mod block;
pub mod evictor;
pub mod kv_cache;
pub mod layer_cache;
pub mod shared;

pub use block::{BlockKey, CacheBlockMeta, CacheLocation};
pub use kv_cache::{KvCache, KvCacheError, KvCacheStats};
pub use layer_cache::{LayerCacheError, LayerKvCache};
pub use shared::SharedKvCache;
