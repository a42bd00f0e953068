//! lowmem-llm: storage layer for running transformer models larger than RAM.
//!
//! - [`store`]: paged weight address space backed by compressed swap files
//! - [`cache`]: tiered KV cache (memory / compressed / disk) and per-layer cache
//! - [`quant`]: quantization engine, FP8, mixed-precision and QAT state
//! - [`codec`]: dictionary block codec shared by the store and the cache
//! - [`model`]: MLLM weight file reader

pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod model;
pub mod quant;
pub mod store;

pub use error::ErrorKind;
