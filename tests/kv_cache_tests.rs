//! Integration tests for the slot KV cache.

use lowmem_llm::cache::{CacheLocation, KvCache};
use lowmem_llm::config::{CodecConfig, KvCacheConfig, SlotPolicy};
use tempfile::TempDir;

fn cache(tmp: &TempDir, block_size: usize, max_blocks: usize, policy: SlotPolicy) -> KvCache {
    let config = KvCacheConfig {
        block_size,
        max_blocks,
        spill_dir: tmp.path().to_path_buf(),
        slot_policy: policy,
        raw_in_arena: false,
    };
    KvCache::new(config, CodecConfig::default()).unwrap()
}

/// A vector the codec cannot shrink below its raw size.
fn noisy(n: usize, seed: u32) -> Vec<f32> {
    let mut state = seed;
    (0..n)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            // Finite, normal values with random mantissas.
            f32::from_bits(0x3F00_0000 | (state >> 9))
        })
        .collect()
}

/// 64 floats whose byte deltas alternate 0xFF with distinct values. Every
/// delta window is unique and half the bytes need an escape, so the codec
/// stream outgrows the raw 256 bytes.
fn escape_heavy() -> Vec<f32> {
    let mut prev = 0u8;
    let bytes: Vec<u8> = (0..256u32)
        .map(|i| {
            let delta = if i % 2 == 0 { 0xFF } else { (i / 2) as u8 };
            prev = prev.wrapping_add(delta);
            prev
        })
        .collect();
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn spill_files(tmp: &TempDir) -> usize {
    std::fs::read_dir(tmp.path())
        .unwrap()
        .filter(|e| {
            e.as_ref()
                .unwrap()
                .file_name()
                .to_string_lossy()
                .starts_with("kv_cache_")
        })
        .count()
}

#[test]
fn test_every_tier_roundtrips_bit_exact() {
    let tmp = TempDir::new().unwrap();
    let mut kv = cache(&tmp, 256, 4, SlotPolicy::TokenModulo);

    let smooth = vec![0.125f32; 64];
    let small_noise = escape_heavy();
    let large_noise = noisy(512, 2);

    assert_eq!(kv.try_store(&smooth, 0, 0, true).unwrap(), CacheLocation::Compressed);
    // Fits the slot raw, but anything the codec cannot place goes to disk.
    assert_eq!(kv.try_store(&small_noise, 0, 0, false).unwrap(), CacheLocation::Disk);
    assert_eq!(kv.try_store(&large_noise, 1, 0, true).unwrap(), CacheLocation::Disk);
    assert_eq!(spill_files(&tmp), 2);

    for (data, seq, is_key) in [(&smooth, 0, true), (&small_noise, 0, false), (&large_noise, 1, true)] {
        let back = kv.retrieve(seq, 0, is_key).unwrap();
        assert_eq!(
            bytemuck::cast_slice::<f32, u8>(&back),
            bytemuck::cast_slice::<f32, u8>(data)
        );
    }
    assert_eq!(kv.stats().spills, 2);
}

#[test]
fn test_raw_in_arena_tier() {
    let tmp = TempDir::new().unwrap();
    let config = KvCacheConfig {
        block_size: 256,
        max_blocks: 2,
        spill_dir: tmp.path().to_path_buf(),
        slot_policy: SlotPolicy::TokenModulo,
        raw_in_arena: true,
    };
    let mut kv = KvCache::new(config, CodecConfig::default()).unwrap();

    let fits = escape_heavy();
    let too_big = noisy(65, 4);
    assert_eq!(kv.try_store(&fits, 0, 0, true).unwrap(), CacheLocation::Memory);
    assert_eq!(kv.try_store(&too_big, 0, 0, false).unwrap(), CacheLocation::Disk);
    assert_eq!(spill_files(&tmp), 1);
    let back = kv.retrieve(0, 0, true).unwrap();
    assert_eq!(
        bytemuck::cast_slice::<f32, u8>(&back),
        bytemuck::cast_slice::<f32, u8>(&fits)
    );
    assert_eq!(kv.retrieve(0, 0, false).unwrap(), too_big);
    assert_eq!(kv.stats().memory_stores, 1);
}

#[test]
fn test_token_modulo_overwrites_round_robin() {
    let tmp = TempDir::new().unwrap();
    let mut kv = cache(&tmp, 128, 4, SlotPolicy::TokenModulo);
    for seq in 0..4 {
        assert!(kv.store(&[seq as f32; 8], seq, 0, true));
    }
    assert_eq!(kv.occupied(), 4);

    // total_tokens_processed = 4 -> slot 0 (seq 0) is replaced.
    assert!(kv.store(&[4.0; 8], 4, 0, true));
    assert!(kv.retrieve(0, 0, true).is_none());
    assert_eq!(kv.retrieve(4, 0, true).unwrap(), vec![4.0; 8]);

    // total_tokens_processed = 5 -> slot 1 (seq 1), even though it was just read.
    assert!(kv.retrieve(1, 0, true).is_some());
    assert!(kv.store(&[5.0; 8], 5, 0, true));
    assert!(kv.retrieve(1, 0, true).is_none());
    assert_eq!(kv.stats().overwrites, 2);
}

#[test]
fn test_lru_keeps_recently_read_slot() {
    let tmp = TempDir::new().unwrap();
    let mut kv = cache(&tmp, 128, 4, SlotPolicy::LeastRecentlyUsed);
    for seq in 0..4 {
        kv.store(&[seq as f32; 8], seq, 0, true);
    }
    assert!(kv.retrieve(0, 0, true).is_some());

    kv.store(&[4.0; 8], 4, 0, true);
    assert!(kv.retrieve(0, 0, true).is_some());
    assert!(kv.retrieve(1, 0, true).is_none());
}

#[test]
fn test_overwriting_spilled_slot_removes_file() {
    let tmp = TempDir::new().unwrap();
    let mut kv = cache(&tmp, 64, 1, SlotPolicy::TokenModulo);
    assert_eq!(kv.try_store(&noisy(64, 9), 0, 3, false).unwrap(), CacheLocation::Disk);
    assert!(tmp.path().join("kv_cache_0_3_v.tmp").exists());

    kv.store(&[1.0; 4], 1, 3, false);
    assert!(!tmp.path().join("kv_cache_0_3_v.tmp").exists());
    assert_eq!(spill_files(&tmp), 0);
}

#[test]
fn test_cleanup_and_drop_remove_spill_files() {
    let tmp = TempDir::new().unwrap();
    {
        let mut kv = cache(&tmp, 64, 2, SlotPolicy::TokenModulo);
        kv.store(&noisy(64, 1), 0, 0, true);
        kv.store(&noisy(64, 2), 0, 0, false);
        assert_eq!(spill_files(&tmp), 2);
        kv.cleanup();
        assert_eq!(spill_files(&tmp), 0);
        assert_eq!(kv.occupied(), 0);

        kv.store(&noisy(64, 3), 1, 0, true);
        assert_eq!(spill_files(&tmp), 1);
    }
    assert_eq!(spill_files(&tmp), 0);
}

#[test]
fn test_missing_spill_file_fails_softly() {
    let tmp = TempDir::new().unwrap();
    let mut kv = cache(&tmp, 64, 2, SlotPolicy::TokenModulo);
    kv.store(&noisy(64, 5), 2, 1, true);
    std::fs::remove_file(tmp.path().join("kv_cache_2_1_k.tmp")).unwrap();
    let mut out = vec![0f32; 64];
    assert!(!kv.retrieve_into(&mut out, 2, 1, true));
}

#[test]
fn test_average_ratio_tracks_compressed_stores() {
    let tmp = TempDir::new().unwrap();
    let mut kv = cache(&tmp, 256, 4, SlotPolicy::TokenModulo);
    assert_eq!(kv.avg_compression_ratio(), 1.0);
    kv.store(&[0.5f32; 64], 0, 0, true);
    let first = kv.avg_compression_ratio();
    assert!(first > 1.0);
    kv.store(&[0.5f32; 64], 1, 0, true);
    assert_eq!(kv.total_tokens_processed(), 2);
    // Dictionary hits make the second store compress at least as well.
    assert!(kv.avg_compression_ratio() >= first);
}
