//! Integration tests for MLLM weight files and paging them into the store.

use lowmem_llm::config::{CodecConfig, StoreConfig};
use lowmem_llm::model::{load_into_store, read_tensor, read_weight_file, write_weight_file, WeightTensor};
use lowmem_llm::store::WeightStore;
use tempfile::TempDir;

fn model_tensors() -> Vec<WeightTensor> {
    let hidden = 32u32;
    let mut tensors = Vec::new();
    for layer in 0..2 {
        let n = (hidden * hidden) as usize;
        let weights: Vec<f32> = (0..n).map(|i| ((i + layer * 7) as f32 * 0.001).cos()).collect();
        tensors.push(WeightTensor::new(vec![hidden, hidden], weights).unwrap());
        tensors.push(WeightTensor::new(vec![1, hidden], vec![layer as f32 * 0.1; hidden as usize]).unwrap());
    }
    tensors
}

#[test]
fn test_load_into_small_store_and_read_back() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("model.bin");
    let tensors = model_tensors();
    write_weight_file(&path, &tensors).unwrap();

    let config = StoreConfig {
        page_size: 1024,
        max_active_pages: 3,
        swap_dir: tmp.path().join("swap"),
    };
    let mut store = WeightStore::open(config, CodecConfig::default()).unwrap();
    let entries = load_into_store(&path, &mut store).unwrap();

    assert_eq!(entries.len(), 4);
    assert_eq!(entries[0].offset, 0);
    assert_eq!(entries[1].offset, 32 * 32 * 4);
    assert_eq!(entries[2].offset, entries[1].offset + 32 * 4);
    assert!(store.stats().evictions > 0);

    // Read in reverse so every tensor faults back in from swap.
    for (entry, tensor) in entries.iter().zip(&tensors).rev() {
        assert_eq!(entry.dims, tensor.dims);
        assert_eq!(read_tensor(&mut store, entry).unwrap(), tensor.data);
    }
}

#[test]
fn test_pack_then_reopen() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("model.bin");
    let tensors = model_tensors();
    write_weight_file(&path, &tensors).unwrap();
    assert_eq!(read_weight_file(&path).unwrap(), tensors);

    let config = StoreConfig {
        page_size: 512,
        max_active_pages: 2,
        swap_dir: tmp.path().join("swap"),
    };
    let entries = {
        let mut store = WeightStore::open(config.clone(), CodecConfig::default()).unwrap();
        let entries = load_into_store(&path, &mut store).unwrap();
        store.flush_all().unwrap();
        entries
    };

    let mut store = WeightStore::open(config, CodecConfig::default()).unwrap();
    assert_eq!(read_tensor(&mut store, &entries[2]).unwrap(), tensors[2].data);
    assert_eq!(read_tensor(&mut store, &entries[3]).unwrap(), tensors[3].data);
}

#[test]
fn test_bad_magic_loads_nothing() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("model.bin");
    std::fs::write(&path, b"GGUF\x00\x00\x00\x00").unwrap();
    let config = StoreConfig {
        page_size: 256,
        max_active_pages: 2,
        swap_dir: tmp.path().join("swap"),
    };
    let mut store = WeightStore::open(config, CodecConfig::default()).unwrap();
    assert!(load_into_store(&path, &mut store).is_err());
    assert_eq!(store.resident_pages(), 0);
}
