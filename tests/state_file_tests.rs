//! Integration tests for the training state container.

use lowmem_llm::quant::mixed_precision::{LayerPrecisionConfig, MixedPrecisionConfig, MixedPrecisionState};
use lowmem_llm::quant::qat::{QatConfig, QatState};
use lowmem_llm::quant::state_file::{self, SaveOptions, StateFileError, HEADER_LEN, QAT_MAGIC};
use lowmem_llm::ErrorKind;
use tempfile::TempDir;

fn trained_state() -> MixedPrecisionState {
    let config = MixedPrecisionConfig::default();
    let layer = LayerPrecisionConfig::default();
    let mut state = MixedPrecisionState::new(3, &config);
    let mut w0: Vec<f32> = (0..40).map(|i| i as f32 * 0.013 - 0.2).collect();
    let mut w2: Vec<f32> = (0..7).map(|i| i as f32 * -1.5).collect();
    state.forward(0, &mut w0, &layer).unwrap();
    state.forward(2, &mut w2, &layer).unwrap();
    let mut grads = vec![1.0f32; 4];
    state.backward(1, &mut grads, &layer).unwrap();
    state.update_loss_scale(&config);
    state
}

#[test]
fn test_mixed_precision_roundtrip_both_encodings() {
    let tmp = TempDir::new().unwrap();
    let state = trained_state();
    for use_compression in [true, false] {
        let options = SaveOptions {
            use_compression,
            ..SaveOptions::default()
        };
        let path = tmp.path().join(format!("mp_{use_compression}.bin"));
        state.save(&path, &options).unwrap();
        let loaded = MixedPrecisionState::load(&path, &options).unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.weight_backup(1), None);

        let header = state_file::verify_state_file(&path).unwrap();
        assert_eq!(header.kind_name(), "mixed-precision");
        assert_eq!(header.compressed, use_compression);
    }
}

#[test]
fn test_every_single_byte_flip_is_detected() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("mp.bin");
    let options = SaveOptions::default();
    trained_state().save(&path, &options).unwrap();
    let pristine = std::fs::read(&path).unwrap();
    assert!(pristine.len() > HEADER_LEN);

    for offset in 0..pristine.len() {
        let mut corrupted = pristine.clone();
        corrupted[offset] ^= 0xFF;
        std::fs::write(&path, &corrupted).unwrap();
        let err = MixedPrecisionState::load(&path, &options).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptData, "offset {offset}: {err}");
    }
}

#[test]
fn test_truncated_and_padded_files() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("mp.bin");
    let options = SaveOptions {
        use_compression: false,
        ..SaveOptions::default()
    };
    trained_state().save(&path, &options).unwrap();
    let pristine = std::fs::read(&path).unwrap();

    std::fs::write(&path, &pristine[..pristine.len() - 1]).unwrap();
    assert!(matches!(
        MixedPrecisionState::load(&path, &options),
        Err(StateFileError::Length { .. })
    ));

    let mut padded = pristine.clone();
    padded.push(0);
    std::fs::write(&path, &padded).unwrap();
    assert!(matches!(
        MixedPrecisionState::load(&path, &options),
        Err(StateFileError::Length { .. })
    ));

    std::fs::write(&path, &pristine[..10]).unwrap();
    assert!(MixedPrecisionState::load(&path, &options).is_err());
}

#[test]
fn test_wrong_container_kind_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("qat.bin");
    let options = SaveOptions::default();
    let qat = QatState::new(2).unwrap();
    qat.save(&path, &options).unwrap();

    let err = MixedPrecisionState::load(&path, &options).unwrap_err();
    assert!(matches!(err, StateFileError::BadMagic { found: QAT_MAGIC, .. }));
    assert_eq!(state_file::verify_state_file(&path).unwrap().kind_name(), "qat");
}

#[test]
fn test_qat_roundtrip_after_calibration() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("qat.bin");
    let config = QatConfig {
        calibration_steps: 2,
        ..Default::default()
    };
    let mut state = QatState::new(2).unwrap();
    for step in 0..3 {
        let mut a = vec![-0.5f32 * (step + 1) as f32, 0.1, 0.75];
        state.forward(0, &mut a, &config).unwrap();
        state.update_params(&config);
    }
    let mut b = vec![2.0f32, -3.0];
    state.forward(1, &mut b, &config).unwrap();

    state.save(&path, &SaveOptions::default()).unwrap();
    let loaded = QatState::load(&path, &SaveOptions::default()).unwrap();
    assert_eq!(loaded, state);
    assert_eq!(loaded.params(0), state.params(0));
    assert!(!loaded.is_calibrating());
}

#[test]
fn test_unchecked_load_skips_crc() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("mp.bin");
    let state = trained_state();
    let options = SaveOptions {
        use_compression: false,
        ..SaveOptions::default()
    };
    state.save(&path, &options).unwrap();

    // Corrupt only the stored data CRC.
    let mut raw = std::fs::read(&path).unwrap();
    raw[12] ^= 0x01;
    std::fs::write(&path, &raw).unwrap();

    assert!(matches!(
        MixedPrecisionState::load(&path, &options),
        Err(StateFileError::DataChecksum { .. })
    ));
    let unchecked = SaveOptions {
        verify_checksum: false,
        ..options
    };
    assert_eq!(MixedPrecisionState::load(&path, &unchecked).unwrap(), state);
}
