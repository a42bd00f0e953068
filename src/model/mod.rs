//! Model-side collaborators of the storage layer.

pub mod weights;

pub use weights::{
    load_into_store, read_tensor, read_weight_file, write_weight_file, TensorEntry, WeightFileError,
    WeightTensor,
};
