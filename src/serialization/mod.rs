//! Saving and loading parameters and datasets in the SafeTensors format.
//!
//! ```no_run
//! use rustygnn::serialization::{load_safetensors, save_safetensors};
//! use std::collections::HashMap;
//!
//! let weights = HashMap::new();
//! save_safetensors("model.safetensors", &weights).unwrap();
//! let loaded = load_safetensors("model.safetensors").unwrap();
//! assert!(loaded.is_empty());
//! ```

pub mod dataset_io;
pub mod safetensors_io;

pub use dataset_io::{load_dataset, save_dataset, SafetensorsSource};
pub use safetensors_io::{
    list_tensors, load_safetensors, load_tensor, read_tensors, save_safetensors, write_tensors, SafeTensorsError,
    StoredTensor,
};
