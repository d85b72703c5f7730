// --- File: src/serialization/mod.rs ---

//! Saving and restoring model weights.
//!
//! - **SafeTensors**: binary tensor storage for a [`ParamStore`](crate::nn::ParamStore)
//! - **JSON**: checkpoint metadata and optimizer state
//! - **Checkpoint**: a directory holding both
//!
//! # Example
//!
//! ```rust,ignore
//! use rusty_fewshot::serialization::{Checkpoint, CheckpointMeta};
//!
//! Checkpoint::new(model.params().clone(), CheckpointMeta::new("R2D2-Identity"))
//!     .save(result_dir.join("model_best"))?;
//! let restored = Checkpoint::load(result_dir.join("model_best"))?;
//! ```

pub mod checkpoint;
pub mod safetensors_io;

pub use checkpoint::{Checkpoint, CheckpointMeta, OptimizerState, SerializationError};
pub use safetensors_io::{load_safetensors, save_safetensors, take_tensor, SafeTensorsError};
