//! # Neural Network Layers Module
//!
//! Eager building blocks for the classifier heads and the dense encoder.
//!
//! Every layer stores only the names of its parameters; the values sit in a
//! [`ParamStore`]. That split is what makes inner-loop adaptation cheap: the
//! head is "deep-copied" by cloning a handful of tensors out of the model's
//! store, and the very same layer object runs against the copy.
//!
//! ## Available Layers
//!
//! - [`Linear`]: Fully connected layer
//! - [`FeedForward`]: `Linear -> ReLU -> Linear` head (ANIL)
//! - [`DistLinear`]: Weight-normalised cosine classifier (Baseline++)
//! - [`ReLU`]: Activation
//!
//! ## Example
//!
//! ```ignore
//! use rusty_fewshot::nn::{Linear, Module, ParamStore};
//!
//! let mut store = ParamStore::new();
//! let fc = Linear::new(&mut store, "classifier", 64, 5, &mut rng);
//! let logits = fc.forward(&store, &features)?;
//! ```

pub mod activations;
pub mod dist_linear;
pub mod feedforward;
pub mod linear;
pub mod module;
pub mod params;

pub use activations::ReLU;
pub use dist_linear::DistLinear;
pub use feedforward::FeedForward;
pub use linear::Linear;
pub use module::Module;
pub use params::ParamStore;
