// --- File: src/backbone.rs ---

//! Feature extractors (`emb_func`) shared by every few-shot method.
//!
//! Two extractors ship with the crate: [`Identity`] for features that were
//! extracted offline, and [`DenseEncoder`], a stack of `Linear + ReLU`
//! layers that can be trained end to end with the episodic protocol.

use crate::error::Result;
use crate::nn::{Linear, Module, ParamStore, ReLU};
use ndarray::Array2;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Prefix of every backbone parameter in a model's store.
pub const BACKBONE_PREFIX: &str = "emb_func.";

/// A module mapping flattened samples to feature vectors.
pub trait FeatureExtractor: Module + Send + Sync {
    /// Width of the produced features.
    fn feat_dim(&self) -> usize;

    fn kind(&self) -> BackboneKind;
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackboneKind {
    #[serde(alias = "identity")]
    Identity,
    #[serde(alias = "dense_encoder", alias = "Dense")]
    DenseEncoder,
}

impl BackboneKind {
    pub fn name(&self) -> &'static str {
        match self {
            BackboneKind::Identity => "Identity",
            BackboneKind::DenseEncoder => "DenseEncoder",
        }
    }
}

fn default_feat_dim() -> usize {
    64
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackboneKwargs {
    /// Widths of the hidden layers of a [`DenseEncoder`].
    #[serde(default)]
    pub hidden_dims: Vec<usize>,
    /// Output width of a [`DenseEncoder`].
    #[serde(default = "default_feat_dim")]
    pub feat_dim: usize,
}

impl Default for BackboneKwargs {
    fn default() -> Self {
        Self {
            hidden_dims: Vec::new(),
            feat_dim: default_feat_dim(),
        }
    }
}

/// `backbone: {name, kwargs, frozen}` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackboneConfig {
    pub name: BackboneKind,
    #[serde(default)]
    pub kwargs: BackboneKwargs,
    /// When set, no gradient ever reaches the backbone parameters.
    #[serde(default)]
    pub frozen: bool,
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            name: BackboneKind::Identity,
            kwargs: BackboneKwargs::default(),
            frozen: false,
        }
    }
}

impl BackboneConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.name == BackboneKind::DenseEncoder {
            if self.kwargs.feat_dim == 0 {
                return Err("feat_dim must be positive".into());
            }
            if self.kwargs.hidden_dims.iter().any(|&d| d == 0) {
                return Err("hidden_dims must be positive".into());
            }
        }
        Ok(())
    }
}

/// Builds the extractor for samples of width `in_dim`, registering its
/// parameters in `store`.
pub fn build_backbone<R: Rng + ?Sized>(
    config: &BackboneConfig,
    in_dim: usize,
    store: &mut ParamStore,
    rng: &mut R,
) -> Box<dyn FeatureExtractor> {
    match config.name {
        BackboneKind::Identity => Box::new(Identity::new(in_dim)),
        BackboneKind::DenseEncoder => Box::new(DenseEncoder::new(
            store,
            in_dim,
            &config.kwargs.hidden_dims,
            config.kwargs.feat_dim,
            rng,
        )),
    }
}

// ============================================================================
// Identity
// ============================================================================

/// Passes samples through unchanged.
#[derive(Debug, Clone)]
pub struct Identity {
    dim: usize,
}

impl Identity {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl Module for Identity {
    fn forward(&self, _store: &ParamStore, inputs: &Array2<f32>) -> Result<Array2<f32>> {
        Ok(inputs.clone())
    }

    fn backward(
        &self,
        _store: &ParamStore,
        _inputs: &Array2<f32>,
        grad_output: &Array2<f32>,
        _grads: &mut ParamStore,
    ) -> Result<Array2<f32>> {
        Ok(grad_output.clone())
    }

    fn parameter_names(&self) -> Vec<String> {
        Vec::new()
    }
}

impl FeatureExtractor for Identity {
    fn feat_dim(&self) -> usize {
        self.dim
    }

    fn kind(&self) -> BackboneKind {
        BackboneKind::Identity
    }
}

// ============================================================================
// DenseEncoder
// ============================================================================

/// `Linear -> ReLU -> ... -> Linear` registered as `emb_func.layers.{i}`.
///
/// Every hidden layer is followed by a ReLU; the output layer is linear.
#[derive(Debug, Clone)]
pub struct DenseEncoder {
    layers: Vec<Linear>,
    relu: ReLU,
}

impl DenseEncoder {
    pub fn new<R: Rng + ?Sized>(
        store: &mut ParamStore,
        in_dim: usize,
        hidden_dims: &[usize],
        feat_dim: usize,
        rng: &mut R,
    ) -> Self {
        let mut dims = vec![in_dim];
        dims.extend_from_slice(hidden_dims);
        dims.push(feat_dim);

        let layers = dims
            .windows(2)
            .enumerate()
            .map(|(i, pair)| {
                Linear::new(
                    store,
                    &format!("{}layers.{}", BACKBONE_PREFIX, i),
                    pair[0],
                    pair[1],
                    rng,
                )
            })
            .collect();
        Self {
            layers,
            relu: ReLU::new(),
        }
    }

    /// Inputs of every layer, in order, plus the final output.
    fn activations(&self, store: &ParamStore, inputs: &Array2<f32>) -> Result<(Vec<Array2<f32>>, Array2<f32>)> {
        let mut layer_inputs = Vec::with_capacity(self.layers.len());
        let mut x = inputs.clone();
        let last = self.layers.len() - 1;
        for (i, layer) in self.layers.iter().enumerate() {
            let pre = layer.forward(store, &x)?;
            layer_inputs.push(x);
            x = if i < last { self.relu.forward(&pre) } else { pre };
        }
        Ok((layer_inputs, x))
    }
}

impl Module for DenseEncoder {
    fn forward(&self, store: &ParamStore, inputs: &Array2<f32>) -> Result<Array2<f32>> {
        Ok(self.activations(store, inputs)?.1)
    }

    fn backward(
        &self,
        store: &ParamStore,
        inputs: &Array2<f32>,
        grad_output: &Array2<f32>,
        grads: &mut ParamStore,
    ) -> Result<Array2<f32>> {
        let (layer_inputs, _) = self.activations(store, inputs)?;
        let mut grad = grad_output.clone();
        for (i, layer) in self.layers.iter().enumerate().rev() {
            grad = layer.backward(store, &layer_inputs[i], &grad, grads)?;
            if i > 0 {
                // The input of layer i is ReLU(pre_{i-1}); zero where it was clipped.
                let post = &layer_inputs[i];
                grad.zip_mut_with(post, |g, &h| {
                    if h <= 0.0 {
                        *g = 0.0;
                    }
                });
            }
        }
        Ok(grad)
    }

    fn parameter_names(&self) -> Vec<String> {
        self.layers.iter().flat_map(|l| l.parameter_names()).collect()
    }
}

impl FeatureExtractor for DenseEncoder {
    fn feat_dim(&self) -> usize {
        self.layers.last().map(|l| l.out_features).unwrap_or(0)
    }

    fn kind(&self) -> BackboneKind {
        BackboneKind::DenseEncoder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_identity_passes_through() {
        let mut store = ParamStore::new();
        let mut rng = StdRng::seed_from_u64(0);
        let backbone = build_backbone(&BackboneConfig::default(), 6, &mut store, &mut rng);
        assert!(store.is_empty());
        assert_eq!(backbone.feat_dim(), 6);

        let x = Array2::from_elem((2, 6), 1.5);
        assert_eq!(backbone.forward(&store, &x).unwrap(), x);
    }

    #[test]
    fn test_dense_encoder_registers_emb_func() {
        let config = BackboneConfig {
            name: BackboneKind::DenseEncoder,
            kwargs: BackboneKwargs {
                hidden_dims: vec![16, 12],
                feat_dim: 8,
            },
            frozen: false,
        };
        let mut store = ParamStore::new();
        let mut rng = StdRng::seed_from_u64(1);
        let backbone = build_backbone(&config, 10, &mut store, &mut rng);

        assert_eq!(backbone.feat_dim(), 8);
        assert_eq!(store.len(), 6);
        assert!(store.keys().all(|k| k.starts_with(BACKBONE_PREFIX)));
        assert_eq!(store["emb_func.layers.1.weights"].shape(), &[16, 12]);

        let x = Array2::from_elem((3, 10), 0.3);
        let feat = backbone.forward(&store, &x).unwrap();
        assert_eq!(feat.dim(), (3, 8));

        let mut grads = ParamStore::new();
        let dx = backbone
            .backward(&store, &x, &Array2::ones((3, 8)), &mut grads)
            .unwrap();
        assert_eq!(dx.dim(), (3, 10));
        assert_eq!(grads.len(), 6);
    }

    #[test]
    fn test_config_validation() {
        let mut config = BackboneConfig {
            name: BackboneKind::DenseEncoder,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        config.kwargs.hidden_dims = vec![0];
        assert!(config.validate().is_err());
    }
}
