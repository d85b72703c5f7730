// --- File: src/model/base.rs ---

//! State and helpers shared by every few-shot method.

use crate::backbone::{build_backbone, BackboneConfig, FeatureExtractor, BACKBONE_PREFIX};
use crate::data::Batch;
use crate::episode::{EpisodeLayout, EpisodeSplit, SplitMode};
use crate::error::{FewShotError, Result};
use crate::losses::cross_entropy;
use crate::nn::{Module, ParamStore};
use crate::optimizers::OptimizerConfig;
use ndarray::Array2;
use rand::Rng;
use tracing::trace;

/// Episode layout, feature extractor and parameter store of a model.
///
/// Backbone parameters live under `emb_func.*`, classifier parameters under
/// `classifier.*`, both in the same store.
pub struct ModelBase {
    pub layout: EpisodeLayout,
    pub backbone: Box<dyn FeatureExtractor>,
    pub store: ParamStore,
    /// A frozen backbone never receives gradients.
    pub frozen: bool,
}

impl ModelBase {
    pub fn new<R: Rng + ?Sized>(
        layout: EpisodeLayout,
        backbone: &BackboneConfig,
        in_dim: usize,
        rng: &mut R,
    ) -> Self {
        let mut store = ParamStore::new();
        let extractor = build_backbone(backbone, in_dim, &mut store, rng);
        Self {
            layout,
            backbone: extractor,
            store,
            frozen: backbone.frozen,
        }
    }

    pub fn feat_dim(&self) -> usize {
        self.backbone.feat_dim()
    }

    /// Runs the feature extractor.
    pub fn extract(&self, images: &Array2<f32>) -> Result<Array2<f32>> {
        self.backbone.forward(&self.store, images)
    }

    /// Back-propagates `grad_feat` through the extractor into `grads`.
    ///
    /// Does nothing for a frozen or parameter-free backbone.
    pub fn backward_features(&self, images: &Array2<f32>, grad_feat: &Array2<f32>, grads: &mut ParamStore) -> Result<()> {
        if self.frozen || self.backbone.parameter_names().is_empty() {
            return Ok(());
        }
        self.backbone.backward(&self.store, images, grad_feat, grads)?;
        Ok(())
    }

    /// Checks an episodic batch and splits its features.
    pub fn split_by_episode(&self, batch: &Batch, mode: SplitMode) -> Result<(Array2<f32>, Vec<EpisodeSplit>)> {
        self.layout.check_batch(batch)?;
        let features = self.extract(&batch.images)?;
        let splits = self.layout.split_by_episode(&features, mode)?;
        Ok((features, splits))
    }

    /// Checks an episodic batch and splits its raw images.
    pub fn progress_batch(&self, batch: &Batch, mode: SplitMode) -> Result<Vec<EpisodeSplit>> {
        self.layout.progress_batch(batch, mode)
    }

    /// Drops backbone gradients when the backbone is frozen.
    pub fn finish_grads(&self, grads: &mut ParamStore) {
        if self.frozen {
            grads.retain(|name, _| !name.starts_with(BACKBONE_PREFIX));
        }
    }
}

/// Fits `head` on `(features, targets)` with `iters` steps of a fresh
/// optimizer built from `optim`, updating `store` in place.
///
/// This is the inner loop of ANIL and the test-time adaptation of the
/// pretrain family. `store` is always a copy owned by the caller. Returns
/// the loss of the last step.
pub fn fine_tune<M: Module + ?Sized>(
    head: &M,
    store: &mut ParamStore,
    features: &Array2<f32>,
    targets: &[usize],
    optim: &OptimizerConfig,
    iters: usize,
) -> Result<f32> {
    let mut optimizer = optim.build();
    let mut last_loss = f32::NAN;
    for step in 0..iters {
        let logits = head.forward(store, features)?;
        let (loss, grad_logits) = cross_entropy(&logits, targets)?;
        if !loss.is_finite() {
            return Err(FewShotError::NonFinite(format!(
                "inner loss is {} at step {}",
                loss, step
            )));
        }
        let mut grads = ParamStore::new();
        head.backward(store, features, &grad_logits, &mut grads)?;
        optimizer.step(store, &grads)?;
        trace!(step, loss, "inner step");
        last_loss = loss;
    }
    Ok(last_loss)
}
