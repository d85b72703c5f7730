// --- File: src/model/pretrain.rs ---

//! Baseline and Baseline++ ("A Closer Look at Few-shot Classification",
//! Chen et al., ICLR 2019).
//!
//! Both pretrain a backbone and a `num_classes`-way head on plain batches of
//! the training classes. At test time the pretrained head is discarded: for
//! every episode a fresh `way`-way head is fitted on the support features
//! and used to classify the query features. Baseline uses a linear head,
//! Baseline++ the cosine classifier [`DistLinear`].

use super::base::{fine_tune, ModelBase};
use super::{FewShotModel, Forward, ForwardLoss, ModelKind};
use crate::data::Batch;
use crate::episode::{EpisodeLayout, SplitMode};
use crate::error::{FewShotError, Result};
use crate::losses::cross_entropy;
use crate::metrics::top1;
use crate::nn::{DistLinear, Linear, Module, ParamStore};
use crate::optimizers::OptimizerConfig;
use ndarray::{concatenate, Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A classifier head the pretrain family can build on demand.
pub trait PretrainHead: Module + Send + Sync + Sized {
    /// Method name reported by the model.
    const MODEL_NAME: &'static str;

    fn build<R: Rng + ?Sized>(store: &mut ParamStore, name: &str, in_dim: usize, out_dim: usize, rng: &mut R) -> Self;
}

impl PretrainHead for Linear {
    const MODEL_NAME: &'static str = "Baseline";

    fn build<R: Rng + ?Sized>(store: &mut ParamStore, name: &str, in_dim: usize, out_dim: usize, rng: &mut R) -> Self {
        Linear::new(store, name, in_dim, out_dim, rng)
    }
}

impl PretrainHead for DistLinear {
    const MODEL_NAME: &'static str = "BaselinePlus";

    fn build<R: Rng + ?Sized>(store: &mut ParamStore, name: &str, in_dim: usize, out_dim: usize, rng: &mut R) -> Self {
        DistLinear::new(store, name, in_dim, out_dim, rng)
    }
}

/// Pretrain-then-fine-tune model over a head type `H`.
pub struct PretrainModel<H: PretrainHead> {
    base: ModelBase,
    classifier: H,
    num_classes: usize,
    inner_optim: OptimizerConfig,
    inner_train_iter: usize,
    /// Initialises the per-episode heads.
    rng: StdRng,
}

pub type Baseline = PretrainModel<Linear>;
pub type BaselinePlus = PretrainModel<DistLinear>;

impl<H: PretrainHead> PretrainModel<H> {
    pub fn new<R: Rng + ?Sized>(
        mut base: ModelBase,
        num_classes: usize,
        inner_optim: OptimizerConfig,
        inner_train_iter: usize,
        seed: u64,
        rng: &mut R,
    ) -> Self {
        let feat_dim = base.feat_dim();
        let classifier = H::build(&mut base.store, "classifier", feat_dim, num_classes, rng);
        Self {
            base,
            classifier,
            num_classes,
            inner_optim,
            inner_train_iter,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Fits a fresh `way`-way head on support features.
    ///
    /// Returns the head and the store holding its parameters; neither is
    /// part of the model.
    pub fn set_forward_adaptation(
        &mut self,
        support_feat: &Array2<f32>,
        support_targets: &[usize],
    ) -> Result<(H, ParamStore)> {
        let mut store = ParamStore::new();
        let head = H::build(
            &mut store,
            "classifier",
            support_feat.ncols(),
            self.base.layout.way_num,
            &mut self.rng,
        );
        fine_tune(
            &head,
            &mut store,
            support_feat,
            support_targets,
            &self.inner_optim,
            self.inner_train_iter,
        )?;
        Ok((head, store))
    }

    /// Test-time adaptation of one support set, returning query logits.
    pub fn test_loop(
        &mut self,
        support_feat: &Array2<f32>,
        support_targets: &[usize],
        query_feat: &Array2<f32>,
    ) -> Result<Array2<f32>> {
        let (head, store) = self.set_forward_adaptation(support_feat, support_targets)?;
        head.forward(&store, query_feat)
    }
}

impl<H: PretrainHead> FewShotModel for PretrainModel<H> {
    fn name(&self) -> &'static str {
        H::MODEL_NAME
    }

    fn kind(&self) -> ModelKind {
        ModelKind::Pretrain
    }

    /// Fits one head per episode of the batch.
    fn set_forward(&mut self, batch: &Batch) -> Result<Forward> {
        let (_, splits) = self.base.split_by_episode(batch, SplitMode::PerEpisode)?;
        let mut outputs = Vec::with_capacity(splits.len());
        let mut targets = Vec::new();
        for split in &splits {
            outputs.push(self.test_loop(&split.support, &split.support_targets, &split.query)?);
            targets.extend_from_slice(&split.query_targets);
        }
        let views: Vec<_> = outputs.iter().map(|o| o.view()).collect();
        let output = concatenate(Axis(0), &views).map_err(|e| FewShotError::InvalidEpisode(e.to_string()))?;
        let acc = top1(&output, &targets)?;
        Ok(Forward { output, acc })
    }

    /// Plain classification over `num_classes` global labels.
    fn set_forward_loss(&mut self, batch: &Batch) -> Result<ForwardLoss> {
        if batch.is_empty() {
            return Err(FewShotError::NotEnoughData("empty pretraining batch".into()));
        }
        let feat = self.base.extract(&batch.images)?;
        let output = self.classifier.forward(&self.base.store, &feat)?;
        let (loss, grad_output) = cross_entropy(&output, &batch.labels)?;

        let mut grads = ParamStore::new();
        let grad_feat = self.classifier.backward(&self.base.store, &feat, &grad_output, &mut grads)?;
        self.base.backward_features(&batch.images, &grad_feat, &mut grads)?;
        self.base.finish_grads(&mut grads);

        let acc = top1(&output, &batch.labels)?;
        Ok(ForwardLoss {
            output,
            acc,
            loss,
            grads,
        })
    }

    fn params(&self) -> &ParamStore {
        &self.base.store
    }

    fn params_mut(&mut self) -> &mut ParamStore {
        &mut self.base.store
    }

    fn layout(&self) -> EpisodeLayout {
        self.base.layout
    }

    fn set_layout(&mut self, layout: EpisodeLayout) -> Result<()> {
        layout.validate()?;
        self.base.layout = layout;
        Ok(())
    }
}
