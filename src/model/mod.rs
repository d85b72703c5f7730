// --- File: src/model/mod.rs ---

//! # Few-shot models
//!
//! Every method shares the same episodic interface:
//!
//! - [`FewShotModel::set_forward`] evaluates an episodic batch. The model's
//!   own parameters are never changed; any adaptation happens on copies.
//! - [`FewShotModel::set_forward_loss`] computes the training objective and
//!   the gradients of every trainable parameter, which the trainer hands to
//!   the outer optimizer.
//!
//! ## Methods
//!
//! - [`Anil`]: fine-tunes a copy of an MLP head on the support set
//! - [`R2d2`]: closed-form ridge regression head with learnable scale,
//!   bias and penalty
//! - [`Baseline`] / [`BaselinePlus`]: pretrained on plain batches of the
//!   training classes, a fresh linear / cosine head is fitted per test
//!   episode

pub mod anil;
pub mod base;
pub mod pretrain;
pub mod r2d2;

pub use anil::Anil;
pub use base::{fine_tune, ModelBase};
pub use pretrain::{Baseline, BaselinePlus, PretrainHead, PretrainModel};
pub use r2d2::{R2d2, R2d2Layer};

use crate::config::{ClassifierKind, Config};
use crate::data::Batch;
use crate::episode::EpisodeLayout;
use crate::error::{FewShotError, Result};
use crate::nn::ParamStore;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// How a model is trained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    /// Trained on episodic batches.
    Meta,
    /// Trained on plain batches with global labels.
    Pretrain,
}

/// Result of [`FewShotModel::set_forward`].
#[derive(Debug, Clone)]
pub struct Forward {
    /// Query logits of every episode, stacked.
    pub output: Array2<f32>,
    /// Top-1 accuracy in percent.
    pub acc: f64,
}

/// Result of [`FewShotModel::set_forward_loss`].
#[derive(Debug, Clone)]
pub struct ForwardLoss {
    pub output: Array2<f32>,
    pub acc: f64,
    pub loss: f32,
    /// Gradients keyed like the model's parameters.
    pub grads: ParamStore,
}

/// Interface shared by all few-shot methods.
pub trait FewShotModel: Send {
    /// Method name, e.g. `"R2D2"`.
    fn name(&self) -> &'static str;

    fn kind(&self) -> ModelKind;

    /// Evaluates an episodic batch.
    fn set_forward(&mut self, batch: &Batch) -> Result<Forward>;

    /// Training loss and gradients. Meta models expect an episodic batch,
    /// pretrain models a plain batch with global labels.
    fn set_forward_loss(&mut self, batch: &Batch) -> Result<ForwardLoss>;

    fn params(&self) -> &ParamStore;

    fn params_mut(&mut self) -> &mut ParamStore;

    fn layout(&self) -> EpisodeLayout;

    /// Switches between the training and the test episode layout.
    fn set_layout(&mut self, layout: EpisodeLayout) -> Result<()>;

    /// Replaces every parameter with the matching entry of `weights`.
    ///
    /// # Errors
    ///
    /// Fails when a parameter is missing or has a different shape. Extra
    /// entries in `weights` are ignored.
    fn load_params(&mut self, weights: &ParamStore) -> Result<()> {
        // Check everything first so a failed load leaves the model untouched.
        for (name, value) in self.params() {
            let loaded = weights
                .get(name)
                .ok_or_else(|| FewShotError::MissingParameter(name.clone()))?;
            if loaded.shape() != value.shape() {
                return Err(FewShotError::shape(name, value.shape(), loaded.shape()));
            }
        }
        for (name, value) in self.params_mut().iter_mut() {
            if let Some(loaded) = weights.get(name) {
                value.assign(loaded);
            }
        }
        Ok(())
    }
}

/// Builds the model described by `config` for samples of width `in_dim`.
pub fn build_model(config: &Config, in_dim: usize) -> Result<Box<dyn FewShotModel>> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let base = ModelBase::new(config.train_layout(), &config.backbone, in_dim, &mut rng);
    let classifier = &config.classifier;

    Ok(match classifier.name {
        ClassifierKind::Anil => Box::new(Anil::new(
            base,
            classifier.kwargs.hid_dim,
            classifier.kwargs.inner_optim.clone(),
            classifier.inner_train_iter(),
            &mut rng,
        )),
        ClassifierKind::R2d2 => Box::new(R2d2::new(
            base,
            classifier.kwargs.alpha,
            classifier.kwargs.beta,
            classifier.kwargs.gamma,
        )),
        ClassifierKind::Baseline | ClassifierKind::BaselinePlus => {
            let num_classes = classifier.kwargs.num_classes.ok_or_else(|| {
                FewShotError::Unsupported(format!(
                    "{} without classifier.kwargs.num_classes",
                    classifier.name.name()
                ))
            })?;
            let inner_optim = classifier.kwargs.inner_optim.clone();
            let iters = classifier.inner_train_iter();
            let seed = config.seed.wrapping_add(1);
            if classifier.name == ClassifierKind::Baseline {
                Box::new(Baseline::new(base, num_classes, inner_optim, iters, seed, &mut rng))
            } else {
                Box::new(BaselinePlus::new(base, num_classes, inner_optim, iters, seed, &mut rng))
            }
        }
    })
}
