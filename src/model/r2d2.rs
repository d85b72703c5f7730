// --- File: src/model/r2d2.rs ---

//! R2D2: meta-learning with differentiable closed-form solvers
//! (Bertinetto et al., ICLR 2019).
//!
//! Per episode, with support features `S` (`[n, d]`), one-hot support
//! targets `Y` (`[n, way]`) and query features `Q`:
//!
//! ```text
//! A = S Sᵀ + γ I          (n × n, the dual form of ridge regression)
//! W = Sᵀ A⁻¹ Y            (d × way)
//! Z = α · Q W + β
//! ```
//!
//! `α`, `β` and `γ` are learned by the outer loop. The backward pass below
//! differentiates through the linear solve, so the backbone is trained
//! through both the support and the query features.

use super::base::ModelBase;
use super::{FewShotModel, Forward, ForwardLoss, ModelKind};
use crate::data::Batch;
use crate::episode::{EpisodeLayout, EpisodeSplit, SplitMode};
use crate::error::{FewShotError, Result};
use crate::linalg::{gram_matrix, one_hot, solve};
use crate::losses::cross_entropy;
use crate::metrics::top1;
use crate::nn::params::{accumulate, scalar, ParamStore};
use ndarray::{arr1, concatenate, Array2, Axis};

/// The learnable scalars of the ridge-regression head.
#[derive(Debug, Clone)]
pub struct R2d2Layer {
    pub alpha: String,
    pub beta: String,
    pub gamma: String,
}

/// Intermediate values of one forward pass, reused by the backward pass.
struct Ridge {
    /// `A = S Sᵀ + γ I`.
    system: Array2<f32>,
    /// `M = A⁻¹ Y`.
    dual: Array2<f32>,
    /// `W = Sᵀ M`.
    weights: Array2<f32>,
    /// `Q W`, before scale and bias.
    scores: Array2<f32>,
}

impl R2d2Layer {
    /// Registers `{name}.alpha`, `{name}.beta` and `{name}.gamma`.
    pub fn new(store: &mut ParamStore, name: &str, alpha: f32, beta: f32, gamma: f32) -> Self {
        let layer = Self {
            alpha: format!("{}.alpha", name),
            beta: format!("{}.beta", name),
            gamma: format!("{}.gamma", name),
        };
        store.insert(layer.alpha.clone(), arr1(&[alpha]).into_dyn());
        store.insert(layer.beta.clone(), arr1(&[beta]).into_dyn());
        store.insert(layer.gamma.clone(), arr1(&[gamma]).into_dyn());
        layer
    }

    pub fn parameter_names(&self) -> Vec<String> {
        vec![self.alpha.clone(), self.beta.clone(), self.gamma.clone()]
    }

    fn check(&self, layout: &EpisodeLayout, split: &EpisodeSplit) -> Result<()> {
        let n_support = split.support.nrows();
        if n_support != layout.support_len() {
            return Err(FewShotError::InvalidEpisode(format!(
                "R2D2 needs way*shot = {} support samples, got {}",
                layout.support_len(),
                n_support
            )));
        }
        if split.query.ncols() != split.support.ncols() {
            return Err(FewShotError::shape(
                "R2D2 query features",
                &[split.query.nrows(), split.support.ncols()],
                split.query.shape(),
            ));
        }
        Ok(())
    }

    fn solve(&self, store: &ParamStore, layout: &EpisodeLayout, split: &EpisodeSplit) -> Result<Ridge> {
        self.check(layout, split)?;
        let gamma = scalar(store, &self.gamma)?;
        let support = &split.support;
        let n = support.nrows();

        let labels = one_hot(&split.support_targets, layout.way_num)?;
        let system = gram_matrix(support, support)? + &(Array2::<f32>::eye(n) * gamma);
        let dual = solve(&system, &labels)?;
        let weights = support.t().dot(&dual);
        let scores = split.query.dot(&weights);
        Ok(Ridge {
            system,
            dual,
            weights,
            scores,
        })
    }

    /// Query logits of one episode, `[way·query, way]`.
    pub fn forward(&self, store: &ParamStore, layout: &EpisodeLayout, split: &EpisodeSplit) -> Result<Array2<f32>> {
        let ridge = self.solve(store, layout, split)?;
        let alpha = scalar(store, &self.alpha)?;
        let beta = scalar(store, &self.beta)?;
        Ok(ridge.scores.mapv(|s| alpha * s + beta))
    }

    /// Back-propagates `grad_output` (dL/dZ), accumulating the gradients of
    /// `α`, `β`, `γ` and returning `(dL/dS, dL/dQ)`.
    pub fn backward(
        &self,
        store: &ParamStore,
        layout: &EpisodeLayout,
        split: &EpisodeSplit,
        grad_output: &Array2<f32>,
        grads: &mut ParamStore,
    ) -> Result<(Array2<f32>, Array2<f32>)> {
        let ridge = self.solve(store, layout, split)?;
        if grad_output.dim() != ridge.scores.dim() {
            return Err(FewShotError::shape("R2D2 grad_output", ridge.scores.shape(), grad_output.shape()));
        }
        let alpha = scalar(store, &self.alpha)?;
        let support = &split.support;

        let d_alpha = (grad_output * &ridge.scores).sum();
        let d_beta = grad_output.sum();
        let d_scores = grad_output * alpha;

        let d_query = d_scores.dot(&ridge.weights.t());
        let d_weights = split.query.t().dot(&d_scores);

        // W = Sᵀ M
        let mut d_support = ridge.dual.dot(&d_weights.t());
        let d_dual = support.dot(&d_weights);

        // M = A⁻¹ Y with A symmetric: dA = -A⁻¹ dM Mᵀ.
        let k = solve(&ridge.system, &d_dual)?;
        let d_system = -k.dot(&ridge.dual.t());
        let d_gamma = -(&k * &ridge.dual).sum();

        // A = S Sᵀ + γ I
        d_support += &(&d_system + &d_system.t()).dot(support);

        accumulate(grads, &self.alpha, arr1(&[d_alpha]).into_dyn());
        accumulate(grads, &self.beta, arr1(&[d_beta]).into_dyn());
        accumulate(grads, &self.gamma, arr1(&[d_gamma]).into_dyn());
        Ok((d_support, d_query))
    }
}

pub struct R2d2 {
    base: ModelBase,
    classifier: R2d2Layer,
}

impl R2d2 {
    pub fn new(mut base: ModelBase, alpha: f32, beta: f32, gamma: f32) -> Self {
        let classifier = R2d2Layer::new(&mut base.store, "classifier", alpha, beta, gamma);
        Self { base, classifier }
    }

    pub fn classifier(&self) -> &R2d2Layer {
        &self.classifier
    }

    fn score(&self, splits: &[EpisodeSplit]) -> Result<(Array2<f32>, Vec<usize>)> {
        let mut outputs = Vec::with_capacity(splits.len());
        let mut targets = Vec::new();
        for split in splits {
            outputs.push(self.classifier.forward(&self.base.store, &self.base.layout, split)?);
            targets.extend_from_slice(&split.query_targets);
        }
        let views: Vec<_> = outputs.iter().map(|o| o.view()).collect();
        let output = concatenate(Axis(0), &views).map_err(|e| FewShotError::InvalidEpisode(e.to_string()))?;
        Ok((output, targets))
    }
}

impl FewShotModel for R2d2 {
    fn name(&self) -> &'static str {
        "R2D2"
    }

    fn kind(&self) -> ModelKind {
        ModelKind::Meta
    }

    fn set_forward(&mut self, batch: &Batch) -> Result<Forward> {
        let (_, splits) = self.base.split_by_episode(batch, SplitMode::PerEpisode)?;
        let (output, targets) = self.score(&splits)?;
        let acc = top1(&output, &targets)?;
        Ok(Forward { output, acc })
    }

    /// Cross-entropy over the query rows of the whole batch, the mean taken
    /// over every query row of every episode.
    fn set_forward_loss(&mut self, batch: &Batch) -> Result<ForwardLoss> {
        let (_, splits) = self.base.split_by_episode(batch, SplitMode::PerEpisode)?;
        let (output, targets) = self.score(&splits)?;
        let (loss, grad_output) = cross_entropy(&output, &targets)?;

        let mut grads = ParamStore::new();
        let mut feat_grads = Vec::with_capacity(splits.len());
        let rows_per_episode = self.base.layout.query_len();
        for (e, split) in splits.iter().enumerate() {
            let grad_episode = grad_output
                .slice(ndarray::s![e * rows_per_episode..(e + 1) * rows_per_episode, ..])
                .to_owned();
            feat_grads.push(self.classifier.backward(
                &self.base.store,
                &self.base.layout,
                split,
                &grad_episode,
                &mut grads,
            )?);
        }

        let grad_feat = self
            .base
            .layout
            .merge_episode_grads(batch.len(), &feat_grads, SplitMode::PerEpisode)?;
        self.base.backward_features(&batch.images, &grad_feat, &mut grads)?;
        self.base.finish_grads(&mut grads);

        let acc = top1(&output, &targets)?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use crate::backbone::BackboneConfig;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn model(layout: EpisodeLayout, dim: usize) -> R2d2 {
        let mut rng = StdRng::seed_from_u64(0);
        let base = ModelBase::new(layout, &BackboneConfig::default(), dim, &mut rng);
        R2d2::new(base, 1.0, 0.0, 50.0)
    }

    #[test]
    fn test_registers_scalars() {
        let r2d2 = model(EpisodeLayout::new(5, 1, 15), 4);
        assert_eq!(r2d2.params().len(), 3);
        assert_eq!(scalar(r2d2.params(), "classifier.gamma").unwrap(), 50.0);
    }

    #[test]
    fn test_orthogonal_support_is_classified() {
        // 3-way 1-shot, one axis per class: the ridge weights are diagonal.
        let layout = EpisodeLayout::new(3, 1, 1);
        let mut r2d2 = model(layout, 3);
        let images = ndarray::arr2(&[
            [1.0, 0.0, 0.0],
            [0.9, 0.1, 0.0],
            [0.0, 1.0, 0.0],
            [0.1, 0.8, 0.0],
            [0.0, 0.0, 1.0],
            [0.0, 0.2, 0.9],
        ]);
        let batch = Batch::new(images, vec![0, 0, 1, 1, 2, 2]).unwrap();
        let forward = r2d2.set_forward(&batch).unwrap();
        assert_eq!(forward.acc, 100.0);

        // W = I / (1 + γ) for an orthonormal support.
        let split = &layout.split_by_episode(&batch.images, SplitMode::PerEpisode).unwrap()[0];
        let ridge = r2d2.classifier.solve(r2d2.params(), &layout, split).unwrap();
        assert_abs_diff_eq!(ridge.weights[[0, 0]], 1.0 / 51.0, epsilon = 1e-6);
        assert_abs_diff_eq!(ridge.weights[[0, 1]], 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_zero_alpha_scores_at_chance() {
        // Swapped queries would be misclassified; with alpha = 0 every logit
        // ties and the tie goes to class 0.
        let layout = EpisodeLayout::new(2, 1, 1);
        let mut r2d2 = model(layout, 2);
        r2d2.params_mut().insert("classifier.alpha".into(), arr1(&[0.0f32]).into_dyn());
        let images = ndarray::arr2(&[[1.0, 0.0], [0.0, 1.0], [0.0, 1.0], [1.0, 0.0]]);
        let batch = Batch::new(images, vec![3, 3, 7, 7]).unwrap();
        let forward = r2d2.set_forward(&batch).unwrap();
        assert!(forward.output.iter().all(|&z| z == 0.0));
        assert_eq!(forward.acc, 50.0);
    }

    #[test]
    fn test_support_count_is_checked() {
        let layout = EpisodeLayout::new(2, 2, 1);
        let r2d2 = model(layout, 2);
        let split = EpisodeSplit {
            support: Array2::ones((3, 2)),
            query: Array2::ones((2, 2)),
            support_targets: vec![0, 0, 1],
            query_targets: vec![0, 1],
        };
        assert!(matches!(
            r2d2.classifier.forward(r2d2.params(), &layout, &split),
            Err(FewShotError::InvalidEpisode(_))
        ));
    }

    #[test]
    fn test_loss_grads_for_scalars() {
        let layout = EpisodeLayout::new(2, 1, 1);
        let mut r2d2 = model(layout, 2);
        let images = ndarray::arr2(&[[1.0, 0.0], [0.8, 0.3], [0.0, 1.0], [0.2, 0.9], [1.0, 0.1], [0.9, 0.0], [0.1, 1.0], [0.0, 0.8]]);
        let batch = Batch::new(images, vec![1, 1, 2, 2, 5, 5, 6, 6]).unwrap();
        let result = r2d2.set_forward_loss(&batch).unwrap();
        assert_eq!(result.output.dim(), (4, 2));
        assert_eq!(result.grads.len(), 3);
        // Larger alpha sharpens correct predictions, so the loss decreases.
        assert!(result.grads["classifier.alpha"][[0]] < 0.0);
        // A smaller penalty fits the support better.
        assert!(result.grads["classifier.gamma"][[0]] > 0.0);
    }
}
