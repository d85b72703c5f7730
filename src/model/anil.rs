// --- File: src/model/anil.rs ---

//! ANIL: "Almost No Inner Loop" (Raghu et al., ICLR 2020).
//!
//! Only the classifier head is adapted per episode. The support features are
//! computed once, a copy of the head is fine-tuned on them, and the query
//! features are scored by the adapted copy. The model's own head is never
//! touched by the inner loop.

use super::base::{fine_tune, ModelBase};
use super::{FewShotModel, Forward, ForwardLoss, ModelKind};
use crate::data::Batch;
use crate::episode::{EpisodeLayout, EpisodeSplit, SplitMode};
use crate::error::{FewShotError, Result};
use crate::losses::cross_entropy;
use crate::metrics::top1;
use crate::nn::params::{self, ParamStore};
use crate::nn::{FeedForward, Module};
use crate::optimizers::OptimizerConfig;
use ndarray::{concatenate, Array2, Axis};
use rand::Rng;

const HEAD_PREFIX: &str = "classifier.";

pub struct Anil {
    base: ModelBase,
    classifier: FeedForward,
    inner_optim: OptimizerConfig,
    inner_train_iter: usize,
}

impl Anil {
    pub fn new<R: Rng + ?Sized>(
        mut base: ModelBase,
        hid_dim: usize,
        inner_optim: OptimizerConfig,
        inner_train_iter: usize,
        rng: &mut R,
    ) -> Self {
        let feat_dim = base.feat_dim();
        let way = base.layout.way_num;
        let classifier = FeedForward::new(&mut base.store, "classifier", feat_dim, hid_dim, way, rng);
        Self {
            base,
            classifier,
            inner_optim,
            inner_train_iter,
        }
    }

    /// Fine-tunes a copy of the head on the support set of one episode.
    pub fn train_loop(&self, support_feat: &Array2<f32>, support_targets: &[usize]) -> Result<ParamStore> {
        let mut head = params::subset(&self.base.store, HEAD_PREFIX);
        fine_tune(
            &self.classifier,
            &mut head,
            support_feat,
            support_targets,
            &self.inner_optim,
            self.inner_train_iter,
        )?;
        Ok(head)
    }

    /// Adapts on the support set and scores the query set of one episode.
    fn adapt_and_score(&self, split: &EpisodeSplit) -> Result<(ParamStore, Array2<f32>)> {
        let head = self.train_loop(&split.support, &split.support_targets)?;
        let output = self.classifier.forward(&head, &split.query)?;
        Ok((head, output))
    }
}

fn stack_rows(outputs: &[Array2<f32>]) -> Result<Array2<f32>> {
    let views: Vec<_> = outputs.iter().map(|o| o.view()).collect();
    concatenate(Axis(0), &views).map_err(|e| FewShotError::InvalidEpisode(e.to_string()))
}

impl FewShotModel for Anil {
    fn name(&self) -> &'static str {
        "ANIL"
    }

    fn kind(&self) -> ModelKind {
        ModelKind::Meta
    }

    fn set_forward(&mut self, batch: &Batch) -> Result<Forward> {
        let (_, splits) = self.base.split_by_episode(batch, SplitMode::PerEpisode)?;
        let mut outputs = Vec::with_capacity(splits.len());
        let mut targets = Vec::new();
        for split in &splits {
            outputs.push(self.adapt_and_score(split)?.1);
            targets.extend_from_slice(&split.query_targets);
        }
        let output = stack_rows(&outputs)?;
        let acc = top1(&output, &targets)?;
        Ok(Forward { output, acc })
    }

    /// Query cross-entropy averaged over the episodes of the batch.
    ///
    /// The backbone receives the exact gradient through the query features
    /// (support features are treated as constants). The head receives the
    /// first-order meta-gradient: the query gradient evaluated at the adapted
    /// weights.
    fn set_forward_loss(&mut self, batch: &Batch) -> Result<ForwardLoss> {
        let (_, splits) = self.base.split_by_episode(batch, SplitMode::PerEpisode)?;
        let episodes = splits.len() as f32;

        let mut grads = ParamStore::new();
        let mut feat_grads = Vec::with_capacity(splits.len());
        let mut outputs = Vec::with_capacity(splits.len());
        let mut targets = Vec::new();
        let mut total_loss = 0.0;
        for split in &splits {
            let (head, output) = self.adapt_and_score(split)?;
            let (loss, grad_logits) = cross_entropy(&output, &split.query_targets)?;
            total_loss += loss;

            let mut head_grads = ParamStore::new();
            let grad_query = self.classifier.backward(&head, &split.query, &grad_logits, &mut head_grads)?;
            params::accumulate_all(&mut grads, head_grads);
            feat_grads.push((Array2::zeros(split.support.raw_dim()), grad_query));
            outputs.push(output);
            targets.extend_from_slice(&split.query_targets);
        }

        let grad_feat = self
            .base
            .layout
            .merge_episode_grads(batch.len(), &feat_grads, SplitMode::PerEpisode)?;
        self.base.backward_features(&batch.images, &grad_feat, &mut grads)?;
        self.base.finish_grads(&mut grads);
        // Mean over the episodes of the batch.
        params::scale(&mut grads, 1.0 / episodes);

        let output = stack_rows(&outputs)?;
        let acc = top1(&output, &targets)?;
        Ok(ForwardLoss {
            output,
            acc,
            loss: total_loss / episodes,
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
        if layout.way_num != self.classifier.out_dim() {
            return Err(FewShotError::InvalidEpisode(format!(
                "ANIL head has {} outputs, cannot run {}-way episodes",
                self.classifier.out_dim(),
                layout.way_num
            )));
        }
        self.base.layout = layout;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backbone::BackboneConfig;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// One 2-way 2-shot 2-query episode in 2-D, classes on the two axes.
    fn episode() -> Batch {
        let rows = [
            [3.0, 0.1],
            [2.8, -0.2],
            [3.1, 0.0],
            [2.9, 0.2],
            [0.1, 3.0],
            [-0.1, 2.9],
            [0.2, 3.2],
            [0.0, 2.7],
        ];
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        Batch::new(Array2::from_shape_vec((8, 2), flat).unwrap(), vec![4, 4, 4, 4, 9, 9, 9, 9]).unwrap()
    }

    fn model(iters: usize) -> Anil {
        let mut rng = StdRng::seed_from_u64(5);
        let base = ModelBase::new(EpisodeLayout::new(2, 2, 2), &BackboneConfig::default(), 2, &mut rng);
        Anil::new(base, 8, OptimizerConfig::sgd(0.5), iters, &mut rng)
    }

    #[test]
    fn test_set_forward_leaves_head_untouched() {
        let mut anil = model(10);
        let before = anil.params().clone();
        let forward = anil.set_forward(&episode()).unwrap();
        assert_eq!(anil.params(), &before);
        assert_eq!(forward.output.dim(), (4, 2));
        assert_eq!(forward.acc, 100.0);
    }

    #[test]
    fn test_zero_inner_steps_uses_the_meta_head() {
        let mut anil = model(0);
        let batch = episode();
        let forward = anil.set_forward(&batch).unwrap();
        let splits = anil.base.layout.split_by_episode(&batch.images, SplitMode::PerEpisode).unwrap();
        let direct = anil.classifier.forward(anil.params(), &splits[0].query).unwrap();
        assert_eq!(forward.output, direct);
    }

    #[test]
    fn test_loss_grads_cover_the_head() {
        let mut anil = model(3);
        let result = anil.set_forward_loss(&episode()).unwrap();
        assert!(result.loss.is_finite());
        assert_eq!(result.grads.len(), 4);
        for name in anil.classifier.parameter_names() {
            assert_eq!(result.grads[&name].shape(), anil.params()[&name].shape());
        }
    }

    fn assert_stores_close(actual: &ParamStore, expected: &ParamStore) {
        assert_eq!(actual.len(), expected.len());
        for (name, value) in expected {
            assert_eq!(actual[name].shape(), value.shape(), "{}", name);
            for (a, e) in actual[name].iter().zip(value.iter()) {
                assert_abs_diff_eq!(*a, *e, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_head_gradient_is_taken_at_the_adapted_weights() {
        let mut anil = model(3);
        let batch = episode();
        let result = anil.set_forward_loss(&batch).unwrap();

        let split = anil
            .base
            .layout
            .split_by_episode(&batch.images, SplitMode::PerEpisode)
            .unwrap()
            .remove(0);
        let adapted = anil.train_loop(&split.support, &split.support_targets).unwrap();
        let output = anil.classifier.forward(&adapted, &split.query).unwrap();
        let (loss, grad_logits) = cross_entropy(&output, &split.query_targets).unwrap();
        let mut expected = ParamStore::new();
        anil.classifier
            .backward(&adapted, &split.query, &grad_logits, &mut expected)
            .unwrap();

        assert_abs_diff_eq!(result.loss, loss, epsilon = 1e-6);
        assert_stores_close(&result.grads, &expected);
        // The gradient differs from the one at the un-adapted head.
        let mut at_meta = ParamStore::new();
        let meta_logits = anil.classifier.forward(anil.params(), &split.query).unwrap();
        let (_, meta_grad) = cross_entropy(&meta_logits, &split.query_targets).unwrap();
        anil.classifier
            .backward(anil.params(), &split.query, &meta_grad, &mut at_meta)
            .unwrap();
        assert_ne!(result.grads, at_meta);
    }

    #[test]
    fn test_grads_are_averaged_over_episodes() {
        let mut anil = model(2);
        let single = episode();
        let one = anil.set_forward_loss(&single).unwrap();

        let images = ndarray::concatenate(Axis(0), &[single.images.view(), single.images.view()]).unwrap();
        let mut labels = single.labels.clone();
        labels.extend_from_slice(&single.labels);
        let two = anil.set_forward_loss(&Batch::new(images, labels).unwrap()).unwrap();

        assert_abs_diff_eq!(two.loss, one.loss, epsilon = 1e-6);
        assert_stores_close(&two.grads, &one.grads);
    }

    #[test]
    fn test_way_mismatch_is_rejected() {
        let mut anil = model(1);
        assert!(anil.set_layout(EpisodeLayout::new(3, 1, 1)).is_err());
        assert!(anil.set_layout(EpisodeLayout::new(2, 5, 3)).is_ok());
    }
}
