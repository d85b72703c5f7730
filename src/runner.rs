// --- File: src/runner.rs ---

//! Training and testing entry points.
//!
//! [`Trainer::train_loop`] runs the outer loop: one optimizer step per batch,
//! validation on episodes of unseen classes after every epoch, and the
//! `model_best` / `model_last` checkpoints in the result directory.
//! [`Test::test_loop`] reloads `model_best` and reports accuracy with a 95%
//! confidence interval over many test episodes.

use crate::config::Config;
use crate::data::{load_splits, BatchSampler, Dataset, EpisodeSampler, InMemoryDataset, RandomSampler, Splits};
use crate::episode::EpisodeLayout;
use crate::error::{FewShotError, Result};
use crate::metrics::{mean_confidence_interval, AverageMeter};
use crate::model::{build_model, FewShotModel, ModelKind};
use crate::nn::params;
use crate::optimizers::{LrScheduler, Optimizer};
use crate::serialization::{Checkpoint, CheckpointMeta};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const CONFIG_FILE: &str = "config.yaml";
pub const BEST_CHECKPOINT: &str = "model_best";
pub const LAST_CHECKPOINT: &str = "model_last";

/// Number of progress lines logged per training epoch.
const LOG_LINES_PER_EPOCH: usize = 10;

/// Sampler seeds differ per split and per epoch but are fixed by the run seed.
fn derive_seed(base: u64, stream: u64, epoch: usize) -> u64 {
    base.wrapping_mul(1_000_003)
        .wrapping_add(stream.wrapping_mul(7_919))
        .wrapping_add(epoch as u64)
}

const TRAIN_STREAM: u64 = 1;
const VAL_STREAM: u64 = 2;
const TEST_STREAM: u64 = 3;

/// Accuracy of one evaluation pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EvalResult {
    /// Mean episode accuracy in percent.
    pub acc: f64,
    /// Half-width of the 95% confidence interval.
    pub h: f64,
}

/// Runs `iterations` episodic batches of `dataset` through `set_forward`.
///
/// The model is switched to `layout` for the pass and restored afterwards.
fn evaluate(
    model: &mut dyn FewShotModel,
    dataset: &InMemoryDataset,
    layout: EpisodeLayout,
    episode_size: usize,
    iterations: usize,
    seed: u64,
) -> Result<EvalResult> {
    let train_layout = model.layout();
    model.set_layout(layout)?;
    let outcome = (|| -> Result<EvalResult> {
        let mut sampler = EpisodeSampler::new(dataset.labels(), layout, episode_size, iterations, seed)?;
        let mut accs = Vec::with_capacity(iterations);
        for indices in sampler.by_ref() {
            let batch = dataset.batch(&indices)?;
            accs.push(model.set_forward(&batch)?.acc);
        }
        let (acc, h) = mean_confidence_interval(&accs);
        Ok(EvalResult { acc, h })
    })();
    model.set_layout(train_layout)?;
    outcome
}

// ============================================================================
// Training
// ============================================================================

/// Per-epoch summary of a training run.
#[derive(Debug, Clone, Serialize)]
pub struct EpochSummary {
    pub epoch: usize,
    pub learning_rate: f32,
    pub train_loss: f64,
    pub train_acc: f64,
    pub val: EvalResult,
    pub test: EvalResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainReport {
    pub best_epoch: usize,
    pub best_val_acc: f64,
    /// Test accuracy at the best validation epoch.
    pub test_at_best: EvalResult,
    pub history: Vec<EpochSummary>,
}

pub struct Trainer {
    config: Config,
    result_dir: PathBuf,
    splits: Splits,
    model: Box<dyn FewShotModel>,
    optimizer: Box<dyn Optimizer>,
    scheduler: LrScheduler,
}

impl Trainer {
    /// Loads the data described by `config` and prepares the result
    /// directory.
    pub fn new(config: Config) -> Result<Self> {
        let splits = load_splits(&config.data, config.seed)?;
        Self::with_splits(config, splits)
    }

    /// Like [`Trainer::new`] with data supplied by the caller.
    pub fn with_splits(config: Config, mut splits: Splits) -> Result<Self> {
        config.validate()?;
        let model = build_model(&config, splits.sample_dim())?;

        if model.kind() == ModelKind::Pretrain {
            let classes = splits.train.num_classes();
            let num_classes = config.classifier.kwargs.num_classes.unwrap_or(0);
            if num_classes < classes {
                return Err(FewShotError::NotEnoughData(format!(
                    "classifier.kwargs.num_classes = {} but the train split has {} classes",
                    num_classes, classes
                )));
            }
            // The pretraining head indexes classes directly.
            splits.train = splits.train.with_dense_labels();
        }

        let result_dir = config.result_dir();
        fs::create_dir_all(&result_dir)?;
        config.save(result_dir.join(CONFIG_FILE))?;

        let optimizer = config.optimizer.build();
        let scheduler = LrScheduler::new(config.optimizer.lr(), config.lr_scheduler.clone());
        info!(
            model = model.name(),
            params = params::numel(model.params()),
            result_dir = %result_dir.display(),
            "Trainer ready"
        );
        Ok(Self {
            config,
            result_dir,
            splits,
            model,
            optimizer,
            scheduler,
        })
    }

    pub fn result_dir(&self) -> &Path {
        &self.result_dir
    }

    pub fn model(&self) -> &dyn FewShotModel {
        self.model.as_ref()
    }

    /// Runs every epoch and returns the run summary.
    pub fn train_loop(&mut self) -> Result<TrainReport> {
        let mut history = Vec::with_capacity(self.config.epoch);
        let mut best: Option<(usize, f64, EvalResult)> = None;

        for epoch in 0..self.config.epoch {
            let lr = self.scheduler.learning_rate(epoch);
            self.optimizer.set_learning_rate(lr);
            info!("============ Train on the train set ============");
            info!(epoch, lr, "learning rate");

            let (train_loss, train_acc) = self.train_epoch(epoch)?;

            info!("============ Validation on the val set ============");
            let val_set = self.splits.val.clone();
            let val = self.eval_split(&val_set, VAL_STREAM, epoch)?;
            info!(epoch, "val acc: {:.3} +- {:.3}", val.acc, val.h);

            info!("============ Testing on the test set ============");
            let test_set = self.splits.test.clone();
            let test = self.eval_split(&test_set, TEST_STREAM, epoch)?;
            info!(epoch, "test acc: {:.3} +- {:.3}", test.acc, test.h);

            let improved = best.map_or(true, |(_, best_acc, _)| val.acc > best_acc);
            if improved {
                best = Some((epoch, val.acc, test));
                self.save_checkpoint(BEST_CHECKPOINT, epoch, val.acc, val.acc, false)?;
                info!(epoch, "new best val acc {:.3}, saved {}", val.acc, BEST_CHECKPOINT);
            }
            let best_acc = best.map_or(val.acc, |(_, acc, _)| acc);
            self.save_checkpoint(LAST_CHECKPOINT, epoch, val.acc, best_acc, true)?;

            history.push(EpochSummary {
                epoch,
                learning_rate: lr,
                train_loss,
                train_acc,
                val,
                test,
            });
        }

        let (best_epoch, best_val_acc, test_at_best) = best.ok_or_else(|| {
            FewShotError::NotEnoughData("training ran for zero epochs".into())
        })?;
        info!(
            best_epoch,
            "best val acc {:.3}, test acc at best {:.3} +- {:.3}",
            best_val_acc,
            test_at_best.acc,
            test_at_best.h
        );
        Ok(TrainReport {
            best_epoch,
            best_val_acc,
            test_at_best,
            history,
        })
    }

    /// One epoch of outer-loop updates. Returns mean loss and accuracy.
    fn train_epoch(&mut self, epoch: usize) -> Result<(f64, f64)> {
        let iterations = self.config.train_episode;
        let seed = derive_seed(self.config.seed, TRAIN_STREAM, epoch);
        let mut loss_meter = AverageMeter::new("loss");
        let mut acc_meter = AverageMeter::new("acc");
        let log_every = (iterations / LOG_LINES_PER_EPOCH).max(1);

        let train = &self.splits.train;
        let mut batches: Box<dyn FnMut() -> Result<Vec<usize>>> = match self.model.kind() {
            ModelKind::Meta => {
                let mut sampler = EpisodeSampler::new(
                    train.labels(),
                    self.config.train_layout(),
                    self.config.episode_size,
                    iterations,
                    seed,
                )?;
                Box::new(move || Ok(sampler.sample_batch()))
            }
            ModelKind::Pretrain => {
                let mut sampler = BatchSampler::new(
                    RandomSampler::with_seed(train.len(), seed),
                    self.config.batch_size,
                    true,
                );
                Box::new(move || sampler.next_cycled())
            }
        };

        for step in 0..iterations {
            let indices = batches()?;
            let batch = train.batch(&indices)?;
            let result = self.model.set_forward_loss(&batch)?;

            if !result.loss.is_finite() || !params::all_finite(&result.grads) {
                return Err(FewShotError::NonFinite(format!(
                    "loss {} at epoch {} step {}",
                    result.loss, epoch, step
                )));
            }
            self.optimizer.step(self.model.params_mut(), &result.grads)?;

            loss_meter.update(f64::from(result.loss), 1);
            acc_meter.update(result.acc, 1);
            if (step + 1) % log_every == 0 || step + 1 == iterations {
                info!(
                    "Epoch-({}): [{}/{}]\tLoss {:.4} ({:.4})\tAcc@1 {:.3} ({:.3})",
                    epoch,
                    step + 1,
                    iterations,
                    loss_meter.last(),
                    loss_meter.avg(),
                    acc_meter.last(),
                    acc_meter.avg()
                );
            }
        }
        Ok((loss_meter.avg(), acc_meter.avg()))
    }

    fn eval_split(&mut self, dataset: &InMemoryDataset, stream: u64, epoch: usize) -> Result<EvalResult> {
        evaluate(
            self.model.as_mut(),
            dataset,
            self.config.test_layout(),
            self.config.episode_size,
            self.config.test_episode,
            derive_seed(self.config.seed, stream, epoch),
        )
    }

    fn save_checkpoint(&self, name: &str, epoch: usize, val_acc: f64, best_val_acc: f64, with_optimizer: bool) -> Result<()> {
        let meta = CheckpointMeta::new(&self.config.model_name())
            .with_epoch(epoch)
            .with_learning_rate(self.optimizer.learning_rate())
            .with_val_acc(val_acc)
            .with_best_val_acc(best_val_acc)
            .with_metadata("way_num", &self.config.way_num.to_string())
            .with_metadata("shot_num", &self.config.shot_num.to_string());
        let mut checkpoint = Checkpoint::new(self.model.params().clone(), meta);
        if with_optimizer {
            checkpoint = checkpoint.with_optimizer_state(self.optimizer.state());
        }
        checkpoint.save(self.result_dir.join(name))?;
        debug!(checkpoint = name, epoch, "saved checkpoint");
        Ok(())
    }
}

// ============================================================================
// Testing
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct TestReport {
    /// One entry per test epoch.
    pub epoch_results: Vec<EvalResult>,
    /// Mean of the per-epoch accuracies.
    pub mean_acc: f64,
    /// Mean of the per-epoch confidence half-widths.
    pub mean_h: f64,
}

/// Evaluates the best checkpoint of a finished run.
pub struct Test {
    config: Config,
    splits: Splits,
    model: Box<dyn FewShotModel>,
}

impl Test {
    /// Loads the data and the `model_best` checkpoint under `result_dir`.
    ///
    /// `config` is normally the `config.yaml` of `result_dir` with test-time
    /// overrides already applied.
    pub fn new<P: AsRef<Path>>(config: Config, result_dir: P) -> Result<Self> {
        let splits = load_splits(&config.data, config.seed)?;
        Self::with_splits(config, result_dir, splits)
    }

    pub fn with_splits<P: AsRef<Path>>(config: Config, result_dir: P, splits: Splits) -> Result<Self> {
        config.validate()?;
        let mut model = build_model(&config, splits.sample_dim())?;
        let checkpoint_dir = result_dir.as_ref().join(BEST_CHECKPOINT);
        let checkpoint = Checkpoint::load_for(&checkpoint_dir, &config.model_name())?;
        model.load_params(&checkpoint.weights)?;
        info!(
            checkpoint = %checkpoint_dir.display(),
            epoch = checkpoint.meta.epoch,
            "loaded {} (val acc {:?})",
            config.model_name(),
            checkpoint.meta.val_acc
        );
        if checkpoint.weights.len() > model.params().len() {
            warn!("checkpoint holds parameters the model does not use");
        }
        Ok(Self { config, splits, model })
    }

    /// Runs `test_epoch` passes of `test_episode` batches over the test split.
    pub fn test_loop(&mut self) -> Result<TestReport> {
        let layout = self.config.test_layout();
        info!(
            "Testing {}-way {}-shot, {} epochs of {} episodes",
            layout.way_num, layout.shot_num, self.config.test_epoch, self.config.test_episode
        );
        let mut epoch_results = Vec::with_capacity(self.config.test_epoch);
        for epoch in 0..self.config.test_epoch {
            let result = evaluate(
                self.model.as_mut(),
                &self.splits.test,
                layout,
                self.config.episode_size,
                self.config.test_episode,
                derive_seed(self.config.seed, TEST_STREAM, 10_000 + epoch),
            )?;
            info!("Epoch-({}): Acc {:.3} +- {:.3}", epoch, result.acc, result.h);
            epoch_results.push(result);
        }

        let n = epoch_results.len().max(1) as f64;
        let mean_acc = epoch_results.iter().map(|r| r.acc).sum::<f64>() / n;
        let mean_h = epoch_results.iter().map(|r| r.h).sum::<f64>() / n;
        info!("Aver_accuracy: {:.3}\tAver_h: {:.3}", mean_acc, mean_h);
        Ok(TestReport {
            epoch_results,
            mean_acc,
            mean_h,
        })
    }
}
