// --- File: src/episode.rs ---

//! Episodic batch layout: turning a batch into support / query splits.
//!
//! An episodic batch holds `episode_size` episodes back to back. Inside an
//! episode the rows are class-major, `way_num` blocks of
//! `shot_num + query_num` rows, and the first `shot_num` rows of every block
//! are the support samples:
//!
//! ```text
//! episode 0: [c0 s s | q q q] [c1 s s | q q q] ... [c{way-1} ...]
//! episode 1: ...
//! ```
//!
//! Class `c` of an episode has the local target `c`, whatever its global
//! label. Splits never mix rows of different episodes.

use crate::data::Batch;
use crate::error::{FewShotError, Result};
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

/// Shape of one episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeLayout {
    pub way_num: usize,
    pub shot_num: usize,
    pub query_num: usize,
}

/// How the episodes of a batch are handed to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitMode {
    /// One split per episode (meta models).
    PerEpisode,
    /// All episodes merged into a single support set and a single query set
    /// (testing of the pretrain family).
    Flat,
}

/// Support and query rows of one episode (or of a whole batch in
/// [`SplitMode::Flat`]) with their local targets.
#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeSplit {
    pub support: Array2<f32>,
    pub query: Array2<f32>,
    pub support_targets: Vec<usize>,
    pub query_targets: Vec<usize>,
}

impl EpisodeLayout {
    pub fn new(way_num: usize, shot_num: usize, query_num: usize) -> Self {
        Self {
            way_num,
            shot_num,
            query_num,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.way_num == 0 || self.shot_num == 0 || self.query_num == 0 {
            return Err(FewShotError::InvalidEpisode(format!(
                "way/shot/query must be positive, got {}/{}/{}",
                self.way_num, self.shot_num, self.query_num
            )));
        }
        Ok(())
    }

    /// Samples per class, support plus query.
    pub fn per_class(&self) -> usize {
        self.shot_num + self.query_num
    }

    /// Rows of one episode.
    pub fn episode_len(&self) -> usize {
        self.way_num * self.per_class()
    }

    pub fn support_len(&self) -> usize {
        self.way_num * self.shot_num
    }

    pub fn query_len(&self) -> usize {
        self.way_num * self.query_num
    }

    /// Number of episodes in a batch of `rows` rows.
    ///
    /// # Errors
    ///
    /// [`FewShotError::InvalidEpisode`] unless `rows` is a positive multiple
    /// of [`episode_len`](Self::episode_len).
    pub fn num_episodes(&self, rows: usize) -> Result<usize> {
        self.validate()?;
        let len = self.episode_len();
        if rows == 0 || rows % len != 0 {
            return Err(FewShotError::InvalidEpisode(format!(
                "{} rows is not a multiple of way*(shot+query) = {}",
                rows, len
            )));
        }
        Ok(rows / len)
    }

    /// Batch rows of the support samples of episode `e`, class-major.
    pub fn support_rows(&self, e: usize) -> Vec<usize> {
        let base = e * self.episode_len();
        (0..self.way_num)
            .flat_map(|c| {
                let start = base + c * self.per_class();
                start..start + self.shot_num
            })
            .collect()
    }

    /// Batch rows of the query samples of episode `e`, class-major.
    pub fn query_rows(&self, e: usize) -> Vec<usize> {
        let base = e * self.episode_len();
        (0..self.way_num)
            .flat_map(|c| {
                let start = base + c * self.per_class() + self.shot_num;
                start..start + self.query_num
            })
            .collect()
    }

    /// Local support targets of one episode: `[0; shot], [1; shot], ...`.
    pub fn support_targets(&self) -> Vec<usize> {
        repeat_classes(self.way_num, self.shot_num)
    }

    /// Local query targets of one episode.
    pub fn query_targets(&self) -> Vec<usize> {
        repeat_classes(self.way_num, self.query_num)
    }

    /// Local targets of every row of a batch of `episode_size` episodes.
    pub fn generate_local_targets(&self, episode_size: usize) -> Vec<usize> {
        let one = repeat_classes(self.way_num, self.per_class());
        (0..episode_size).flat_map(|_| one.iter().copied()).collect()
    }

    fn row_groups(&self, episodes: usize, mode: SplitMode) -> Vec<(Vec<usize>, Vec<usize>)> {
        match mode {
            SplitMode::PerEpisode => (0..episodes)
                .map(|e| (self.support_rows(e), self.query_rows(e)))
                .collect(),
            SplitMode::Flat => vec![(
                (0..episodes).flat_map(|e| self.support_rows(e)).collect(),
                (0..episodes).flat_map(|e| self.query_rows(e)).collect(),
            )],
        }
    }

    /// Splits a feature (or image) matrix into support and query sets.
    pub fn split_by_episode(&self, features: &Array2<f32>, mode: SplitMode) -> Result<Vec<EpisodeSplit>> {
        let episodes = self.num_episodes(features.nrows())?;
        let per_group = match mode {
            SplitMode::PerEpisode => 1,
            SplitMode::Flat => episodes,
        };
        let support_targets = repeat_n(&self.support_targets(), per_group);
        let query_targets = repeat_n(&self.query_targets(), per_group);

        Ok(self
            .row_groups(episodes, mode)
            .into_iter()
            .map(|(support_rows, query_rows)| EpisodeSplit {
                support: features.select(Axis(0), &support_rows),
                query: features.select(Axis(0), &query_rows),
                support_targets: support_targets.clone(),
                query_targets: query_targets.clone(),
            })
            .collect())
    }

    /// Checks that `batch` is a well-formed episodic batch and returns its
    /// number of episodes.
    ///
    /// Every class block must carry a single global label and no label may
    /// repeat inside an episode, which is what the episode sampler
    /// guarantees.
    pub fn check_batch(&self, batch: &Batch) -> Result<usize> {
        let episodes = self.num_episodes(batch.len())?;
        for (e, episode) in batch.labels.chunks(self.episode_len()).enumerate() {
            let mut seen = Vec::with_capacity(self.way_num);
            for block in episode.chunks(self.per_class()) {
                let label = block[0];
                if block.iter().any(|&l| l != label) {
                    return Err(FewShotError::InvalidEpisode(format!(
                        "episode {} mixes labels inside a class block",
                        e
                    )));
                }
                if seen.contains(&label) {
                    return Err(FewShotError::InvalidEpisode(format!(
                        "episode {} repeats class {}",
                        e, label
                    )));
                }
                seen.push(label);
            }
        }
        Ok(episodes)
    }

    /// Splits the images of a checked episodic batch.
    pub fn progress_batch(&self, batch: &Batch, mode: SplitMode) -> Result<Vec<EpisodeSplit>> {
        self.check_batch(batch)?;
        self.split_by_episode(&batch.images, mode)
    }

    /// Scatters per-split support / query gradients back to batch row order.
    ///
    /// `grads` holds one `(d_support, d_query)` pair per split produced by
    /// [`split_by_episode`](Self::split_by_episode) with the same `mode`.
    pub fn merge_episode_grads(
        &self,
        rows: usize,
        grads: &[(Array2<f32>, Array2<f32>)],
        mode: SplitMode,
    ) -> Result<Array2<f32>> {
        let episodes = self.num_episodes(rows)?;
        let groups = self.row_groups(episodes, mode);
        if grads.len() != groups.len() {
            return Err(FewShotError::InvalidEpisode(format!(
                "expected gradients for {} splits, got {}",
                groups.len(),
                grads.len()
            )));
        }
        let dim = grads.first().map(|(s, _)| s.ncols()).unwrap_or(0);

        let mut merged = Array2::zeros((rows, dim));
        for ((support_rows, query_rows), (d_support, d_query)) in groups.iter().zip(grads) {
            for (target_rows, source, what) in [
                (support_rows, d_support, "support gradient"),
                (query_rows, d_query, "query gradient"),
            ] {
                if source.dim() != (target_rows.len(), dim) {
                    return Err(FewShotError::shape(what, &[target_rows.len(), dim], source.shape()));
                }
                for (&row, src) in target_rows.iter().zip(source.rows()) {
                    merged.row_mut(row).assign(&src);
                }
            }
        }
        Ok(merged)
    }
}

fn repeat_classes(way: usize, times: usize) -> Vec<usize> {
    (0..way).flat_map(|c| std::iter::repeat(c).take(times)).collect()
}

fn repeat_n(values: &[usize], n: usize) -> Vec<usize> {
    (0..n).flat_map(|_| values.iter().copied()).collect()
}
