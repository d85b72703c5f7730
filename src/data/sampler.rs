// --- File: src/data/sampler.rs ---

//! Index samplers.
//!
//! - [`RandomSampler`] / [`BatchSampler`]: shuffled plain batches for
//!   pretraining.
//! - [`EpisodeSampler`]: class-major episodic batches for meta-training and
//!   for every evaluation.
//!
//! All samplers own a seeded `StdRng`, so a run is reproducible from the
//! configured seed.

use crate::episode::EpisodeLayout;
use crate::error::{FewShotError, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeMap;

/// Base trait for index samplers.
pub trait Sampler: Iterator<Item = usize> {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Starts a new pass (and reshuffles random samplers).
    fn reset(&mut self);
}

/// Visits `0..len` in a random order, reshuffled on every reset.
pub struct RandomSampler {
    indices: Vec<usize>,
    current: usize,
    rng: StdRng,
}

impl RandomSampler {
    pub fn with_seed(len: usize, seed: u64) -> Self {
        let mut sampler = Self {
            indices: (0..len).collect(),
            current: 0,
            rng: StdRng::seed_from_u64(seed),
        };
        sampler.indices.shuffle(&mut sampler.rng);
        sampler
    }
}

impl Iterator for RandomSampler {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        let idx = *self.indices.get(self.current)?;
        self.current += 1;
        Some(idx)
    }
}

impl Sampler for RandomSampler {
    fn len(&self) -> usize {
        self.indices.len()
    }

    fn reset(&mut self) {
        self.current = 0;
        self.indices.shuffle(&mut self.rng);
    }
}

/// Groups the indices of a sampler into batches.
pub struct BatchSampler<S: Sampler> {
    sampler: S,
    batch_size: usize,
    drop_last: bool,
}

impl<S: Sampler> BatchSampler<S> {
    pub fn new(sampler: S, batch_size: usize, drop_last: bool) -> Self {
        Self {
            sampler,
            batch_size,
            drop_last,
        }
    }

    pub fn num_batches(&self) -> usize {
        let n = self.sampler.len();
        if self.drop_last {
            n / self.batch_size
        } else {
            (n + self.batch_size - 1) / self.batch_size
        }
    }

    pub fn reset(&mut self) {
        self.sampler.reset();
    }

    /// Next batch, starting a new pass when the current one is exhausted.
    ///
    /// The pretrain trainer asks for a fixed number of batches per epoch,
    /// independent of the dataset size.
    pub fn next_cycled(&mut self) -> Result<Vec<usize>> {
        if let Some(batch) = self.next() {
            return Ok(batch);
        }
        self.reset();
        self.next().ok_or_else(|| {
            FewShotError::NotEnoughData(format!(
                "{} samples cannot fill a batch of {}",
                self.sampler.len(),
                self.batch_size
            ))
        })
    }
}

impl<S: Sampler> Iterator for BatchSampler<S> {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        let batch: Vec<usize> = self.sampler.by_ref().take(self.batch_size).collect();
        if batch.is_empty() || (batch.len() < self.batch_size && self.drop_last) {
            return None;
        }
        Some(batch)
    }
}

/// Draws episodic batches from a labelled dataset.
///
/// Every call yields the indices of `episode_size` episodes back to back.
/// Each episode picks `way_num` classes without replacement and
/// `shot_num + query_num` samples per class without replacement, laid out
/// class-major: for each class first its support samples, then its query
/// samples. Only classes with enough samples are eligible.
pub struct EpisodeSampler {
    classes: Vec<usize>,
    by_class: BTreeMap<usize, Vec<usize>>,
    layout: EpisodeLayout,
    episode_size: usize,
    iterations: usize,
    current: usize,
    rng: StdRng,
}

impl EpisodeSampler {
    /// # Errors
    ///
    /// [`FewShotError::NotEnoughData`] when fewer than `way_num` classes have
    /// at least `shot_num + query_num` samples.
    pub fn new(
        labels: &[usize],
        layout: EpisodeLayout,
        episode_size: usize,
        iterations: usize,
        seed: u64,
    ) -> Result<Self> {
        layout.validate()?;
        if episode_size == 0 {
            return Err(FewShotError::InvalidEpisode("episode_size must be positive".into()));
        }

        let mut by_class: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (i, &label) in labels.iter().enumerate() {
            by_class.entry(label).or_default().push(i);
        }
        let needed = layout.per_class();
        by_class.retain(|_, idx| idx.len() >= needed);

        if by_class.len() < layout.way_num {
            return Err(FewShotError::NotEnoughData(format!(
                "{}-way episodes need {} classes with at least {} samples, found {}",
                layout.way_num,
                layout.way_num,
                needed,
                by_class.len()
            )));
        }

        Ok(Self {
            classes: by_class.keys().copied().collect(),
            by_class,
            layout,
            episode_size,
            iterations,
            current: 0,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn layout(&self) -> EpisodeLayout {
        self.layout
    }

    pub fn num_eligible_classes(&self) -> usize {
        self.classes.len()
    }

    /// Number of batches per pass.
    pub fn len(&self) -> usize {
        self.iterations
    }

    pub fn is_empty(&self) -> bool {
        self.iterations == 0
    }

    pub fn reset(&mut self) {
        self.current = 0;
    }

    /// Indices of one episodic batch, regardless of the pass counter.
    pub fn sample_batch(&mut self) -> Vec<usize> {
        let per_class = self.layout.per_class();
        let mut indices = Vec::with_capacity(self.episode_size * self.layout.episode_len());
        for _ in 0..self.episode_size {
            let chosen: Vec<usize> = self
                .classes
                .choose_multiple(&mut self.rng, self.layout.way_num)
                .copied()
                .collect();
            for class in chosen {
                let pool = &self.by_class[&class];
                indices.extend(pool.choose_multiple(&mut self.rng, per_class).copied());
            }
        }
        indices
    }
}

impl Iterator for EpisodeSampler {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current >= self.iterations {
            return None;
        }
        self.current += 1;
        Some(self.sample_batch())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn labels(classes: usize, per_class: usize) -> Vec<usize> {
        (0..classes).flat_map(|c| std::iter::repeat(c).take(per_class)).collect()
    }

    #[test]
    fn test_random_sampler_is_a_permutation() {
        let mut sampler = RandomSampler::with_seed(10, 0);
        let mut first: Vec<usize> = sampler.by_ref().collect();
        first.sort_unstable();
        assert_eq!(first, (0..10).collect::<Vec<_>>());
        sampler.reset();
        assert_eq!(sampler.count(), 10);
    }

    #[test]
    fn test_batch_sampler_drop_last_and_cycle() {
        let mut batches = BatchSampler::new(RandomSampler::with_seed(10, 1), 4, true);
        assert_eq!(batches.num_batches(), 2);
        assert_eq!(batches.next().map(|b| b.len()), Some(4));
        assert_eq!(batches.next().map(|b| b.len()), Some(4));
        assert!(batches.next().is_none());
        assert_eq!(batches.next_cycled().unwrap().len(), 4);

        let mut too_small = BatchSampler::new(RandomSampler::with_seed(3, 1), 4, true);
        assert!(too_small.next_cycled().is_err());
    }

    #[test]
    fn test_episode_batches_are_class_major() {
        let labels = labels(8, 6);
        let layout = EpisodeLayout::new(3, 2, 2);
        let mut sampler = EpisodeSampler::new(&labels, layout, 2, 5, 42).unwrap();

        let batches: Vec<Vec<usize>> = sampler.by_ref().collect();
        assert_eq!(batches.len(), 5);
        for batch in &batches {
            assert_eq!(batch.len(), 2 * 3 * 4);
            for episode in batch.chunks(12) {
                let mut seen = HashSet::new();
                for block in episode.chunks(4) {
                    let class = labels[block[0]];
                    assert!(block.iter().all(|&i| labels[i] == class));
                    // Samples within a class are distinct.
                    assert_eq!(block.iter().collect::<HashSet<_>>().len(), 4);
                    assert!(seen.insert(class), "class repeated inside an episode");
                }
            }
        }
        sampler.reset();
        assert!(sampler.next().is_some());
    }

    #[test]
    fn test_small_classes_are_not_eligible() {
        let mut labels = labels(4, 5);
        labels.extend([9, 9]);
        let sampler = EpisodeSampler::new(&labels, EpisodeLayout::new(4, 1, 4), 1, 1, 0).unwrap();
        assert_eq!(sampler.num_eligible_classes(), 4);
        assert!(matches!(
            EpisodeSampler::new(&labels, EpisodeLayout::new(5, 1, 4), 1, 1, 0),
            Err(FewShotError::NotEnoughData(_))
        ));
    }

    #[test]
    fn test_seeded_sampling_is_reproducible() {
        let labels = labels(10, 10);
        let layout = EpisodeLayout::new(5, 1, 3);
        let mut a = EpisodeSampler::new(&labels, layout, 1, 3, 7).unwrap();
        let mut b = EpisodeSampler::new(&labels, layout, 1, 3, 7).unwrap();
        assert_eq!(a.sample_batch(), b.sample_batch());
    }
}
