// --- File: src/data/synthetic.rs ---

//! Gaussian-cluster datasets with class-disjoint splits.
//!
//! Every class owns a mean drawn once from `N(0, I) · separation / sqrt(dim)`
//! and its samples are `mean + noise · N(0, I)`. Train, validation and test
//! use different classes, as few-shot benchmarks do.

use super::dataset::InMemoryDataset;
use super::Splits;
use crate::error::{FewShotError, Result};
use ndarray::{Array2, Axis};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// Size and difficulty of a synthetic benchmark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    pub train_classes: usize,
    pub val_classes: usize,
    pub test_classes: usize,
    pub samples_per_class: usize,
    pub dim: usize,
    /// Expected distance scale between class means.
    pub separation: f32,
    /// Per-dimension standard deviation around a class mean.
    pub noise: f32,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            train_classes: 64,
            val_classes: 16,
            test_classes: 20,
            samples_per_class: 40,
            dim: 32,
            separation: 4.0,
            noise: 1.0,
        }
    }
}

impl SyntheticConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.train_classes < 2 || self.val_classes < 2 || self.test_classes < 2 {
            return Err("every split needs at least two classes".into());
        }
        if self.samples_per_class == 0 || self.dim == 0 {
            return Err("samples_per_class and dim must be positive".into());
        }
        if !(self.separation.is_finite() && self.separation > 0.0) {
            return Err("separation must be positive".into());
        }
        if !(self.noise.is_finite() && self.noise >= 0.0) {
            return Err("noise must be non-negative".into());
        }
        Ok(())
    }

    /// Generates the three splits. Global labels run over all splits, so the
    /// train split uses `0..train_classes`.
    pub fn generate(&self, seed: u64) -> Result<Splits> {
        self.validate().map_err(FewShotError::NotEnoughData)?;
        let mut rng = StdRng::seed_from_u64(seed);

        let total = self.train_classes + self.val_classes + self.test_classes;
        let scale = self.separation / (self.dim as f32).sqrt();
        let means = Array2::<f32>::random_using((total, self.dim), StandardNormal, &mut rng) * scale;

        let mut make_split = |classes: std::ops::Range<usize>| -> Result<InMemoryDataset> {
            let n = classes.len() * self.samples_per_class;
            let mut features =
                Array2::<f32>::random_using((n, self.dim), StandardNormal, &mut rng) * self.noise;
            let mut labels = Vec::with_capacity(n);
            for (block, class) in classes.enumerate() {
                let start = block * self.samples_per_class;
                let mut rows = features.slice_mut(ndarray::s![start..start + self.samples_per_class, ..]);
                rows += &means.index_axis(Axis(0), class);
                labels.extend(std::iter::repeat(class).take(self.samples_per_class));
            }
            InMemoryDataset::new(features, labels)
        };

        let train_end = self.train_classes;
        let val_end = train_end + self.val_classes;
        Ok(Splits {
            train: make_split(0..train_end)?,
            val: make_split(train_end..val_end)?,
            test: make_split(val_end..total)?,
        })
    }
}
