// --- File: src/data/dataset.rs ---

//! Datasets of flattened samples with integer class labels.

use crate::error::{FewShotError, Result};
use ndarray::{Array1, Array2, Axis};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A batch of samples: one flattened sample per row and its global label.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub images: Array2<f32>,
    pub labels: Vec<usize>,
}

impl Batch {
    pub fn new(images: Array2<f32>, labels: Vec<usize>) -> Result<Self> {
        if images.nrows() != labels.len() {
            return Err(FewShotError::shape("batch labels", &[images.nrows()], &[labels.len()]));
        }
        Ok(Self { images, labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// A source of labelled samples.
pub trait Dataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flattened dimension of a sample.
    fn sample_dim(&self) -> usize;

    fn get(&self, index: usize) -> Option<(Array1<f32>, usize)>;

    fn labels(&self) -> &[usize];

    /// Gathers the rows `indices`, in order, into a [`Batch`].
    fn batch(&self, indices: &[usize]) -> Result<Batch>;

    /// Distinct labels, ascending.
    fn classes(&self) -> Vec<usize> {
        let mut classes: Vec<usize> = self.labels().to_vec();
        classes.sort_unstable();
        classes.dedup();
        classes
    }

    /// Sample indices grouped by label.
    fn indices_by_class(&self) -> BTreeMap<usize, Vec<usize>> {
        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (i, &label) in self.labels().iter().enumerate() {
            groups.entry(label).or_default().push(i);
        }
        groups
    }
}

/// Dataset held entirely in memory. Cloning shares the underlying storage.
#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    features: Arc<Array2<f32>>,
    labels: Arc<Vec<usize>>,
}

impl InMemoryDataset {
    pub fn new(features: Array2<f32>, labels: Vec<usize>) -> Result<Self> {
        if features.nrows() != labels.len() {
            return Err(FewShotError::shape(
                "dataset labels",
                &[features.nrows()],
                &[labels.len()],
            ));
        }
        Ok(Self {
            features: Arc::new(features),
            labels: Arc::new(labels),
        })
    }

    pub fn features(&self) -> &Array2<f32> {
        &self.features
    }

    pub fn num_classes(&self) -> usize {
        self.classes().len()
    }

    /// Relabels classes to `0..num_classes` in ascending order of the old
    /// label. Pretraining heads index classes directly.
    pub fn with_dense_labels(&self) -> Self {
        let mapping: BTreeMap<usize, usize> = self
            .classes()
            .into_iter()
            .enumerate()
            .map(|(new, old)| (old, new))
            .collect();
        let labels = self.labels.iter().map(|l| mapping[l]).collect();
        Self {
            features: Arc::clone(&self.features),
            labels: Arc::new(labels),
        }
    }
}

impl Dataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.labels.len()
    }

    fn sample_dim(&self) -> usize {
        self.features.ncols()
    }

    fn get(&self, index: usize) -> Option<(Array1<f32>, usize)> {
        let label = *self.labels.get(index)?;
        Some((self.features.row(index).to_owned(), label))
    }

    fn labels(&self) -> &[usize] {
        &self.labels
    }

    fn batch(&self, indices: &[usize]) -> Result<Batch> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.len()) {
            return Err(FewShotError::NotEnoughData(format!(
                "sample index {} out of range for {} samples",
                bad,
                self.len()
            )));
        }
        let images = self.features.select(Axis(0), indices);
        let labels = indices.iter().map(|&i| self.labels[i]).collect();
        Batch::new(images, labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    fn toy() -> InMemoryDataset {
        let features = arr2(&[[0.0, 0.0], [1.0, 1.0], [2.0, 2.0], [3.0, 3.0]]);
        InMemoryDataset::new(features, vec![7, 3, 7, 3]).unwrap()
    }

    #[test]
    fn test_batch_gathers_in_order() {
        let ds = toy();
        let batch = ds.batch(&[3, 0]).unwrap();
        assert_eq!(batch.images, arr2(&[[3.0, 3.0], [0.0, 0.0]]));
        assert_eq!(batch.labels, vec![3, 7]);
        assert!(ds.batch(&[4]).is_err());
    }

    #[test]
    fn test_class_grouping_and_dense_labels() {
        let ds = toy();
        assert_eq!(ds.classes(), vec![3, 7]);
        assert_eq!(ds.indices_by_class()[&7], vec![0, 2]);
        let dense = ds.with_dense_labels();
        assert_eq!(dense.labels(), &[1, 0, 1, 0]);
        assert_eq!(dense.get(1).unwrap().1, 0);
    }

    #[test]
    fn test_length_mismatch() {
        assert!(InMemoryDataset::new(Array2::zeros((2, 3)), vec![0]).is_err());
    }
}
