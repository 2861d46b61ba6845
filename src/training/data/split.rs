//! Deterministic random splitting of a dataset into disjoint subsets

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::debug;

use super::{DataError, Dataset, Sample};

/// A view of a dataset restricted to a list of indices
pub struct Subset<D: Dataset + ?Sized> {
    dataset: Arc<D>,
    indices: Vec<usize>,
}

impl<D: Dataset + ?Sized> Subset<D> {
    /// Create a subset over `indices` of `dataset`
    pub fn new(dataset: Arc<D>, indices: Vec<usize>) -> Self {
        Self { dataset, indices }
    }

    /// Indices into the parent dataset
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }
}

impl<D: Dataset + ?Sized> Dataset for Subset<D> {
    fn len(&self) -> usize {
        self.indices.len()
    }

    fn get(&self, index: usize) -> Result<Sample, DataError> {
        let parent = *self.indices.get(index).ok_or(DataError::InvalidIndex {
            index,
            dataset_size: self.indices.len(),
        })?;
        self.dataset.get(parent)
    }

    fn name(&self) -> &str {
        self.dataset.name()
    }
}

const SNAP: f64 = 1e-9;

/// Subset sizes for `fractions` of `total` samples.
///
/// Each size is `floor(total * fraction)`; the samples left over are handed
/// out one at a time to the subsets in order. Products within `SNAP` of an
/// integer are snapped to it first, so `1.0 - 0.8` of ten samples is two.
pub fn split_lengths(total: usize, fractions: &[f64]) -> Result<Vec<usize>, DataError> {
    if fractions.is_empty() {
        return Err(DataError::InvalidSplit {
            reason: "no fractions given".into(),
        });
    }
    if fractions.iter().any(|f| !(0.0..=1.0).contains(f)) {
        return Err(DataError::InvalidSplit {
            reason: format!("fractions must lie in [0, 1], got {fractions:?}"),
        });
    }
    let sum: f64 = fractions.iter().sum();
    if (sum - 1.0).abs() > 1e-6 {
        return Err(DataError::InvalidSplit {
            reason: format!("fractions must sum to 1, got {sum}"),
        });
    }

    let mut lengths: Vec<usize> = fractions
        .iter()
        .map(|f| (total as f64 * f + SNAP).floor() as usize)
        .collect();
    let remainder = total - lengths.iter().sum::<usize>();
    for i in 0..remainder {
        let slot = i % lengths.len();
        lengths[slot] += 1;
    }
    Ok(lengths)
}

/// Randomly partition `dataset` into disjoint subsets sized by `fractions`.
///
/// The permutation depends only on `seed`, so the same seed always yields the
/// same split.
pub fn random_split<D: Dataset + ?Sized>(
    dataset: Arc<D>,
    fractions: &[f64],
    seed: u64,
) -> Result<Vec<Subset<D>>, DataError> {
    let total = dataset.len();
    let lengths = split_lengths(total, fractions)?;

    let mut permutation: Vec<usize> = (0..total).collect();
    permutation.shuffle(&mut StdRng::seed_from_u64(seed));

    let mut subsets = Vec::with_capacity(lengths.len());
    let mut offset = 0;
    for len in lengths {
        subsets.push(Subset::new(
            Arc::clone(&dataset),
            permutation[offset..offset + len].to_vec(),
        ));
        offset += len;
    }
    debug!(
        "split {} samples into {:?} with seed {}",
        total,
        subsets.iter().map(|s| s.len()).collect::<Vec<_>>(),
        seed
    );
    Ok(subsets)
}
