//! Data loader with background prefetching and parallel sample decoding
//!
//! Each loader owns a small tokio runtime. A pass spawns one producer task
//! that loads batches in order on the blocking pool and pushes them through a
//! bounded channel; the training loop pulls them synchronously. Samples inside
//! a batch are decoded in parallel on a rayon pool when `num_workers > 1`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::{Batch, BatchCollator, DataError, Dataset, DetectionCollator};

/// Configuration for DataLoader
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataLoaderConfig {
    /// Batch size
    pub batch_size: usize,
    /// Whether to reshuffle sample order every epoch
    pub shuffle: bool,
    /// Threads decoding samples in parallel; 0 or 1 decodes sequentially
    pub num_workers: usize,
    /// Batches buffered ahead of the consumer
    pub prefetch: usize,
    /// Whether to drop the last incomplete batch
    pub drop_last: bool,
    /// Base seed of the shuffle order; `None` draws from OS entropy
    pub seed: Option<u64>,
}

impl Default for DataLoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            shuffle: true,
            num_workers: 0,
            prefetch: 2,
            drop_last: false,
            seed: None,
        }
    }
}

/// Iterates a dataset in batches, one pass per call to [`DataLoader::iter`]
pub struct DataLoader {
    dataset: Arc<dyn Dataset>,
    config: DataLoaderConfig,
    collator: Box<dyn BatchCollator>,
    pool: Option<Arc<ThreadPool>>,
    runtime: Arc<Runtime>,
    epoch: AtomicUsize,
}

impl DataLoader {
    /// Create a new DataLoader with the detection collator
    pub fn new(dataset: Arc<dyn Dataset>, config: DataLoaderConfig) -> Result<Self, DataError> {
        Self::with_collator(dataset, config, Box::new(DetectionCollator))
    }

    /// Create a new DataLoader with a custom collator
    pub fn with_collator(
        dataset: Arc<dyn Dataset>,
        config: DataLoaderConfig,
        collator: Box<dyn BatchCollator>,
    ) -> Result<Self, DataError> {
        if config.batch_size == 0 {
            return Err(DataError::InvalidLoaderConfig {
                reason: "batch_size must be > 0".into(),
            });
        }
        let pool = if config.num_workers > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(config.num_workers)
                .thread_name(|i| format!("treeseg-loader-{i}"))
                .build()
                .map_err(|e| DataError::WorkerFailed {
                    reason: e.to_string(),
                })?;
            Some(Arc::new(pool))
        } else {
            None
        };

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("treeseg-prefetch")
            .build()
            .map_err(|e| DataError::WorkerFailed {
                reason: format!("could not start prefetch runtime: {e}"),
            })?;

        info!(
            "Creating DataLoader over {} samples with batch_size={}, num_workers={}, shuffle={}",
            dataset.len(),
            config.batch_size,
            config.num_workers,
            config.shuffle
        );

        Ok(Self {
            dataset,
            config,
            collator,
            pool,
            runtime: Arc::new(runtime),
            epoch: AtomicUsize::new(0),
        })
    }

    /// Number of batches per pass
    pub fn len(&self) -> usize {
        let n = self.dataset.len();
        if self.config.drop_last {
            n / self.config.batch_size
        } else {
            n.div_ceil(self.config.batch_size)
        }
    }

    /// Whether a pass yields no batches
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of samples behind the loader
    pub fn dataset_size(&self) -> usize {
        self.dataset.len()
    }

    /// Loader configuration
    pub fn config(&self) -> &DataLoaderConfig {
        &self.config
    }

    fn epoch_batches(&self, epoch: usize) -> Vec<Vec<usize>> {
        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();
        if self.config.shuffle {
            match self.config.seed {
                Some(seed) => {
                    indices.shuffle(&mut StdRng::seed_from_u64(seed.wrapping_add(epoch as u64)))
                }
                None => indices.shuffle(&mut rand::rng()),
            }
        }
        indices
            .chunks(self.config.batch_size)
            .filter(|chunk| !self.config.drop_last || chunk.len() == self.config.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect()
    }

    /// Start a pass over the dataset.
    ///
    /// Batches arrive in order; the producer stops early when the returned
    /// iterator is dropped. Must not be consumed from inside an async context.
    pub fn iter(&self) -> BatchIter {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst);
        let batches = self.epoch_batches(epoch);
        let total = batches.len();
        let (sender, receiver) = mpsc::channel(self.config.prefetch.max(1));

        let dataset = Arc::clone(&self.dataset);
        let collator: Arc<dyn BatchCollator> = Arc::from(self.collator.clone_box());
        let pool = self.pool.clone();

        debug!("pass {} over {} batches", epoch, total);
        self.runtime.spawn(async move {
            for (batch_idx, indices) in batches.into_iter().enumerate() {
                let loaded = tokio::task::spawn_blocking({
                    let dataset = Arc::clone(&dataset);
                    let collator = Arc::clone(&collator);
                    let pool = pool.clone();
                    move || {
                        load_samples(dataset.as_ref(), &indices, pool.as_deref())
                            .map(|samples| collator.collate_batch(samples))
                    }
                })
                .await
                .unwrap_or_else(|e| {
                    Err(DataError::WorkerFailed {
                        reason: format!("batch {batch_idx} task failed: {e}"),
                    })
                });

                if let Err(e) = &loaded {
                    error!("batch {} failed to load: {}", batch_idx, e);
                }
                let failed = loaded.is_err();
                if sender.send(loaded).await.is_err() {
                    debug!("pass {} abandoned after batch {}", epoch, batch_idx);
                    break;
                }
                if failed {
                    break;
                }
            }
        });

        BatchIter {
            receiver,
            delivered: 0,
            total,
            finished: false,
        }
    }
}

fn load_samples(
    dataset: &dyn Dataset,
    indices: &[usize],
    pool: Option<&ThreadPool>,
) -> Result<Vec<super::Sample>, DataError> {
    match pool {
        Some(pool) => pool.install(|| indices.par_iter().map(|&i| dataset.get(i)).collect()),
        None => indices.iter().map(|&i| dataset.get(i)).collect(),
    }
}

/// Ordered batches of one pass
pub struct BatchIter {
    receiver: mpsc::Receiver<Result<Batch, DataError>>,
    delivered: usize,
    total: usize,
    finished: bool,
}

impl BatchIter {
    /// Batches in this pass
    pub fn total(&self) -> usize {
        self.total
    }
}

impl Iterator for BatchIter {
    type Item = Result<Batch, DataError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished || self.delivered == self.total {
            return None;
        }
        match self.receiver.blocking_recv() {
            Some(item) => {
                self.delivered += 1;
                if item.is_err() {
                    self.finished = true;
                }
                Some(item)
            }
            None => {
                self.finished = true;
                Some(Err(DataError::WorkerFailed {
                    reason: format!(
                        "prefetch stopped after {} of {} batches",
                        self.delivered, self.total
                    ),
                }))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.total - self.delivered;
        (0, Some(left))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::data::{Sample, Target};
    use candle_core::{DType, Device, Tensor};

    struct Numbered(usize);

    impl Dataset for Numbered {
        fn len(&self) -> usize {
            self.0
        }

        fn get(&self, index: usize) -> Result<Sample, DataError> {
            if index >= self.0 {
                return Err(DataError::InvalidIndex {
                    index,
                    dataset_size: self.0,
                });
            }
            let device = Device::Cpu;
            Ok(Sample {
                image: Tensor::zeros((3, 2, 2), DType::F32, &device)?,
                target: Target {
                    image_id: index as u64,
                    boxes: Tensor::zeros((0, 4), DType::F32, &device)?,
                    labels: Tensor::zeros(0, DType::U32, &device)?,
                    masks: Tensor::zeros((0, 2, 2), DType::U8, &device)?,
                    area: Tensor::zeros(0, DType::F32, &device)?,
                    iscrowd: Tensor::zeros(0, DType::U8, &device)?,
                },
            })
        }
    }

    fn ids(loader: &DataLoader) -> Vec<Vec<u64>> {
        loader
            .iter()
            .map(|b| b.unwrap().targets.iter().map(|t| t.image_id).collect())
            .collect()
    }

    #[test]
    fn test_sequential_batches_in_order() {
        let config = DataLoaderConfig {
            batch_size: 2,
            shuffle: false,
            ..Default::default()
        };
        let loader = DataLoader::new(Arc::new(Numbered(5)), config).unwrap();
        assert_eq!(loader.len(), 3);
        assert_eq!(ids(&loader), vec![vec![0, 1], vec![2, 3], vec![4]]);
    }

    #[test]
    fn test_drop_last() {
        let config = DataLoaderConfig {
            batch_size: 2,
            shuffle: false,
            drop_last: true,
            ..Default::default()
        };
        let loader = DataLoader::new(Arc::new(Numbered(5)), config).unwrap();
        assert_eq!(loader.len(), 2);
        assert_eq!(ids(&loader).len(), 2);
    }

    #[test]
    fn test_parallel_workers_keep_every_sample_once() {
        let config = DataLoaderConfig {
            batch_size: 3,
            shuffle: true,
            num_workers: 3,
            seed: Some(11),
            ..Default::default()
        };
        let loader = DataLoader::new(Arc::new(Numbered(10)), config).unwrap();
        let mut seen: Vec<u64> = ids(&loader).into_iter().flatten().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_seeded_shuffle_changes_between_passes() {
        let config = DataLoaderConfig {
            batch_size: 10,
            shuffle: true,
            seed: Some(3),
            ..Default::default()
        };
        let a = DataLoader::new(Arc::new(Numbered(10)), config.clone()).unwrap();
        let b = DataLoader::new(Arc::new(Numbered(10)), config).unwrap();
        let first = ids(&a);
        assert_eq!(first, ids(&b));
        assert_ne!(first, ids(&a));
    }

    #[test]
    fn test_dropped_pass_does_not_block_the_next() {
        let config = DataLoaderConfig {
            batch_size: 1,
            shuffle: false,
            prefetch: 1,
            ..Default::default()
        };
        let loader = DataLoader::new(Arc::new(Numbered(6)), config).unwrap();
        let mut first = loader.iter();
        assert!(first.next().is_some());
        drop(first);
        assert_eq!(ids(&loader).len(), 6);
    }

    #[test]
    fn test_failed_sample_ends_the_pass() {
        struct Broken;
        impl Dataset for Broken {
            fn len(&self) -> usize {
                4
            }
            fn get(&self, index: usize) -> Result<Sample, DataError> {
                Err(DataError::InvalidIndex {
                    index,
                    dataset_size: 0,
                })
            }
        }
        let config = DataLoaderConfig {
            batch_size: 2,
            shuffle: false,
            ..Default::default()
        };
        let loader = DataLoader::new(Arc::new(Broken), config).unwrap();
        let items: Vec<_> = loader.iter().collect();
        assert_eq!(items.len(), 1);
        assert!(items[0].is_err());
    }

    #[test]
    fn test_empty_dataset_yields_no_batches() {
        let loader = DataLoader::new(Arc::new(Numbered(0)), DataLoaderConfig::default()).unwrap();
        assert!(loader.is_empty());
        assert_eq!(loader.iter().count(), 0);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let config = DataLoaderConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            DataLoader::new(Arc::new(Numbered(3)), config),
            Err(DataError::InvalidLoaderConfig { .. })
        ));
    }
}
