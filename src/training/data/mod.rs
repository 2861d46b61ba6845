//! Data loading infrastructure for detector training
//!
//! This module provides the dataset abstraction, the bundled COCO dataset,
//! deterministic train/validation splitting, batch collation and a prefetching
//! data loader.

use candle_core::{Device, Tensor};

use crate::model::box_ops::BBox;

pub mod batching;
pub mod coco;
pub mod loaders;
pub mod split;

pub use batching::{collate, Batch, BatchCollator, DetectionCollator};
pub use coco::CocoDataset;
pub use loaders::{DataLoader, DataLoaderConfig};
pub use split::{random_split, split_lengths, Subset};

/// Common trait for all training datasets
pub trait Dataset: Send + Sync {
    /// Get the number of samples in the dataset
    fn len(&self) -> usize;

    /// Check if the dataset is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get a sample by index
    fn get(&self, index: usize) -> Result<Sample, DataError>;

    /// Dataset name used in logs
    fn name(&self) -> &str {
        "dataset"
    }
}

/// One image and its annotations
#[derive(Debug, Clone)]
pub struct Sample {
    /// `[3, H, W]` f32 image in `[0, 1]`
    pub image: Tensor,
    /// Instance annotations
    pub target: Target,
}

/// Instance annotations of one image
#[derive(Debug, Clone)]
pub struct Target {
    /// Source image id; not a tensor and never moved between devices
    pub image_id: u64,
    /// `[N, 4]` f32 boxes, `(x0, y0, x1, y1)` pixels
    pub boxes: Tensor,
    /// `[N]` u32 class labels, 1-based
    pub labels: Tensor,
    /// `[N, H, W]` u8 binary instance masks
    pub masks: Tensor,
    /// `[N]` f32 instance areas
    pub area: Tensor,
    /// `[N]` u8 crowd flags
    pub iscrowd: Tensor,
}

impl Target {
    /// Number of annotated instances
    pub fn num_instances(&self) -> usize {
        self.labels.dims().first().copied().unwrap_or(0)
    }

    /// Copy every tensor field to `device`; `image_id` passes through
    pub fn to_device(&self, device: &Device) -> candle_core::Result<Self> {
        Ok(Self {
            image_id: self.image_id,
            boxes: self.boxes.to_device(device)?,
            labels: self.labels.to_device(device)?,
            masks: self.masks.to_device(device)?,
            area: self.area.to_device(device)?,
            iscrowd: self.iscrowd.to_device(device)?,
        })
    }

    /// Boxes on the host
    pub fn boxes_vec(&self) -> candle_core::Result<Vec<BBox>> {
        if self.num_instances() == 0 {
            return Ok(Vec::new());
        }
        Ok(self
            .boxes
            .to_vec2::<f32>()?
            .into_iter()
            .map(|b| [b[0], b[1], b[2], b[3]])
            .collect())
    }

    /// Labels on the host
    pub fn labels_vec(&self) -> candle_core::Result<Vec<u32>> {
        self.labels.to_vec1::<u32>()
    }
}

/// Error types for data loading
#[derive(thiserror::Error, Debug)]
pub enum DataError {
    /// Annotation file or image directory is missing
    #[error("Dataset not found: {path}")]
    DatasetNotFound {
        /// Path that was looked up
        path: String,
    },

    /// Sample index out of range
    #[error("Invalid sample index: {index} >= {dataset_size}")]
    InvalidIndex {
        /// Requested index
        index: usize,
        /// Number of samples
        dataset_size: usize,
    },

    /// Annotation or image content could not be interpreted
    #[error("Malformed data at index {index}: {reason}")]
    MalformedData {
        /// Sample index
        index: usize,
        /// What was wrong
        reason: String,
    },

    /// Split fractions do not describe the dataset
    #[error("Invalid split: {reason}")]
    InvalidSplit {
        /// What was wrong
        reason: String,
    },

    /// Data loader settings that cannot produce batches
    #[error("Invalid loader configuration: {reason}")]
    InvalidLoaderConfig {
        /// What was wrong
        reason: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Tensor error
    #[error("Tensor error: {0}")]
    TensorError(#[from] candle_core::Error),

    /// Annotation JSON error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Image decoding error
    #[error("Image error: {0}")]
    ImageError(#[from] image::ImageError),

    /// The loader's worker stopped before delivering every batch
    #[error("Data loader worker failed: {reason}")]
    WorkerFailed {
        /// What happened
        reason: String,
    },
}
