//! Batch collation for detection training
//!
//! Images in a batch may differ in size, so nothing is stacked: a batch is the
//! per-sample images and targets kept side by side in input order.

use candle_core::{Device, Tensor};

use super::{Sample, Target};

/// Trait for turning loaded samples into a batch
pub trait BatchCollator: Send + Sync {
    /// Collate samples into a batch
    fn collate_batch(&self, samples: Vec<Sample>) -> Batch;

    /// Clone the collator into a new box
    fn clone_box(&self) -> Box<dyn BatchCollator>;
}

/// A batch of images with their index-aligned targets
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[3, H, W]` images
    pub images: Vec<Tensor>,
    /// Targets, `targets[i]` annotating `images[i]`
    pub targets: Vec<Target>,
}

impl Batch {
    /// Number of samples in the batch
    pub fn len(&self) -> usize {
        self.images.len()
    }

    /// Whether the batch holds no samples
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Move every image and target tensor to `device`
    pub fn to_device(&self, device: &Device) -> candle_core::Result<Self> {
        let images = self
            .images
            .iter()
            .map(|image| image.to_device(device))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let targets = self
            .targets
            .iter()
            .map(|target| target.to_device(device))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self { images, targets })
    }
}

/// Split `(image, target)` pairs into parallel image and target lists
pub fn collate(samples: Vec<Sample>) -> Batch {
    let (images, targets) = samples
        .into_iter()
        .map(|sample| (sample.image, sample.target))
        .unzip();
    Batch { images, targets }
}

/// The default collator for detection samples
#[derive(Debug, Clone, Copy, Default)]
pub struct DetectionCollator;

impl BatchCollator for DetectionCollator {
    fn collate_batch(&self, samples: Vec<Sample>) -> Batch {
        collate(samples)
    }

    fn clone_box(&self) -> Box<dyn BatchCollator> {
        Box::new(*self)
    }
}
