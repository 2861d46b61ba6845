//! TreeSeg - training pipeline for Mask R-CNN style instance segmentation
//!
//! This crate trains a two-stage detector on a COCO-format dataset: it builds
//! the model, splits and batches the data, runs warmed-up SGD training with
//! per-epoch validation, and keeps best, periodic and final checkpoints plus a
//! loss-curve plot.

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod error;
pub mod model;
pub mod training;

// Re-exports
pub use config::Config;
pub use error::{Error, Result};
pub use model::{build_detector, Detector, DetectorConfig, LossDict, LossTerm, MaskRcnn};
pub use training::{DataLoader, Trainer, TrainingResult};
