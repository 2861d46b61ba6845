//! Error types for the TreeSeg training pipeline

use thiserror::Error;

use crate::training::data::DataError;

/// Main error type for TreeSeg operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Detector construction or forward error
    #[error("Model error: {0}")]
    Model(String),

    /// Dataset or data loader error
    #[error("Data error: {0}")]
    Data(#[from] DataError),

    /// A data loader yields no batches, so per-epoch means are undefined
    #[error("The {split} data loader is empty (dataset has {samples} samples, batch size {batch_size})")]
    EmptyLoader {
        /// Which split the loader serves
        split: String,
        /// Number of samples in the split
        samples: usize,
        /// Configured batch size
        batch_size: usize,
    },

    /// The summed training loss became NaN or infinite
    #[error("Loss is {loss_sum}, stopping training (epoch {epoch}, batch {batch}): {losses}")]
    LossDiverged {
        /// Epoch in which the loss diverged
        epoch: usize,
        /// Batch index within the epoch
        batch: usize,
        /// The offending summed loss
        loss_sum: f64,
        /// Rendered loss dictionary of the diverged batch
        losses: String,
    },

    /// Checkpoint encoding, decoding or compatibility error
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Tensor operation error
    #[error("Tensor operation error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Binary encoding error
    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// Image encoding error
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for TreeSeg operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a model error
    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    /// Create a checkpoint error
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error must terminate the process rather than be retried
    pub fn is_fatal_divergence(&self) -> bool {
        matches!(self, Self::LossDiverged { .. })
    }
}
