//! Configuration structures for the TreeSeg training pipeline
//!
//! Configuration is layered: built-in defaults (matching the reference training
//! recipe), then an optional JSON/YAML/TOML file, then `TREESEG__*` environment
//! variables, then command-line overrides applied by the binary.

use std::path::{Path, PathBuf};

use candle_core::Device;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::DetectorConfig;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "TREESEG";

/// Main configuration for a training run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Dataset and loader configuration
    pub data: DataConfig,
    /// Detector configuration
    pub model: DetectorConfig,
    /// Optimizer configuration
    pub optimizer: OptimizerConfig,
    /// Epoch-level learning rate schedule
    pub scheduler: SchedulerConfig,
    /// First-epoch warmup schedule
    pub warmup: WarmupConfig,
    /// Training loop parameters
    pub training: TrainingParams,
    /// Output artifact configuration
    pub output: OutputConfig,
}

impl Config {
    /// Load configuration from an optional file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(Error::config(format!(
                    "configuration file not found: {}",
                    path.display()
                )));
            }
            debug!("Reading configuration from {}", path.display());
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let settings = builder
            .build()
            .map_err(|e| Error::config(e.to_string()))?;
        let config: Self = settings
            .try_deserialize()
            .map_err(|e| Error::config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::load(Some(path.as_ref()))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;

        if !(self.data.train_fraction > 0.0 && self.data.train_fraction < 1.0) {
            return Err(Error::config(format!(
                "data.train_fraction must be in (0, 1), got {}",
                self.data.train_fraction
            )));
        }

        if self.training.batch_size == 0 {
            return Err(Error::config("training.batch_size must be > 0"));
        }

        if !(self.optimizer.learning_rate > 0.0 && self.optimizer.learning_rate.is_finite()) {
            return Err(Error::config("optimizer.learning_rate must be a positive number"));
        }

        if !(0.0..1.0).contains(&self.optimizer.momentum) {
            return Err(Error::config("optimizer.momentum must be in [0, 1)"));
        }

        if self.optimizer.weight_decay < 0.0 {
            return Err(Error::config("optimizer.weight_decay must be >= 0"));
        }

        if self.scheduler.step_size == 0 {
            return Err(Error::config("scheduler.step_size must be > 0"));
        }

        if !(self.warmup.start_factor > 0.0 && self.warmup.start_factor <= 1.0) {
            return Err(Error::config("warmup.start_factor must be in (0, 1]"));
        }

        if self.output.model_name.trim().is_empty() {
            return Err(Error::config("output.model_name must not be empty"));
        }

        if self.output.periodic_every == 0 {
            return Err(Error::config("output.periodic_every must be > 0"));
        }

        Ok(())
    }

    /// Render the resolved configuration as YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| Error::config(e.to_string()))
    }

    /// Fraction of the dataset held out for validation
    pub fn val_fraction(&self) -> f64 {
        1.0 - self.data.train_fraction
    }
}

/// Dataset and data loader configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DataConfig {
    /// COCO annotation file
    pub coco_path: PathBuf,
    /// Directory holding the images; defaults to the annotation file's directory
    pub image_dir: Option<PathBuf>,
    /// Share of samples used for training; the rest validates
    pub train_fraction: f64,
    /// Seed of the train/validation split
    pub split_seed: u64,
    /// Whether loaders reshuffle every epoch
    pub shuffle: bool,
    /// Seed for loader shuffling; random when unset
    pub shuffle_seed: Option<u64>,
    /// Threads decoding samples within a batch
    pub num_workers: usize,
    /// Number of batches prepared ahead of the training loop
    pub prefetch: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            coco_path: PathBuf::from("annotations.json"),
            image_dir: None,
            train_fraction: 0.8,
            split_seed: 0,
            shuffle: true,
            shuffle_seed: None,
            num_workers: num_cpus::get().min(4),
            prefetch: 2,
        }
    }
}

/// SGD optimizer configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Base learning rate
    pub learning_rate: f64,
    /// Momentum coefficient
    pub momentum: f64,
    /// Weight decay coefficient
    pub weight_decay: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            momentum: 0.9,
            weight_decay: 5e-4,
        }
    }
}

/// Step-decay schedule applied once per epoch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Epochs between decays
    pub step_size: usize,
    /// Multiplicative decay; 1.0 keeps the rate constant
    pub gamma: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            step_size: 10,
            gamma: 1.0,
        }
    }
}

/// Linear warmup applied per batch during the first epoch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WarmupConfig {
    /// Learning rate multiplier at the first batch
    pub start_factor: f64,
    /// Upper bound on warmup iterations
    pub max_iters: usize,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            start_factor: 1.0 / 1000.0,
            max_iters: 1000,
        }
    }
}

impl WarmupConfig {
    /// Number of warmup iterations for a loader with `num_batches` batches
    pub fn iterations(&self, num_batches: usize) -> usize {
        self.max_iters.min(num_batches.saturating_sub(1))
    }
}

/// Training loop parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrainingParams {
    /// Number of epochs
    pub num_epochs: usize,
    /// Samples per batch
    pub batch_size: usize,
    /// Compute device
    pub device: DeviceType,
    /// Checkpoint to resume from
    pub resume_from: Option<PathBuf>,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            num_epochs: 20,
            batch_size: 1,
            device: DeviceType::Auto,
            resume_from: None,
        }
    }
}

/// Output artifact configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory receiving checkpoints and plots
    pub dir: PathBuf,
    /// Stem of every artifact file name
    pub model_name: String,
    /// Epoch period of the periodic checkpoint
    pub periodic_every: usize,
    /// Whether to render the loss curve every epoch
    pub save_plot: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            model_name: "my_model".to_string(),
            periodic_every: 5,
            save_plot: true,
        }
    }
}

/// Compute device selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// Accelerator when available, otherwise CPU
    #[default]
    Auto,
    /// CPU
    Cpu,
    /// CUDA device by ordinal
    Cuda(usize),
    /// Metal device by ordinal
    Metal(usize),
}

impl DeviceType {
    /// Resolve to a candle device
    pub fn resolve(self) -> Result<Device> {
        let device = match self {
            DeviceType::Cpu => Device::Cpu,
            DeviceType::Cuda(ordinal) => Device::new_cuda(ordinal)?,
            DeviceType::Metal(ordinal) => Device::new_metal(ordinal)?,
            DeviceType::Auto => {
                if candle_core::utils::cuda_is_available() {
                    Device::new_cuda(0)?
                } else if candle_core::utils::metal_is_available() {
                    Device::new_metal(0)?
                } else {
                    Device::Cpu
                }
            }
        };
        info!("training device is {:?}", device);
        Ok(device)
    }
}

impl std::str::FromStr for DeviceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        let parse_ordinal = |rest: &str| -> Result<usize> {
            if rest.is_empty() {
                Ok(0)
            } else {
                rest.trim_start_matches(':')
                    .parse()
                    .map_err(|_| Error::config(format!("invalid device ordinal in '{s}'")))
            }
        };
        match lower.as_str() {
            "auto" => Ok(DeviceType::Auto),
            "cpu" => Ok(DeviceType::Cpu),
            other if other.starts_with("cuda") => Ok(DeviceType::Cuda(parse_ordinal(&other[4..])?)),
            other if other.starts_with("metal") => Ok(DeviceType::Metal(parse_ordinal(&other[5..])?)),
            _ => Err(Error::config(format!("unknown device '{s}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.optimizer.learning_rate, 1e-4);
        assert_eq!(config.scheduler.gamma, 1.0);
        assert_eq!(config.output.periodic_every, 5);
        assert!((config.val_fraction() - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_warmup_iterations() {
        let warmup = WarmupConfig::default();
        assert_eq!(warmup.iterations(1), 0);
        assert_eq!(warmup.iterations(8), 7);
        assert_eq!(warmup.iterations(5000), 1000);
        assert_eq!(warmup.iterations(0), 0);
    }

    #[test]
    fn test_invalid_batch_size_rejected() {
        let mut config = Config::default();
        config.training.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_train_fraction_rejected() {
        let mut config = Config::default();
        config.data.train_fraction = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_device_parsing() {
        assert_eq!("cpu".parse::<DeviceType>().unwrap(), DeviceType::Cpu);
        assert_eq!("AUTO".parse::<DeviceType>().unwrap(), DeviceType::Auto);
        assert_eq!("cuda".parse::<DeviceType>().unwrap(), DeviceType::Cuda(0));
        assert_eq!("cuda:1".parse::<DeviceType>().unwrap(), DeviceType::Cuda(1));
        assert_eq!("metal".parse::<DeviceType>().unwrap(), DeviceType::Metal(0));
        assert_eq!("metal:1".parse::<DeviceType>().unwrap(), DeviceType::Metal(1));
        assert!("tpu".parse::<DeviceType>().is_err());
    }

    #[test]
    fn test_load_partial_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"{{"model": {{"num_classes": 3}}, "training": {{"num_epochs": 2, "batch_size": 4}}, "output": {{"model_name": "crowns"}}}}"#
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.model.num_classes, 3);
        assert_eq!(config.training.num_epochs, 2);
        assert_eq!(config.training.batch_size, 4);
        assert_eq!(config.output.model_name, "crowns");
        // untouched sections keep their defaults
        assert_eq!(config.optimizer.momentum, 0.9);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = Config::from_file("/definitely/not/here.yaml").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_yaml_roundtrip_of_resolved_config() {
        let config = Config::default();
        let yaml = config.to_yaml().unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, config);
    }
}
