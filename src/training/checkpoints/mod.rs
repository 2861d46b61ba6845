//! Checkpoint files and the artifacts written next to them
//!
//! Every artifact of a run lives in one output directory and is named after
//! the model:
//!
//! - `<name>_checkpoint_min.pt`: best validation loss so far
//! - `<name>_checkpoint.pt`: latest periodic checkpoint
//! - `<name>.pt`: final model (configuration + weights), rewritten every epoch
//! - `<name>_losses_curve.png`: loss curves
//! - `<name>_config.yaml`: resolved run configuration
//!
//! Writes are full overwrites.

pub mod policy;

pub use policy::{CheckpointDecision, CheckpointPolicy};

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::error::{Error, Result};
use crate::model::{DetectorConfig, StateDict};
use crate::training::metrics::LossHistory;
use crate::training::optimizers::OptimizerStateDict;

/// Bumped whenever the encoded layout changes
pub const FORMAT_VERSION: u32 = 1;

/// Training state captured after an epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Epoch (0-based) the checkpoint was taken after
    pub epoch: usize,
    /// Detector parameters
    pub model_state_dict: StateDict,
    /// Optimizer buffers and hyperparameters
    pub optimizer_state_dict: OptimizerStateDict,
    /// Loss history up to and including `epoch`
    pub loss: LossHistory,
    /// Wall-clock time of the save
    pub saved_at: DateTime<Utc>,
}

/// Standalone trained model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    /// Configuration to rebuild the detector with
    pub config: DetectorConfig,
    /// Detector parameters
    pub model_state_dict: StateDict,
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    version: u32,
    kind: String,
    payload: T,
}

/// Checkpoint slot in the output directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointSlot {
    /// Best validation loss so far
    Best,
    /// Periodic snapshot
    Periodic,
}

/// Names, writes and reads a run's artifacts
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    model_name: String,
}

impl CheckpointManager {
    /// Create the manager, creating `dir` if needed
    pub fn new(dir: impl AsRef<Path>, model_name: impl Into<String>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let model_name = model_name.into();
        if model_name.is_empty() {
            return Err(Error::config("model name must not be empty"));
        }
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, model_name })
    }

    /// Output directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a checkpoint slot
    pub fn slot_path(&self, slot: CheckpointSlot) -> PathBuf {
        match slot {
            CheckpointSlot::Best => self.best_path(),
            CheckpointSlot::Periodic => self.periodic_path(),
        }
    }

    /// `<name>_checkpoint_min.pt`
    pub fn best_path(&self) -> PathBuf {
        self.dir.join(format!("{}_checkpoint_min.pt", self.model_name))
    }

    /// `<name>_checkpoint.pt`
    pub fn periodic_path(&self) -> PathBuf {
        self.dir.join(format!("{}_checkpoint.pt", self.model_name))
    }

    /// `<name>.pt`
    pub fn final_path(&self) -> PathBuf {
        self.dir.join(format!("{}.pt", self.model_name))
    }

    /// `<name>_losses_curve.png`
    pub fn plot_path(&self) -> PathBuf {
        self.dir.join(format!("{}_losses_curve.png", self.model_name))
    }

    /// `<name>_config.yaml`
    pub fn config_path(&self) -> PathBuf {
        self.dir.join(format!("{}_config.yaml", self.model_name))
    }

    /// Write a checkpoint into `slot`
    #[instrument(skip(self, checkpoint), fields(epoch = checkpoint.epoch))]
    pub fn save(&self, slot: CheckpointSlot, checkpoint: &Checkpoint) -> Result<PathBuf> {
        let path = self.slot_path(slot);
        write_encoded(&path, "checkpoint", checkpoint)?;
        info!("Saved {:?} checkpoint to {}", slot, path.display());
        Ok(path)
    }

    /// Write the final model
    pub fn save_model(&self, artifact: &ModelArtifact) -> Result<PathBuf> {
        let path = self.final_path();
        write_encoded(&path, "model", artifact)?;
        debug!("Saved model to {}", path.display());
        Ok(path)
    }

    /// Overwrite the loss-curve PNG
    pub fn write_plot(&self, png: &[u8]) -> Result<PathBuf> {
        let path = self.plot_path();
        fs::write(&path, png)?;
        Ok(path)
    }

    /// Write the resolved configuration
    pub fn write_config(&self, yaml: &str) -> Result<PathBuf> {
        let path = self.config_path();
        fs::write(&path, yaml)?;
        Ok(path)
    }
}

/// Read a checkpoint file
pub fn load_checkpoint(path: impl AsRef<Path>) -> Result<Checkpoint> {
    read_encoded(path.as_ref(), "checkpoint")
}

/// Read a final model file
pub fn load_model(path: impl AsRef<Path>) -> Result<ModelArtifact> {
    read_encoded(path.as_ref(), "model")
}

fn write_encoded<T: Serialize>(path: &Path, kind: &str, payload: &T) -> Result<()> {
    let envelope = Envelope {
        version: FORMAT_VERSION,
        kind: kind.to_string(),
        payload,
    };
    let bytes = bincode::serialize(&envelope)?;
    fs::write(path, bytes)?;
    Ok(())
}

fn read_encoded<T: DeserializeOwned>(path: &Path, kind: &str) -> Result<T> {
    let bytes = fs::read(path)?;
    let envelope: Envelope<T> = bincode::deserialize(&bytes)?;
    if envelope.version != FORMAT_VERSION {
        return Err(Error::checkpoint(format!(
            "{} has format version {}, expected {}",
            path.display(),
            envelope.version,
            FORMAT_VERSION
        )));
    }
    if envelope.kind != kind {
        return Err(Error::checkpoint(format!(
            "{} holds a {}, expected a {}",
            path.display(),
            envelope.kind,
            kind
        )));
    }
    Ok(envelope.payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TensorRecord;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn state() -> StateDict {
        let mut state = StateDict::new();
        state.insert(
            "backbone.conv1.weight".into(),
            TensorRecord {
                shape: vec![2],
                dtype: "F32".into(),
                data: vec![0.5, -1.0],
            },
        );
        state
    }

    fn checkpoint(epoch: usize) -> Checkpoint {
        Checkpoint {
            epoch,
            model_state_dict: state(),
            optimizer_state_dict: OptimizerStateDict {
                optimizer_type: "sgd_momentum".into(),
                step_count: 3,
                learning_rate: 1e-4,
                state: BTreeMap::new(),
                hyperparameters: BTreeMap::new(),
            },
            loss: LossHistory::new(),
            saved_at: Utc::now(),
        }
    }

    #[test]
    fn test_artifact_names() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(dir.path(), "trees").unwrap();
        assert_eq!(manager.best_path(), dir.path().join("trees_checkpoint_min.pt"));
        assert_eq!(manager.periodic_path(), dir.path().join("trees_checkpoint.pt"));
        assert_eq!(manager.final_path(), dir.path().join("trees.pt"));
        assert_eq!(manager.plot_path(), dir.path().join("trees_losses_curve.png"));
    }

    #[test]
    fn test_creates_output_directory() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b");
        CheckpointManager::new(&nested, "m").unwrap();
        assert!(nested.is_dir());
        assert!(CheckpointManager::new(dir.path(), "").is_err());
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(dir.path(), "m").unwrap();
        let saved = checkpoint(4);
        let path = manager.save(CheckpointSlot::Periodic, &saved).unwrap();
        assert_eq!(load_checkpoint(path).unwrap(), saved);
    }

    #[test]
    fn test_save_overwrites_slot() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(dir.path(), "m").unwrap();
        manager.save(CheckpointSlot::Best, &checkpoint(0)).unwrap();
        manager.save(CheckpointSlot::Best, &checkpoint(2)).unwrap();
        assert_eq!(load_checkpoint(manager.best_path()).unwrap().epoch, 2);
    }

    #[test]
    fn test_model_file_is_not_a_checkpoint() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(dir.path(), "m").unwrap();
        let artifact = ModelArtifact {
            config: DetectorConfig::default(),
            model_state_dict: state(),
        };
        let path = manager.save_model(&artifact).unwrap();
        assert_eq!(load_model(&path).unwrap(), artifact);
        assert!(load_checkpoint(&path).is_err());
    }

    #[test]
    fn test_garbage_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.pt");
        fs::write(&path, b"not a checkpoint").unwrap();
        assert!(load_checkpoint(&path).is_err());
    }
}
