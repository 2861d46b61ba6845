//! Tests for splitting and loading

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use tempfile::TempDir;

use crate::training::data::{random_split, DataLoader, DataLoaderConfig, Dataset};
use crate::training::Trainer;

use super::mock_data::{test_config, ScriptedDetector, SyntheticDataset};

fn loader_config(batch_size: usize, shuffle: bool, num_workers: usize) -> DataLoaderConfig {
    DataLoaderConfig {
        batch_size,
        shuffle,
        num_workers,
        prefetch: 2,
        drop_last: false,
        seed: Some(11),
    }
}

fn image_ids(loader: &DataLoader) -> Result<Vec<Vec<u64>>> {
    let mut batches = Vec::new();
    for batch in loader.iter() {
        batches.push(batch?.targets.iter().map(|t| t.image_id).collect());
    }
    Ok(batches)
}

#[test]
fn test_split_is_eight_two_and_deterministic() -> Result<()> {
    let dataset = Arc::new(SyntheticDataset::new(10, 4));
    let first = random_split(Arc::clone(&dataset), &[0.8, 0.2], 0)?;
    let second = random_split(Arc::clone(&dataset), &[0.8, 0.2], 0)?;

    assert_eq!(first[0].len(), 8);
    assert_eq!(first[1].len(), 2);
    assert_eq!(first[0].indices(), second[0].indices());
    assert_eq!(first[1].indices(), second[1].indices());

    let all: BTreeSet<usize> = first
        .iter()
        .flat_map(|s| s.indices().iter().copied())
        .collect();
    assert_eq!(all, (0..10).collect());
    Ok(())
}

#[test]
fn test_split_depends_on_seed() -> Result<()> {
    let dataset = Arc::new(SyntheticDataset::new(50, 4));
    let a = random_split(Arc::clone(&dataset), &[0.8, 0.2], 0)?;
    let b = random_split(dataset, &[0.8, 0.2], 1)?;
    assert_ne!(a[0].indices(), b[0].indices());
    Ok(())
}

#[test]
fn test_sequential_loader_keeps_order() -> Result<()> {
    let loader = DataLoader::new(
        Arc::new(SyntheticDataset::new(5, 4)),
        loader_config(2, false, 0),
    )?;
    assert_eq!(loader.len(), 3);
    assert_eq!(image_ids(&loader)?, vec![vec![0, 1], vec![2, 3], vec![4]]);
    Ok(())
}

#[test]
fn test_worker_pool_matches_sequential_loading() -> Result<()> {
    let dataset = Arc::new(SyntheticDataset::new(9, 4));
    let sequential = DataLoader::new(dataset.clone(), loader_config(3, false, 0))?;
    let pooled = DataLoader::new(dataset, loader_config(3, false, 3))?;
    assert_eq!(image_ids(&sequential)?, image_ids(&pooled)?);
    Ok(())
}

#[test]
fn test_shuffled_epoch_visits_every_sample_once() -> Result<()> {
    let loader = DataLoader::new(
        Arc::new(SyntheticDataset::new(7, 4)),
        loader_config(2, true, 0),
    )?;
    for _ in 0..2 {
        let mut ids: Vec<u64> = image_ids(&loader)?.into_iter().flatten().collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..7).collect::<Vec<_>>());
    }
    Ok(())
}

#[test]
fn test_trainer_splits_dataset() -> Result<()> {
    let dir = TempDir::new()?;
    let trainer = Trainer::new(
        test_config(dir.path(), 1),
        Box::new(ScriptedDetector::new()),
        Arc::new(SyntheticDataset::new(10, 4)),
    )?;
    let (train, val) = trainer.loaders();
    assert_eq!(train.dataset_size(), 8);
    assert_eq!(val.dataset_size(), 2);
    assert_eq!(train.len(), 4);
    assert_eq!(val.len(), 1);
    Ok(())
}

#[test]
fn test_default_split_keeps_a_validation_sample() -> Result<()> {
    let dir = TempDir::new()?;
    let config = test_config(dir.path(), 1);
    assert_eq!(config.data.train_fraction, 0.8);
    let trainer = Trainer::new(
        config,
        Box::new(ScriptedDetector::new()),
        Arc::new(SyntheticDataset::new(5, 4)),
    )?;
    let (train, val) = trainer.loaders();
    assert_eq!((train.dataset_size(), val.dataset_size()), (4, 1));
    Ok(())
}
