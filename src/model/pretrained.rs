//! Loading pretrained weights into a freshly built detector

use std::fs::File;
use std::path::PathBuf;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;
use memmap2::MmapOptions;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Parameters sized by the class count; these are never taken from pretrained weights
const CLASS_SPECIFIC_PREFIXES: [&str; 2] = ["roi_heads.box_predictor.", "roi_heads.mask_predictor."];

/// Resolve a local path or download (and cache) a URL
fn resolve_source(source: &str) -> Result<PathBuf> {
    if source.starts_with("http://") || source.starts_with("https://") {
        info!("Fetching pretrained weights from {}", source);
        cached_path::cached_path(source)
            .map_err(|e| Error::model(format!("failed to fetch pretrained weights: {e}")))
    } else {
        Ok(PathBuf::from(source))
    }
}

fn to_dtype(dtype: safetensors::Dtype) -> Option<DType> {
    match dtype {
        safetensors::Dtype::F32 => Some(DType::F32),
        safetensors::Dtype::F16 => Some(DType::F16),
        safetensors::Dtype::BF16 => Some(DType::BF16),
        safetensors::Dtype::F64 => Some(DType::F64),
        _ => None,
    }
}

/// Copy every shape-compatible tensor of a safetensors file into `var_map`.
///
/// The class-specific predictor heads are always skipped so the detector keeps
/// its freshly initialized heads for the configured class count. Returns the
/// number of parameters loaded.
pub fn load_backbone_weights(var_map: &VarMap, source: &str, device: &Device) -> Result<usize> {
    let path = resolve_source(source)?;
    let file = File::open(&path)?;
    // SAFETY: the mapping is read-only and dropped before this function returns
    let mmap = unsafe { MmapOptions::new().map(&file)? };
    let tensors = safetensors::SafeTensors::deserialize(&mmap)
        .map_err(|e| Error::model(format!("failed to deserialize safetensors: {e}")))?;

    let data = var_map
        .data()
        .lock()
        .map_err(|_| Error::internal("parameter store lock poisoned"))?;

    let mut loaded = 0;
    let mut skipped = 0;
    for (name, view) in tensors.tensors() {
        if CLASS_SPECIFIC_PREFIXES.iter().any(|p| name.starts_with(p)) {
            debug!("Keeping fresh class-specific parameter {}", name);
            skipped += 1;
            continue;
        }
        let Some(var) = data.get(&name) else {
            debug!("No parameter named {} in detector", name);
            skipped += 1;
            continue;
        };
        let Some(dtype) = to_dtype(view.dtype()) else {
            warn!("Unsupported dtype {:?} for {}", view.dtype(), name);
            skipped += 1;
            continue;
        };
        if view.shape() != var.dims() {
            warn!(
                "Shape mismatch for {}: file {:?}, detector {:?}",
                name,
                view.shape(),
                var.dims()
            );
            skipped += 1;
            continue;
        }
        let tensor = Tensor::from_raw_buffer(view.data(), dtype, view.shape(), device)?
            .to_dtype(var.dtype())?;
        var.set(&tensor)?;
        loaded += 1;
    }

    info!(
        "Loaded {} pretrained parameters from {} ({} skipped)",
        loaded,
        path.display(),
        skipped
    );
    Ok(loaded)
}
