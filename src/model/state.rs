//! Device-independent parameter snapshots used by checkpoints

use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Ordered mapping from parameter name to its flattened values
pub type StateDict = BTreeMap<String, TensorRecord>;

/// A tensor flattened to host memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorRecord {
    /// Tensor shape
    pub shape: Vec<usize>,
    /// Original data type
    pub dtype: String,
    /// Row-major values, widened to f32
    pub data: Vec<f32>,
}

impl TensorRecord {
    /// Snapshot a tensor
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let data = tensor
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_device(&Device::Cpu)?
            .to_vec1::<f32>()?;
        Ok(Self {
            shape: tensor.dims().to_vec(),
            dtype: format!("{:?}", tensor.dtype()),
            data,
        })
    }

    /// Rebuild the tensor on `device`
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        let expected: usize = self.shape.iter().product();
        if expected != self.data.len() {
            return Err(Error::checkpoint(format!(
                "tensor record has {} values but shape {:?} needs {}",
                self.data.len(),
                self.shape,
                expected
            )));
        }
        Ok(Tensor::from_vec(self.data.clone(), self.shape.as_slice(), device)?)
    }
}

/// Snapshot every variable of a var map
pub fn state_dict_of(var_map: &VarMap) -> Result<StateDict> {
    let data = var_map
        .data()
        .lock()
        .map_err(|_| Error::internal("parameter store lock poisoned"))?;
    let mut state = StateDict::new();
    for (name, var) in data.iter() {
        state.insert(name.clone(), TensorRecord::from_tensor(var.as_tensor())?);
    }
    Ok(state)
}

/// Named variables of a var map, sorted by name
pub fn named_vars(var_map: &VarMap) -> Result<Vec<(String, Var)>> {
    let data = var_map
        .data()
        .lock()
        .map_err(|_| Error::internal("parameter store lock poisoned"))?;
    let mut vars: Vec<(String, Var)> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}

/// Overwrite the var map's variables with the snapshot.
///
/// Every variable of the var map must be present in `state` with a matching
/// shape; extra entries in `state` are rejected as well.
pub fn load_state_dict_into(var_map: &VarMap, state: &StateDict) -> Result<()> {
    let data = var_map
        .data()
        .lock()
        .map_err(|_| Error::internal("parameter store lock poisoned"))?;

    if let Some(extra) = state.keys().find(|name| !data.contains_key(*name)) {
        return Err(Error::checkpoint(format!("unexpected parameter '{extra}' in state dict")));
    }

    for (name, var) in data.iter() {
        let record = state
            .get(name)
            .ok_or_else(|| Error::checkpoint(format!("missing parameter '{name}' in state dict")))?;
        if record.shape != var.dims() {
            return Err(Error::checkpoint(format!(
                "shape mismatch for '{name}': checkpoint {:?}, model {:?}",
                record.shape,
                var.dims()
            )));
        }
        let value = record.to_tensor(var.device())?.to_dtype(var.dtype())?;
        var.set(&value)?;
    }
    Ok(())
}
