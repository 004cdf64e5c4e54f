//! Encoder checkpoints: safetensors files mapping parameter names to tensors.

use std::path::{Path, PathBuf};

use candle_nn::VarMap;
use serde::Serialize;
use tracing::info;

use crate::error::{QuillError, Result};

/// Summary of a checkpoint on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckpointInfo {
    pub path: PathBuf,
    /// Number of stored tensors.
    pub tensors: usize,
}

/// Read the safetensors header without touching any model.
pub fn inspect(path: &Path) -> Result<CheckpointInfo> {
    let bytes = std::fs::read(path).map_err(|e| QuillError::io("reading checkpoint", e))?;
    let tensors = safetensors::SafeTensors::deserialize(&bytes)
        .map_err(|e| QuillError::checkpoint(path, e))?
        .names()
        .len();
    Ok(CheckpointInfo {
        path: path.to_path_buf(),
        tensors,
    })
}

/// Persist every variable in `varmap`, creating parent directories.
pub fn save(varmap: &VarMap, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| QuillError::io("creating checkpoint directory", e))?;
    }
    varmap.save(path).map_err(|e| QuillError::checkpoint(path, e))?;
    info!(path = %path.display(), "checkpoint saved");
    Ok(())
}

/// Overwrite the variables in `varmap` with the checkpoint's values.
///
/// Every variable must be present in the file with a matching shape.
pub fn load_into(varmap: &mut VarMap, path: &Path) -> Result<CheckpointInfo> {
    let info = inspect(path)?;
    varmap.load(path).map_err(|e| QuillError::checkpoint(path, e))?;
    info!(path = %path.display(), tensors = info.tensors, "checkpoint loaded");
    Ok(info)
}

/// Like [`load_into`], but an absent file is `Ok(None)`.
pub fn load_if_present(varmap: &mut VarMap, path: &Path) -> Result<Option<CheckpointInfo>> {
    if !path.exists() {
        return Ok(None);
    }
    load_into(varmap, path).map(Some)
}
