//! Persisting converted weights

use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::error::Result;
use crate::model::StateDict;
use crate::utils::io::ensure_parent_exists;

/// Write `state` to `path` in SafeTensors format, replacing any existing file
pub fn save_state_dict(state: &StateDict, path: &Path) -> Result<()> {
    ensure_parent_exists(path)?;

    let tensors: HashMap<&str, candle_core::Tensor> = state
        .iter()
        .map(|(name, tensor)| (name.as_str(), tensor.clone()))
        .collect();
    candle_core::safetensors::save(&tensors, path)?;

    info!("Saved {} tensors to {}", state.len(), path.display());
    Ok(())
}
