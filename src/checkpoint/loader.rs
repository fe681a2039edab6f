//! Checkpoint readers
//!
//! PyTorch checkpoints come in two layouts: the zip container written by
//! `torch.save` since 1.6, read through candle's pickle reader, and the older
//! stream of pickles followed by raw storages, read by [`super::legacy`].
//! SafeTensors files are read directly.

use candle_core::Device;
use safetensors::SafeTensors;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info};

use super::legacy;
use crate::error::{Error, Result};
use crate::model::StateDict;

/// Bytes needed to tell the layouts apart
const HEADER_LEN: usize = 16;

/// On-disk checkpoint layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFormat {
    /// Zip archive written by `torch.save` (PyTorch 1.6 and later)
    PyTorch,
    /// Pre-zip `torch.save` output: magic number, pickles, then raw storages
    LegacyPyTorch,
    /// `.safetensors`
    SafeTensors,
}

impl CheckpointFormat {
    /// Pick the format from the extension, and for torch files from the leading bytes
    pub fn detect(path: &Path) -> Result<Self> {
        if path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("safetensors"))
        {
            return Ok(Self::SafeTensors);
        }

        let mut header = Vec::with_capacity(HEADER_LEN);
        File::open(path)?.take(HEADER_LEN as u64).read_to_end(&mut header)?;
        Self::from_header(&header).ok_or_else(|| {
            Error::checkpoint_format(format!(
                "{}: neither a zip nor a legacy torch checkpoint",
                path.display()
            ))
        })
    }

    /// Torch layout announced by the first bytes of a file
    pub fn from_header(header: &[u8]) -> Option<Self> {
        if legacy::is_zip(header) {
            Some(Self::PyTorch)
        } else if legacy::has_legacy_magic(header) {
            Some(Self::LegacyPyTorch)
        } else {
            None
        }
    }
}

/// Read the parameter mapping stored in `path`.
///
/// For PyTorch files `key` selects the entry holding the mapping (e.g.
/// `state_dict`); `None` reads a bare state dict. It is ignored for SafeTensors.
pub fn load_state_dict(path: &Path, key: Option<&str>, device: &Device) -> Result<StateDict> {
    let format = CheckpointFormat::detect(path)?;
    info!("Reading {:?} checkpoint from {}", format, path.display());

    let state: StateDict = match format {
        CheckpointFormat::SafeTensors => candle_core::safetensors::load(path, device)?
            .into_iter()
            .collect(),
        CheckpointFormat::PyTorch => {
            let tensors = candle_core::pickle::read_all_with_key(path, key).map_err(|e| {
                Error::checkpoint_format(format!("{}: {}", path.display(), e))
            })?;
            to_device(tensors, device)?
        }
        CheckpointFormat::LegacyPyTorch => {
            let tensors = legacy::read_all_with_key(path, key).map_err(|e| match e {
                Error::CheckpointFormat(msg) => Error::checkpoint_format(format!("{}: {}", path.display(), msg)),
                other => other,
            })?;
            to_device(tensors, device)?
        }
    };

    if state.is_empty() {
        return Err(Error::checkpoint_format(format!(
            "{}: no tensors found{}",
            path.display(),
            key.map(|k| format!(" under key '{}'", k)).unwrap_or_default()
        )));
    }

    debug!("Read {} tensors", state.len());
    Ok(state)
}

fn to_device(tensors: Vec<(String, candle_core::Tensor)>, device: &Device) -> Result<StateDict> {
    tensors
        .into_iter()
        .map(|(name, tensor)| Ok((name, tensor.to_device(device)?)))
        .collect()
}

/// Name, dtype and shape of one stored tensor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorSummary {
    /// Tensor name
    pub name: String,
    /// Element type as written in the file header
    pub dtype: String,
    /// Tensor shape
    pub shape: Vec<usize>,
}

/// List the tensors of a SafeTensors file without materializing them on a device
pub fn inspect_safetensors(path: &Path) -> Result<Vec<TensorSummary>> {
    let bytes = std::fs::read(path)?;
    let file = SafeTensors::deserialize(&bytes)?;

    let mut summaries: Vec<TensorSummary> = file
        .tensors()
        .into_iter()
        .map(|(name, view)| TensorSummary {
            name,
            dtype: format!("{:?}", view.dtype()),
            shape: view.shape().to_vec(),
        })
        .collect();
    summaries.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(summaries)
}
