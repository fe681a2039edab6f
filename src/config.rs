//! Configuration structures for the chexprep system

use candle_core::Device;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::checkpoint::rules::RenameRule;
use crate::error::{Error, Result};

/// Canonical column names every label table must carry after renaming
pub const REQUIRED_COLUMNS: [&str; 3] = ["img", "label", "text"];

/// Main configuration for the preparation run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrepConfig {
    /// Dataset partitioning configuration
    pub partition: PartitionConfig,
    /// Checkpoint conversion configuration
    pub checkpoint: CheckpointConfig,
    /// Device used for tensor work
    pub device: DeviceConfig,
}

impl Default for PrepConfig {
    fn default() -> Self {
        Self {
            partition: PartitionConfig::default(),
            checkpoint: CheckpointConfig::default(),
            device: DeviceConfig::default(),
        }
    }
}

impl PrepConfig {
    /// Load configuration from a JSON (`.json`) or YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;

        let config: Self = if is_json(path) {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON (`.json`) or YAML file
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = if is_json(path) {
            serde_json::to_string_pretty(self)?
        } else {
            serde_yaml::to_string(self)?
        };
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let p = &self.partition;
        for (name, fraction) in [("test_fraction", p.test_fraction), ("val_fraction", p.val_fraction)] {
            if !(fraction > 0.0 && fraction < 1.0) {
                return Err(Error::config(format!("{} must be in (0, 1), got {}", name, fraction)));
            }
        }

        for (from, to) in &p.column_renames {
            if from.is_empty() || to.is_empty() {
                return Err(Error::config("Column rename entries must be non-empty"));
            }
        }

        let c = &self.checkpoint;
        if c.num_classes == 0 {
            return Err(Error::config("num_classes must be > 0"));
        }
        for rule in &c.rename_rules {
            rule.compile()?;
        }

        Ok(())
    }

    /// Resolve every relative path against `root`
    pub fn resolve_paths(&mut self, root: impl AsRef<Path>) {
        let root = root.as_ref();
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = root.join(&*p);
            }
        };

        resolve(&mut self.partition.source_dir);
        resolve(&mut self.partition.csv_dir);
        resolve(&mut self.partition.jsonl_dir);
        resolve(&mut self.checkpoint.checkpoint_path);
        resolve(&mut self.checkpoint.output_path);
        if let Some(base) = self.checkpoint.base_weights.as_mut() {
            resolve(base);
        }
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().and_then(|s| s.to_str()) == Some("json")
}

/// Dataset partitioning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    /// Directory holding the source label CSV files
    pub source_dir: PathBuf,
    /// Output directory for CSV partitions
    pub csv_dir: PathBuf,
    /// Output directory for JSONL partitions
    pub jsonl_dir: PathBuf,
    /// Fraction of all rows held out as test
    pub test_fraction: f64,
    /// Fraction of the non-test rows held out as validation
    pub val_fraction: f64,
    /// Seed for both split stages
    pub seed: u64,
    /// Source column name -> canonical column name
    pub column_renames: BTreeMap<String, String>,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        let column_renames = [("Filename", "img"), ("Label", "label"), ("LabelText", "text")]
            .into_iter()
            .map(|(from, to)| (from.to_string(), to.to_string()))
            .collect();

        Self {
            source_dir: PathBuf::from("image_labels_csv"),
            csv_dir: PathBuf::from("csv"),
            jsonl_dir: PathBuf::from("json"),
            test_fraction: 0.2,
            // 0.25 * 0.8 = 0.2, giving 60/20/20 overall
            val_fraction: 0.25,
            seed: 1,
            column_renames,
        }
    }
}

/// Checkpoint conversion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Legacy checkpoint to convert
    pub checkpoint_path: PathBuf,
    /// Key holding the parameter mapping inside the checkpoint; `None` for a bare state dict
    pub state_dict_key: Option<String>,
    /// Destination of the converted backbone
    pub output_path: PathBuf,
    /// Optional torchvision-named weights used to initialize the backbone
    pub base_weights: Option<PathBuf>,
    /// Number of output classes of the sigmoid head
    pub num_classes: usize,
    /// Prefix added by multi-device replication wrappers
    pub wrapper_prefix: String,
    /// Legacy name rewrite table, first match wins
    pub rename_rules: Vec<RenameRule>,
    /// Also write the classifier head to the output file
    pub keep_classifier: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            checkpoint_path: PathBuf::from("models/model.pth.tar"),
            state_dict_key: Some("state_dict".to_string()),
            output_path: PathBuf::from("models/saved_chexnet.safetensors"),
            base_weights: None,
            num_classes: 14,
            wrapper_prefix: "module.".to_string(),
            rename_rules: vec![RenameRule::densenet_legacy()],
            keep_classifier: false,
        }
    }
}

/// Device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device type
    pub device_type: DeviceType,
    /// Device ID (for multi-GPU)
    pub device_id: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_type: DeviceType::Cpu,
            device_id: 0,
        }
    }
}

impl DeviceConfig {
    /// Build the candle device
    pub fn to_device(&self) -> Result<Device> {
        let device = match self.device_type {
            DeviceType::Cpu => Device::Cpu,
            DeviceType::Cuda => Device::new_cuda(self.device_id)?,
            DeviceType::Metal => Device::new_metal(self.device_id)?,
        };
        Ok(device)
    }
}

/// Device types
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// CPU device
    Cpu,
    /// CUDA GPU
    Cuda,
    /// Metal (Apple Silicon)
    Metal,
}
