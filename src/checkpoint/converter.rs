//! Legacy CheXNet checkpoint conversion
//!
//! Builds a fresh model, loads the legacy parameters under their remapped
//! names (strictly), and saves the backbone. A missing checkpoint is not an
//! error: the freshly initialized backbone is saved instead.

use candle_core::Device;
use std::path::PathBuf;
use tracing::{info, instrument, warn};

use super::loader;
use super::rules::{KeyRemapper, RemapReport};
use super::saver;
use crate::config::CheckpointConfig;
use crate::error::Result;
use crate::model::{ChexNet, DenseNetConfig};

/// What a conversion run did
#[derive(Debug, Clone)]
pub struct ConversionOutcome {
    /// Remap statistics when a checkpoint was found
    pub remap: Option<RemapReport>,
    /// Tensors loaded from the checkpoint into the model
    pub tensors_loaded: usize,
    /// Tensors written to the output file
    pub tensors_saved: usize,
    /// Where the backbone was written
    pub output_path: PathBuf,
}

impl ConversionOutcome {
    /// Whether a checkpoint was applied
    pub fn checkpoint_found(&self) -> bool {
        self.remap.is_some()
    }
}

/// Converts a legacy checkpoint into current backbone weights
pub struct CheckpointConverter {
    config: CheckpointConfig,
    architecture: DenseNetConfig,
    remapper: KeyRemapper,
    device: Device,
}

impl CheckpointConverter {
    /// Create a converter for DenseNet-121 with `config.num_classes` outputs
    pub fn new(config: CheckpointConfig, device: Device) -> Result<Self> {
        let remapper = KeyRemapper::new(&config.rename_rules, config.wrapper_prefix.clone())?;
        let architecture = DenseNetConfig::densenet121(config.num_classes);

        Ok(Self {
            config,
            architecture,
            remapper,
            device,
        })
    }

    /// Use a different backbone layout
    pub fn with_architecture(mut self, architecture: DenseNetConfig) -> Self {
        self.architecture = architecture;
        self
    }

    /// Construct the model, applying base weights when configured
    pub fn build_model(&self) -> Result<ChexNet> {
        let model = ChexNet::new(&self.architecture, &self.device)?;

        if let Some(base) = &self.config.base_weights {
            info!("Initializing backbone from {}", base.display());
            let weights = loader::load_state_dict(base, None, &self.device)?;
            model.load_backbone_weights(&weights)?;
        }

        Ok(model)
    }

    /// Run the conversion end to end
    #[instrument(skip(self), fields(checkpoint = %self.config.checkpoint_path.display()))]
    pub fn convert(&self) -> Result<ConversionOutcome> {
        let model = self.build_model()?;
        let checkpoint_path = &self.config.checkpoint_path;

        let (remap, tensors_loaded) = if checkpoint_path.is_file() {
            info!("=> loading checkpoint");
            let state = loader::load_state_dict(
                checkpoint_path,
                self.config.state_dict_key.as_deref(),
                &self.device,
            )?;
            let (state, report) = self.remapper.remap(state)?;
            info!(
                "Remapped {} keys ({} renamed, {} unwrapped)",
                state.len(),
                report.renamed,
                report.stripped
            );

            let loaded = model.load_state_dict(&state)?;
            info!("=> loaded checkpoint");
            (Some(report), loaded)
        } else {
            warn!("=> no checkpoint found at {}", checkpoint_path.display());
            (None, 0)
        };

        let backbone = model.backbone_state(self.config.keep_classifier)?;
        saver::save_state_dict(&backbone, &self.config.output_path)?;
        info!("Model saved.");

        Ok(ConversionOutcome {
            remap,
            tensors_loaded,
            tensors_saved: backbone.len(),
            output_path: self.config.output_path.clone(),
        })
    }
}
