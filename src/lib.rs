//! chexprep - data preparation for multimodal chest X-ray classification
//!
//! Two independent procedures:
//!
//! * [`DatasetPartitioner`] splits every label CSV into 60/20/20
//!   train/validation/test partitions and writes each as CSV and JSONL.
//! * [`CheckpointConverter`] rewrites the parameter names of a legacy
//!   CheXNet checkpoint, loads it strictly into a fresh DenseNet-121 with a
//!   sigmoid head, and saves the backbone as SafeTensors.

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod logging;
pub mod model;
pub mod utils;

// Re-exports
pub use checkpoint::{CheckpointConverter, ConversionOutcome, KeyRemapper, RenameRule};
pub use config::{CheckpointConfig, PartitionConfig, PrepConfig};
pub use data::{DatasetPartitioner, PartitionSummary};
pub use error::{Error, Result};
pub use model::{ChexNet, DenseNetConfig, StateDict};

use tracing::{info, instrument};

/// Results of a full preparation run
#[derive(Debug, Clone)]
pub struct PrepReport {
    /// One entry per partitioned label file
    pub partitions: Vec<PartitionSummary>,
    /// Checkpoint conversion result
    pub conversion: ConversionOutcome,
}

/// Run the partitioner, then the checkpoint converter
#[instrument(skip(config))]
pub fn run_all(config: &PrepConfig) -> Result<PrepReport> {
    info!("chexprep {}", env!("CARGO_PKG_VERSION"));

    let partitions = DatasetPartitioner::new(config.partition.clone()).run()?;

    let device = config.device.to_device()?;
    let conversion = CheckpointConverter::new(config.checkpoint.clone(), device)?.convert()?;

    Ok(PrepReport {
        partitions,
        conversion,
    })
}
