//! Dataset partitioning over a directory of label files

use std::path::PathBuf;
use tracing::{debug, info, instrument};

use super::export::{output_file_name, write_partition, ExportFormat};
use super::splitter::{partition_rows, PartitionSet};
use super::table::LabelTable;
use crate::config::PartitionConfig;
use crate::error::{Error, Result};
use crate::utils::io::{ensure_dir_exists, list_files_with_extension};

/// Rows shown in the per-table preview
const PREVIEW_ROWS: usize = 5;

/// What was produced for one source file
#[derive(Debug, Clone)]
pub struct PartitionSummary {
    /// Source name
    pub source: String,
    /// Rows in the source table
    pub rows: usize,
    /// Rows per split in train, val, test order
    pub split_sizes: [usize; 3],
    /// Files written
    pub files: Vec<PathBuf>,
}

/// Splits every label file of a directory and exports the partitions
pub struct DatasetPartitioner {
    config: PartitionConfig,
}

impl DatasetPartitioner {
    /// Create a partitioner
    pub fn new(config: PartitionConfig) -> Self {
        Self { config }
    }

    /// Configuration in use
    pub fn config(&self) -> &PartitionConfig {
        &self.config
    }

    /// CSV files in the source directory, ordered by file name
    pub fn discover_sources(&self) -> Result<Vec<PathBuf>> {
        let dir = &self.config.source_dir;
        if !dir.is_dir() {
            return Err(Error::DatasetNotFound(dir.clone()));
        }
        list_files_with_extension(dir, "csv")
    }

    /// Load every source table
    pub fn load_tables(&self) -> Result<Vec<LabelTable>> {
        let tables = self
            .discover_sources()?
            .iter()
            .map(|path| LabelTable::from_csv(path, &self.config.column_renames))
            .collect::<Result<Vec<_>>>()?;

        for table in &tables {
            info!("Number of rows in {}: {}", table.name(), table.len());
            debug!("{}\n{}", table.name(), table.preview(PREVIEW_ROWS));
        }

        Ok(tables)
    }

    /// Split one table into train/val/test
    pub fn partition(&self, table: &LabelTable) -> Result<PartitionSet> {
        partition_rows(
            table.len(),
            self.config.test_fraction,
            self.config.val_fraction,
            self.config.seed,
        )
    }

    /// Write the CSV and JSONL artifacts of every partition
    pub fn export(&self, table: &LabelTable, partitions: &PartitionSet) -> Result<Vec<PathBuf>> {
        ensure_dir_exists(&self.config.csv_dir)?;
        ensure_dir_exists(&self.config.jsonl_dir)?;

        let mut files = Vec::with_capacity(6);
        for format in [ExportFormat::Csv, ExportFormat::Jsonl] {
            let dir = match format {
                ExportFormat::Csv => &self.config.csv_dir,
                ExportFormat::Jsonl => &self.config.jsonl_dir,
            };
            for partition in partitions.iter() {
                let path = dir.join(output_file_name(table.name(), partition.split, format));
                write_partition(table, partition, format, &path)?;
                debug!("Wrote {} rows to {}", partition.len(), path.display());
                files.push(path);
            }
        }

        Ok(files)
    }

    /// Load, split and export every source file
    #[instrument(skip(self), fields(source = %self.config.source_dir.display()))]
    pub fn run(&self) -> Result<Vec<PartitionSummary>> {
        let tables = self.load_tables()?;
        let mut summaries = Vec::with_capacity(tables.len());

        for table in &tables {
            let partitions = self.partition(table)?;
            let files = self.export(table, &partitions)?;

            info!(
                "{}: {} train, {} val, {} test",
                table.name(),
                partitions.train.len(),
                partitions.val.len(),
                partitions.test.len()
            );

            summaries.push(PartitionSummary {
                source: table.name().to_string(),
                rows: table.len(),
                split_sizes: [partitions.train.len(), partitions.val.len(), partitions.test.len()],
                files,
            });
        }

        info!("Partitioned {} label files", summaries.len());
        Ok(summaries)
    }
}
