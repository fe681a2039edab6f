//! Label-file partitioning
//!
//! Each CSV variant of the label set is split 60/20/20 into train, validation
//! and test partitions, and every partition is written both as CSV (for the
//! image-only and text-only baselines) and as JSONL (for the multimodal
//! dataset reader).

pub mod export;
pub mod partitioner;
pub mod splitter;
pub mod table;

// Re-exports
pub use export::{output_file_name, ExportFormat};
pub use partitioner::{DatasetPartitioner, PartitionSummary};
pub use splitter::{partition_rows, train_test_split, Partition, PartitionSet, Split};
pub use table::{ColumnKind, LabelTable};
