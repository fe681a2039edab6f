//! Writers for partition artifacts
//!
//! CSV output mirrors a dataframe dump: an unnamed leading column carries the
//! original row index, missing cells are empty and float columns keep their
//! decimal point. JSONL output has one object per row with `id` (the
//! original row index, as a string) followed by every column.

use serde_json::{Map, Value};
use std::borrow::Cow;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use super::splitter::{Partition, Split};
use super::table::LabelTable;
use crate::error::{Error, Result};

/// Output file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// Comma-separated values with an index column
    Csv,
    /// One JSON object per line
    Jsonl,
}

impl ExportFormat {
    /// File extension without the dot
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Jsonl => "jsonl",
        }
    }
}

/// `<source>_<split>.<ext>`
pub fn output_file_name(source: &str, split: Split, format: ExportFormat) -> String {
    format!("{}_{}.{}", source, split, format.extension())
}

/// Write `partition` of `table` in `format` to `path`, replacing any existing file
pub fn write_partition(table: &LabelTable, partition: &Partition, format: ExportFormat, path: &Path) -> Result<()> {
    match format {
        ExportFormat::Csv => write_csv(table, partition, path),
        ExportFormat::Jsonl => write_jsonl(table, partition, path),
    }
}

/// Write the partition as CSV with a leading index column
pub fn write_csv(table: &LabelTable, partition: &Partition, path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;

    let mut header = vec![String::new()];
    header.extend(table.headers().iter().cloned());
    writer.write_record(&header)?;

    for &index in &partition.indices {
        let row = table_row(table, index)?;
        let mut record = vec![Cow::Owned(index.to_string())];
        record.extend(row.iter().enumerate().map(|(column, cell)| table.csv_value(column, cell)));
        writer.write_record(record.iter().map(|field| field.as_ref()))?;
    }

    writer.flush()?;
    Ok(())
}

/// Write the partition as JSON lines
pub fn write_jsonl(table: &LabelTable, partition: &Partition, path: &Path) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);

    for &index in &partition.indices {
        let record = json_record(table, index)?;
        serde_json::to_writer(&mut writer, &record)?;
        writer.write_all(b"\n")?;
    }

    writer.flush()?;
    Ok(())
}

/// JSON object for the row at positional `index`
pub fn json_record(table: &LabelTable, index: usize) -> Result<Map<String, Value>> {
    let row = table_row(table, index)?;

    let mut record = Map::new();
    record.insert("id".to_string(), Value::String(index.to_string()));
    for (column, (name, cell)) in table.headers().iter().zip(row).enumerate() {
        record.insert(name.clone(), table.json_value(column, cell));
    }
    Ok(record)
}

fn table_row(table: &LabelTable, index: usize) -> Result<&[String]> {
    table
        .row(index)
        .ok_or_else(|| Error::internal(format!("row {} out of range for '{}'", index, table.name())))
}
