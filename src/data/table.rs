//! Label tables loaded from CSV files

use serde_json::{Number, Value};
use std::borrow::Cow;
use std::collections::{BTreeMap, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::REQUIRED_COLUMNS;
use crate::error::{Error, Result};

/// Cell spellings read as a missing value (the pandas `read_csv` defaults)
pub const NA_TOKENS: [&str; 19] = [
    "", "#N/A", "#N/A N/A", "#NA", "-1.#IND", "-1.#QNAN", "-NaN", "-nan", "1.#IND", "1.#QNAN", "<NA>", "N/A",
    "NA", "NULL", "NaN", "None", "n/a", "nan", "null",
];

/// Whether `cell` denotes a missing value
pub fn is_missing(cell: &str) -> bool {
    NA_TOKENS.contains(&cell)
}

/// Value type inferred for a whole column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// Every present cell parses as an integer
    Integer,
    /// Every present cell parses as a float
    Float,
    /// Anything else
    Text,
}

impl ColumnKind {
    /// Kind of a column whose missing cells are already empty.
    ///
    /// An integer column with a gap becomes `Float`, as integers have no missing value.
    fn infer<'a>(cells: impl Iterator<Item = &'a str>) -> Self {
        let mut kind = ColumnKind::Integer;
        let mut present = false;
        let mut gaps = false;

        for cell in cells {
            if cell.is_empty() {
                gaps = true;
                continue;
            }
            present = true;
            if kind == ColumnKind::Integer && cell.parse::<i64>().is_err() {
                kind = ColumnKind::Float;
            }
            if kind == ColumnKind::Float && cell.parse::<f64>().is_err() {
                return ColumnKind::Text;
            }
        }

        match (present, kind) {
            (false, _) => ColumnKind::Text,
            (true, ColumnKind::Integer) if gaps => ColumnKind::Float,
            (true, kind) => kind,
        }
    }
}

/// All rows of one label file, with canonical column names
#[derive(Debug, Clone)]
pub struct LabelTable {
    name: String,
    path: PathBuf,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
    kinds: Vec<ColumnKind>,
}

impl LabelTable {
    /// Load a CSV file, renaming columns through `renames`
    pub fn from_csv(path: &Path, renames: &BTreeMap<String, String>) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(source_name(path), path, file, renames)
    }

    /// Load CSV data from any reader; `path` is only used in error messages
    pub fn from_reader<R: Read>(
        name: impl Into<String>,
        path: &Path,
        reader: R,
        renames: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(reader);

        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| Error::malformed_table(path, e.to_string()))?
            .iter()
            .map(|h| renames.get(h).cloned().unwrap_or_else(|| h.to_string()))
            .collect();

        let mut seen = HashSet::new();
        if let Some(dup) = headers.iter().find(|h| !seen.insert(h.as_str())) {
            return Err(Error::malformed_table(path, format!("duplicate column '{}'", dup)));
        }

        for column in REQUIRED_COLUMNS {
            if !headers.iter().any(|h| h == column) {
                return Err(Error::MissingColumn {
                    path: path.to_path_buf(),
                    column: column.to_string(),
                });
            }
        }

        let rows = reader
            .records()
            .map(|record| {
                record
                    .map(|r| {
                        r.iter()
                            .map(|cell| if is_missing(cell) { String::new() } else { cell.to_string() })
                            .collect::<Vec<_>>()
                    })
                    .map_err(|e| Error::malformed_table(path, e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        let kinds = (0..headers.len())
            .map(|col| ColumnKind::infer(rows.iter().map(|row| row[col].as_str())))
            .collect();

        let table = Self {
            name: name.into(),
            path: path.to_path_buf(),
            headers,
            rows,
            kinds,
        };
        debug!("Column kinds for '{}': {:?}", table.name, table.kinds);
        Ok(table)
    }

    /// Source name (file name up to the first `.`)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// File the table was read from
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Column names after renaming
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Inferred kind per column
    pub fn kinds(&self) -> &[ColumnKind] {
        &self.kinds
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no rows
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Raw cells of the row at positional `index`
    pub fn row(&self, index: usize) -> Option<&[String]> {
        self.rows.get(index).map(Vec::as_slice)
    }

    /// Position of a column by name
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// Typed JSON value of one cell; empty cells are `null`
    pub fn json_value(&self, column: usize, cell: &str) -> Value {
        if cell.is_empty() {
            return Value::Null;
        }
        match self.kinds[column] {
            ColumnKind::Integer => cell.parse::<i64>().map(Value::from).unwrap_or(Value::Null),
            ColumnKind::Float => cell
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ColumnKind::Text => Value::String(cell.to_string()),
        }
    }

    /// Text of one cell in CSV output: missing cells are empty and float columns
    /// always carry a decimal point (`3` is written `3.0`)
    pub fn csv_value<'a>(&self, column: usize, cell: &'a str) -> Cow<'a, str> {
        match self.kinds[column] {
            ColumnKind::Float if !cell.is_empty() => match cell.parse::<f64>() {
                Ok(value) => Cow::Owned(format!("{:?}", value)),
                Err(_) => Cow::Borrowed(cell),
            },
            _ => Cow::Borrowed(cell),
        }
    }

    /// Tab-separated rendering of the header and the first `n` rows
    pub fn preview(&self, n: usize) -> String {
        let mut lines = vec![format!("\t{}", self.headers.join("\t"))];
        for (i, row) in self.rows.iter().take(n).enumerate() {
            lines.push(format!("{}\t{}", i, row.join("\t")));
        }
        lines.join("\n")
    }
}

/// File name up to its first `.` (`findings_only.v2.csv` -> `findings_only`)
pub fn source_name(path: &Path) -> String {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    file_name.split('.').next().unwrap_or_default().to_string()
}
