//! In-memory columnar tables and the CSV directory they are loaded from.

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::FixtureError;

/// Element type of a column or tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Int64,
    Float64,
    String,
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::Int64 => "int64",
            DType::Float64 => "float64",
            DType::String => "string",
        };
        f.write_str(name)
    }
}

/// A single scalar cell, used for point predictions.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            // `{}` on f64 is the shortest representation that round-trips.
            Value::Float(v) => write!(f, "{v}"),
        }
    }
}

/// Homogeneously typed column storage.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Int(Vec<i64>),
    Float(Vec<f64>),
    Str(Vec<String>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Int(v) => v.len(),
            Column::Float(v) => v.len(),
            Column::Str(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DType {
        match self {
            Column::Int(_) => DType::Int64,
            Column::Float(_) => DType::Float64,
            Column::Str(_) => DType::String,
        }
    }

    /// Render every cell as a string, the way a categorical key is spelled.
    /// Floats always carry a fraction or exponent (`1.0`, never `1`), so a
    /// float key never collides with an integer one.
    pub fn to_strings(&self) -> Vec<String> {
        match self {
            Column::Int(v) => v.iter().map(ToString::to_string).collect(),
            Column::Float(v) => v.iter().map(|&x| float_key(x)).collect(),
            Column::Str(v) => v.clone(),
        }
    }

    /// Infer the narrowest column type able to hold every raw cell.
    fn infer(cells: Vec<String>) -> Column {
        if let Some(ints) = cells
            .iter()
            .map(|c| c.trim().parse::<i64>().ok())
            .collect::<Option<Vec<_>>>()
        {
            return Column::Int(ints);
        }
        if let Some(floats) = cells
            .iter()
            .map(|c| c.trim().parse::<f64>().ok())
            .collect::<Option<Vec<_>>>()
        {
            return Column::Float(floats);
        }
        Column::Str(cells)
    }
}

/// Named columns of equal length, kept in source order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    names: Vec<String>,
    columns: Vec<Column>,
}

impl Table {
    /// Build a table, checking that names are unique and lengths agree.
    pub fn from_columns(columns: Vec<(String, Column)>) -> Result<Self> {
        let mut table = Table::default();
        for (name, column) in columns {
            if table.names.contains(&name) {
                return Err(FixtureError::DuplicateColumn(name).into());
            }
            if let Some(first) = table.columns.first()
                && first.len() != column.len()
            {
                return Err(FixtureError::RowCountMismatch {
                    what: format!("column `{name}`"),
                    expected: first.len(),
                    actual: column.len(),
                }
                .into());
            }
            table.names.push(name);
            table.columns.push(column);
        }
        Ok(table)
    }

    pub fn row_count(&self) -> usize {
        self.columns.first().map_or(0, Column::len)
    }

    pub fn column_names(&self) -> &[String] {
        &self.names
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    pub fn column(&self, name: &str) -> Result<&Column, FixtureError> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|idx| &self.columns[idx])
            .ok_or_else(|| FixtureError::UnknownColumn(name.to_string()))
    }

    /// Swap a column for a coerced copy. The row count must not change.
    pub(crate) fn replace_column(&mut self, name: &str, column: Column) -> Result<(), FixtureError> {
        let idx = self
            .names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| FixtureError::UnknownColumn(name.to_string()))?;
        if column.len() != self.row_count() {
            return Err(FixtureError::RowCountMismatch {
                what: format!("coerced column `{name}`"),
                expected: self.row_count(),
                actual: column.len(),
            });
        }
        self.columns[idx] = column;
        Ok(())
    }

    /// Parse CSV text with a header row, inferring each column's type.
    pub fn from_reader<R: std::io::Read>(reader: R) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(reader);
        let headers: Vec<String> = reader
            .headers()
            .context("failed to read CSV header row")?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        let mut cells: Vec<Vec<String>> = vec![Vec::new(); headers.len()];
        for (row_idx, record) in reader.records().enumerate() {
            let record = record.with_context(|| format!("failed to parse CSV row {}", row_idx + 1))?;
            if record.len() != headers.len() {
                return Err(anyhow!(
                    "CSV row {}: expected {} fields, got {}",
                    row_idx + 1,
                    headers.len(),
                    record.len()
                ));
            }
            for (slot, field) in cells.iter_mut().zip(record.iter()) {
                slot.push(field.to_string());
            }
        }

        let columns = headers
            .into_iter()
            .zip(cells)
            .map(|(name, raw)| (name, Column::infer(raw)))
            .collect();
        Table::from_columns(columns)
    }
}

/// Anything that can hand out a table by dataset name.
pub trait TableSource {
    fn load(&self, name: &str) -> Result<Table>;
}

/// Loads `<dir>/<name>` as a CSV file.
#[derive(Debug, Clone)]
pub struct CsvDirectory {
    dir: PathBuf,
}

impl CsvDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl TableSource for CsvDirectory {
    fn load(&self, name: &str) -> Result<Table> {
        let path = self.dir.join(name);
        let file = File::open(&path)
            .with_context(|| format!("failed to open dataset {}", path.display()))?;
        let table = Table::from_reader(file)
            .with_context(|| format!("failed to load dataset {}", path.display()))?;
        for (name, column) in table.names.iter().zip(&table.columns) {
            debug!(column = %name, dtype = %column.dtype(), "inferred column type");
        }
        info!(
            path = %path.display(),
            rows = table.row_count(),
            columns = table.names.len(),
            "loaded dataset"
        );
        Ok(table)
    }
}

/// Key spelling of a float category: shortest round-trip digits with a
/// trailing `.0` on whole numbers, `nan` / `inf` for non-finite values.
fn float_key(x: f64) -> String {
    if x.is_nan() {
        "nan".to_string()
    } else if x.is_infinite() {
        if x > 0.0 { "inf" } else { "-inf" }.to_string()
    } else if x.fract() == 0.0 && x.abs() < 1e16 {
        format!("{x:.1}")
    } else if x.fract() == 0.0 {
        format!("{x:e}")
    } else {
        x.to_string()
    }
}
