//! Maps named feature tensors onto a flat numeric input space.
//!
//! Every feature column owns a contiguous slice of the input space: one
//! slot for a real-valued column, one slot per vocabulary key for a sparse
//! or one-hot column. Rows are produced as sparse `(slot, value)` lists.

use crate::encoding::FeatureColumn;
use crate::errors::FixtureError;
use crate::input_fn::{FeatureMap, Tensor};

pub type SparseRow = Vec<(usize, f64)>;

#[derive(Debug, Clone, PartialEq)]
pub struct InputLayout {
    columns: Vec<FeatureColumn>,
    offsets: Vec<usize>,
    width: usize,
}

impl InputLayout {
    pub fn new(columns: Vec<FeatureColumn>) -> Self {
        let mut offsets = Vec::with_capacity(columns.len());
        let mut width = 0;
        for column in &columns {
            offsets.push(width);
            width += column.width();
        }
        Self {
            columns,
            offsets,
            width,
        }
    }

    pub fn columns(&self) -> &[FeatureColumn] {
        &self.columns
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Encode every row of `features`. Unknown categories are an error.
    pub fn sparse_rows(&self, features: &FeatureMap) -> Result<Vec<SparseRow>, FixtureError> {
        let rows = features.values().next().map_or(0, Tensor::rows);
        let mut out: Vec<SparseRow> = vec![Vec::with_capacity(self.columns.len()); rows];

        for (column, &offset) in self.columns.iter().zip(&self.offsets) {
            let name = column.column();
            let tensor = features
                .get(name)
                .ok_or_else(|| FixtureError::UnknownColumn(name.to_string()))?;
            if tensor.dtype() != column.dtype() {
                return Err(FixtureError::DTypeMismatch {
                    column: name.to_string(),
                    expected: column.dtype(),
                    actual: tensor.dtype(),
                });
            }
            if tensor.rows() != rows {
                return Err(FixtureError::RowCountMismatch {
                    what: format!("feature `{name}`"),
                    expected: rows,
                    actual: tensor.rows(),
                });
            }

            match column {
                FeatureColumn::RealValued(_) => {
                    let values = tensor.as_f64().unwrap_or_default();
                    for (row, v) in out.iter_mut().zip(values) {
                        row.push((offset, *v));
                    }
                }
                FeatureColumn::SparseWithKeys(keys) | FeatureColumn::OneHot(keys) => {
                    let values = tensor.as_strings().unwrap_or_default();
                    for (row, key) in out.iter_mut().zip(values) {
                        row.push((offset + keys.key_index(key)?, 1.0));
                    }
                }
            }
        }
        Ok(out)
    }

    /// Encode every row into a dense vector of length `width()`.
    pub fn dense_rows(&self, features: &FeatureMap) -> Result<Vec<Vec<f64>>, FixtureError> {
        Ok(self
            .sparse_rows(features)?
            .into_iter()
            .map(|row| {
                let mut dense = vec![0.0; self.width];
                for (slot, v) in row {
                    dense[slot] = v;
                }
                dense
            })
            .collect())
    }

    /// True when every categorical column has been densified.
    pub fn is_dense(&self) -> bool {
        !self
            .columns
            .iter()
            .any(|c| matches!(c, FeatureColumn::SparseWithKeys(_)))
    }
}
