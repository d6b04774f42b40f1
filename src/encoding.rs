//! Feature encoding descriptors built from a column role partition.
//!
//! The builder only ever emits [`FeatureEncoding`] values. Whether a
//! sparse column is densified into a one-hot block is decided later, when
//! a model is constructed, through [`feature_columns`].

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::FixtureError;
use crate::roles::ColumnRoles;
use crate::table::{Column, DType, Table};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealValued {
    pub column: String,
    pub dtype: DType,
}

/// Categorical column with a vocabulary fixed at encoding time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseWithKeys {
    pub column: String,
    pub dtype: DType,
    pub vocabulary: Vec<String>,
}

impl SparseWithKeys {
    /// Integer id of `key`, its position in the sorted vocabulary.
    pub fn key_index(&self, key: &str) -> Result<usize, FixtureError> {
        self.vocabulary
            .binary_search_by(|entry| entry.as_str().cmp(key))
            .map_err(|_| FixtureError::UnknownCategory {
                column: self.column.clone(),
                value: key.to_string(),
            })
    }

    pub fn cardinality(&self) -> usize {
        self.vocabulary.len()
    }
}

/// One descriptor per non-label column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeatureEncoding {
    RealValued(RealValued),
    SparseWithKeys(SparseWithKeys),
}

impl FeatureEncoding {
    pub fn column(&self) -> &str {
        match self {
            FeatureEncoding::RealValued(c) => &c.column,
            FeatureEncoding::SparseWithKeys(c) => &c.column,
        }
    }
}

/// Whether an architecture consumes sparse categorical input directly or
/// needs every categorical column expanded to a dense one-hot block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputDensity {
    Sparse,
    Dense,
}

/// A feature column as handed to a model constructor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeatureColumn {
    RealValued(RealValued),
    SparseWithKeys(SparseWithKeys),
    /// Dense indicator block of width `cardinality()` over a sparse column.
    OneHot(SparseWithKeys),
}

impl FeatureColumn {
    pub fn column(&self) -> &str {
        match self {
            FeatureColumn::RealValued(c) => &c.column,
            FeatureColumn::SparseWithKeys(c) | FeatureColumn::OneHot(c) => &c.column,
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            FeatureColumn::RealValued(c) => c.dtype,
            FeatureColumn::SparseWithKeys(c) | FeatureColumn::OneHot(c) => c.dtype,
        }
    }

    /// Number of numeric slots this column occupies once expanded.
    pub fn width(&self) -> usize {
        match self {
            FeatureColumn::RealValued(_) => 1,
            FeatureColumn::SparseWithKeys(c) | FeatureColumn::OneHot(c) => c.cardinality(),
        }
    }
}

/// Emit one descriptor per feature column, continuous first, then
/// categorical, each group in role order.
pub fn build_encodings(table: &Table, roles: &ColumnRoles) -> Result<Vec<FeatureEncoding>, FixtureError> {
    let mut encodings = Vec::with_capacity(roles.continuous().len() + roles.categorical().len());

    for name in roles.continuous() {
        encodings.push(FeatureEncoding::RealValued(RealValued {
            column: name.clone(),
            dtype: DType::Float64,
        }));
    }

    for name in roles.categorical() {
        let vocabulary = vocabulary(name, table.column(name)?)?;
        debug!(column = %name, keys = vocabulary.len(), "built categorical vocabulary");
        encodings.push(FeatureEncoding::SparseWithKeys(SparseWithKeys {
            column: name.clone(),
            dtype: DType::String,
            vocabulary,
        }));
    }

    Ok(encodings)
}

/// Sorted distinct values of a string column.
fn vocabulary(name: &str, column: &Column) -> Result<Vec<String>, FixtureError> {
    let Column::Str(values) = column else {
        return Err(FixtureError::DTypeMismatch {
            column: name.to_string(),
            expected: DType::String,
            actual: column.dtype(),
        });
    };
    let keys: BTreeSet<&str> = values.iter().map(String::as_str).collect();
    if keys.is_empty() {
        return Err(FixtureError::EmptyVocabulary(name.to_string()));
    }
    Ok(keys.into_iter().map(str::to_string).collect())
}

/// Resolve encodings into the feature columns a model is built with.
/// Dense architectures get every sparse column wrapped in a one-hot block;
/// real-valued columns pass through unchanged.
pub fn feature_columns(encodings: &[FeatureEncoding], density: InputDensity) -> Vec<FeatureColumn> {
    encodings
        .iter()
        .map(|encoding| match (encoding, density) {
            (FeatureEncoding::RealValued(c), _) => FeatureColumn::RealValued(c.clone()),
            (FeatureEncoding::SparseWithKeys(c), InputDensity::Sparse) => {
                FeatureColumn::SparseWithKeys(c.clone())
            }
            (FeatureEncoding::SparseWithKeys(c), InputDensity::Dense) => {
                FeatureColumn::OneHot(c.clone())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roles::{LabelKind, RoleSpec, classify};

    fn encoded() -> Vec<FeatureEncoding> {
        let mut table = Table::from_columns(vec![
            ("Age".to_string(), Column::Int(vec![38, 35, 32, 51])),
            (
                "Employment".to_string(),
                Column::Str(vec![
                    "Private".into(),
                    "SelfEmp".into(),
                    "Consultant".into(),
                    "Private".into(),
                ]),
            ),
            ("Adjusted".to_string(), Column::Int(vec![0, 1, 0, 1])),
        ])
        .expect("table");
        let roles = classify(
            &mut table,
            &RoleSpec {
                continuous: vec!["Age".into()],
                categorical: vec!["Employment".into()],
                label: "Adjusted".into(),
                label_kind: LabelKind::Classes {
                    vocabulary: vec!["0".into(), "1".into()],
                },
            },
        )
        .expect("classify");
        build_encodings(&table, &roles).expect("encode")
    }

    #[test]
    fn test_vocabulary_is_sorted_and_distinct() {
        let encodings = encoded();
        assert_eq!(encodings.len(), 2);
        let FeatureEncoding::SparseWithKeys(sparse) = &encodings[1] else {
            panic!("expected sparse column, got {:?}", encodings[1]);
        };
        assert_eq!(sparse.vocabulary, ["Consultant", "Private", "SelfEmp"]);
        assert_eq!(sparse.key_index("Private").unwrap(), 1);
        assert!(matches!(
            sparse.key_index("Retired"),
            Err(FixtureError::UnknownCategory { .. })
        ));
    }

    #[test]
    fn test_vocabulary_is_deterministic() {
        assert_eq!(encoded(), encoded());
    }

    #[test]
    fn test_empty_categorical_column_rejected() {
        let table = Table::from_columns(vec![
            ("c".to_string(), Column::Str(vec![])),
            ("y".to_string(), Column::Float(vec![])),
        ])
        .expect("table");
        let mut coerced = table.clone();
        let roles = classify(
            &mut coerced,
            &RoleSpec {
                continuous: vec![],
                categorical: vec!["c".into()],
                label: "y".into(),
                label_kind: LabelKind::Numeric,
            },
        )
        .expect("classify");
        assert!(matches!(
            build_encodings(&coerced, &roles),
            Err(FixtureError::EmptyVocabulary(_))
        ));
    }

    #[test]
    fn test_densification_only_wraps_sparse_columns() {
        let encodings = encoded();

        let sparse = feature_columns(&encodings, InputDensity::Sparse);
        assert!(matches!(sparse[0], FeatureColumn::RealValued(_)));
        assert!(matches!(sparse[1], FeatureColumn::SparseWithKeys(_)));

        let dense = feature_columns(&encodings, InputDensity::Dense);
        assert!(matches!(dense[0], FeatureColumn::RealValued(_)));
        assert!(matches!(dense[1], FeatureColumn::OneHot(_)));
        assert_eq!(dense[1].width(), 3);
        assert_eq!(dense[1].column(), "Employment");
    }

    #[test]
    fn test_float_categories_are_spelled_with_fraction() {
        let mut table = Table::from_columns(vec![
            ("level".to_string(), Column::Float(vec![2.5, 1.0, 1.0, 2.5])),
            ("y".to_string(), Column::Float(vec![0.1, 0.2, 0.3, 0.4])),
        ])
        .expect("table");
        let roles = classify(
            &mut table,
            &RoleSpec {
                continuous: vec![],
                categorical: vec!["level".into()],
                label: "y".into(),
                label_kind: LabelKind::Numeric,
            },
        )
        .expect("classify");
        let encodings = build_encodings(&table, &roles).expect("encode");
        let FeatureEncoding::SparseWithKeys(sparse) = &encodings[0] else {
            panic!("expected sparse column, got {:?}", encodings[0]);
        };
        assert_eq!(sparse.vocabulary, ["1.0", "2.5"]);
        assert!(sparse.key_index("1").is_err());
    }
}
