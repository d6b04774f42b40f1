use thiserror::Error;

use crate::table::DType;

/// Errors raised by the encoding pipeline before or while feeding a model.
///
/// Configuration errors (unknown columns, overlapping roles, empty
/// vocabularies) are detected before any training starts. Coercion errors
/// surface at the point a column is cast to its declared type.
#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("unknown column `{0}`")]
    UnknownColumn(String),

    #[error("column `{0}` is listed more than once")]
    DuplicateColumn(String),

    #[error("column `{0}` is both continuous and categorical")]
    RoleOverlap(String),

    #[error("label column `{0}` is also listed as a feature")]
    LabelInFeatures(String),

    #[error("categorical column `{0}` has an empty vocabulary")]
    EmptyVocabulary(String),

    #[error("label vocabulary for `{0}` is empty")]
    EmptyLabelVocabulary(String),

    #[error("label vocabulary for `{column}` repeats `{value}`")]
    DuplicateLabel { column: String, value: String },

    #[error("column `{column}` row {row}: cannot coerce `{value}` to {expected}")]
    Coercion {
        column: String,
        row: usize,
        value: String,
        expected: String,
    },

    #[error("column `{column}` has dtype {actual}, expected {expected}")]
    DTypeMismatch {
        column: String,
        expected: DType,
        actual: DType,
    },

    #[error("training and serving signatures differ: {0}")]
    SignatureMismatch(String),

    #[error("column `{column}`: value `{value}` is not in the vocabulary")]
    UnknownCategory { column: String, value: String },

    #[error("expected {expected} rows, got {actual} ({what})")]
    RowCountMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },

    #[error("{location}: expected `{expected}`, found `{actual}`")]
    PredictionMismatch {
        location: String,
        expected: String,
        actual: String,
    },

    #[error("row {row}: expected {expected} class probabilities, got {actual}")]
    ProbabilityWidth {
        row: usize,
        expected: usize,
        actual: usize,
    },
}
