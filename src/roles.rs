//! Partition dataset columns into continuous, categorical and label roles.
//!
//! Validation happens before any coercion, so a misconfigured dataset is
//! rejected without touching the table.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::FixtureError;
use crate::table::{Column, Table};

/// How the label column is interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LabelKind {
    /// Finite ordered vocabulary; each label becomes its ordinal position.
    Classes { vocabulary: Vec<String> },
    /// Real-valued regression target.
    Numeric,
}

/// The supervised task implied by the label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Task {
    Classification { n_classes: usize },
    Regression,
}

impl Task {
    pub fn n_classes(&self) -> Option<usize> {
        match self {
            Task::Classification { n_classes } => Some(*n_classes),
            Task::Regression => None,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Task::Classification { .. } => "Classification",
            Task::Regression => "Regression",
        }
    }
}

/// Caller-supplied role configuration for one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleSpec {
    #[serde(default)]
    pub continuous: Vec<String>,
    #[serde(default)]
    pub categorical: Vec<String>,
    pub label: String,
    pub label_kind: LabelKind,
}

/// A validated role partition. Every name exists in the table it was
/// classified against, the two feature sets are disjoint, and the label
/// is in neither.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRoles {
    continuous: Vec<String>,
    categorical: Vec<String>,
    label: String,
    task: Task,
}

impl ColumnRoles {
    pub fn continuous(&self) -> &[String] {
        &self.continuous
    }

    pub fn categorical(&self) -> &[String] {
        &self.categorical
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn task(&self) -> Task {
        self.task
    }

    /// Continuous names first, then categorical, in configuration order.
    pub fn feature_names(&self) -> impl Iterator<Item = &str> {
        self.continuous
            .iter()
            .chain(self.categorical.iter())
            .map(String::as_str)
    }
}

/// Check a role spec against the table's columns without modifying anything.
pub fn validate(table: &Table, spec: &RoleSpec) -> Result<(), FixtureError> {
    let mut seen = HashSet::new();
    for name in &spec.continuous {
        if !seen.insert(name.as_str()) {
            return Err(FixtureError::DuplicateColumn(name.clone()));
        }
    }
    let mut seen_categorical = HashSet::new();
    for name in &spec.categorical {
        if seen.contains(name.as_str()) {
            return Err(FixtureError::RoleOverlap(name.clone()));
        }
        if !seen_categorical.insert(name.as_str()) {
            return Err(FixtureError::DuplicateColumn(name.clone()));
        }
    }
    if seen.contains(spec.label.as_str()) || seen_categorical.contains(spec.label.as_str()) {
        return Err(FixtureError::LabelInFeatures(spec.label.clone()));
    }

    for name in spec
        .continuous
        .iter()
        .chain(&spec.categorical)
        .chain(std::iter::once(&spec.label))
    {
        if !table.has_column(name) {
            return Err(FixtureError::UnknownColumn(name.clone()));
        }
    }

    if let LabelKind::Classes { vocabulary } = &spec.label_kind {
        if vocabulary.is_empty() {
            return Err(FixtureError::EmptyLabelVocabulary(spec.label.clone()));
        }
        let mut labels = HashSet::new();
        for value in vocabulary {
            if !labels.insert(value.as_str()) {
                return Err(FixtureError::DuplicateLabel {
                    column: spec.label.clone(),
                    value: value.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Validate the role spec, then coerce the table in place: continuous columns
/// to float64, categorical columns to strings, and the label to either
/// class indices or float64.
pub fn classify(table: &mut Table, spec: &RoleSpec) -> Result<ColumnRoles, FixtureError> {
    validate(table, spec)?;

    for name in &spec.continuous {
        let coerced = to_float(name, table.column(name)?)?;
        table.replace_column(name, coerced)?;
    }
    for name in &spec.categorical {
        let coerced = Column::Str(table.column(name)?.to_strings());
        table.replace_column(name, coerced)?;
    }

    let task = match &spec.label_kind {
        LabelKind::Classes { vocabulary } => {
            let coerced = to_class_index(&spec.label, table.column(&spec.label)?, vocabulary)?;
            table.replace_column(&spec.label, coerced)?;
            Task::Classification {
                n_classes: vocabulary.len(),
            }
        }
        LabelKind::Numeric => {
            let coerced = to_float(&spec.label, table.column(&spec.label)?)?;
            table.replace_column(&spec.label, coerced)?;
            Task::Regression
        }
    };

    debug!(
        continuous = ?spec.continuous,
        categorical = ?spec.categorical,
        label = %spec.label,
        "column roles validated"
    );
    info!(
        continuous = spec.continuous.len(),
        categorical = spec.categorical.len(),
        label = %spec.label,
        ?task,
        "classified columns"
    );

    Ok(ColumnRoles {
        continuous: spec.continuous.clone(),
        categorical: spec.categorical.clone(),
        label: spec.label.clone(),
        task,
    })
}

fn to_float(name: &str, column: &Column) -> Result<Column, FixtureError> {
    match column {
        Column::Float(values) => Ok(Column::Float(values.clone())),
        Column::Int(values) => Ok(Column::Float(values.iter().map(|&v| v as f64).collect())),
        Column::Str(values) => values
            .iter()
            .enumerate()
            .map(|(row, raw)| {
                raw.trim().parse::<f64>().map_err(|_| FixtureError::Coercion {
                    column: name.to_string(),
                    row,
                    value: raw.clone(),
                    expected: "float64".to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Column::Float),
    }
}

fn to_class_index(name: &str, column: &Column, vocabulary: &[String]) -> Result<Column, FixtureError> {
    column
        .to_strings()
        .into_iter()
        .enumerate()
        .map(|(row, raw)| {
            vocabulary
                .iter()
                .position(|v| *v == raw)
                .map(|idx| idx as i64)
                .ok_or_else(|| FixtureError::Coercion {
                    column: name.to_string(),
                    row,
                    value: raw,
                    expected: format!("one of {vocabulary:?}"),
                })
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Column::Int)
}
