//! Paired input functions: one materialises training tensors from a fixed
//! table, the other describes the serving-time placeholder signature.
//!
//! Both are plain values rather than closures so their feature contract can
//! be compared without running a model.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::FixtureError;
use crate::roles::{ColumnRoles, Task};
use crate::table::{Column, DType, Table};

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    Int64(Vec<i64>),
    Float64(Vec<f64>),
    String(Vec<String>),
}

/// A dense column tensor of shape `[rows, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: [usize; 2],
    data: TensorData,
}

impl Tensor {
    fn column(data: TensorData) -> Self {
        let rows = match &data {
            TensorData::Int64(v) => v.len(),
            TensorData::Float64(v) => v.len(),
            TensorData::String(v) => v.len(),
        };
        Self {
            shape: [rows, 1],
            data,
        }
    }

    pub fn shape(&self) -> [usize; 2] {
        self.shape
    }

    pub fn rows(&self) -> usize {
        self.shape[0]
    }

    pub fn dtype(&self) -> DType {
        match self.data {
            TensorData::Int64(_) => DType::Int64,
            TensorData::Float64(_) => DType::Float64,
            TensorData::String(_) => DType::String,
        }
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn as_f64(&self) -> Option<&[f64]> {
        match &self.data {
            TensorData::Float64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<&[i64]> {
        match &self.data {
            TensorData::Int64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_strings(&self) -> Option<&[String]> {
        match &self.data {
            TensorData::String(v) => Some(v),
            _ => None,
        }
    }
}

/// Feature tensors keyed by column name.
pub type FeatureMap = BTreeMap<String, Tensor>;

/// What one invocation of the training input function yields.
#[derive(Debug, Clone, PartialEq)]
pub struct InputBatch {
    pub features: FeatureMap,
    pub label: Tensor,
}

/// Produces the same `(features, label)` batch on every call.
#[derive(Debug, Clone)]
pub struct TrainingInputFn {
    table: Table,
    roles: ColumnRoles,
}

impl TrainingInputFn {
    pub fn new(table: Table, roles: ColumnRoles) -> Self {
        Self { table, roles }
    }

    pub fn row_count(&self) -> usize {
        self.table.row_count()
    }

    pub fn roles(&self) -> &ColumnRoles {
        &self.roles
    }

    pub fn invoke(&self) -> Result<InputBatch, FixtureError> {
        let mut features = FeatureMap::new();
        for name in self.roles.continuous() {
            let tensor = self.tensor(name, DType::Float64)?;
            features.insert(name.clone(), tensor);
        }
        for name in self.roles.categorical() {
            let tensor = self.tensor(name, DType::String)?;
            features.insert(name.clone(), tensor);
        }

        let label_dtype = match self.roles.task() {
            Task::Classification { .. } => DType::Int64,
            Task::Regression => DType::Float64,
        };
        let label = self.tensor(self.roles.label(), label_dtype)?;

        debug!(
            rows = label.rows(),
            features = features.len(),
            "materialised training batch"
        );
        Ok(InputBatch { features, label })
    }

    fn tensor(&self, name: &str, expected: DType) -> Result<Tensor, FixtureError> {
        let data = match (self.table.column(name)?, expected) {
            (Column::Float(v), DType::Float64) => TensorData::Float64(v.clone()),
            (Column::Int(v), DType::Int64) => TensorData::Int64(v.clone()),
            (Column::Str(v), DType::String) => TensorData::String(v.clone()),
            (column, expected) => {
                return Err(FixtureError::DTypeMismatch {
                    column: name.to_string(),
                    expected,
                    actual: column.dtype(),
                });
            }
        };
        Ok(Tensor::column(data))
    }
}

/// A tensor dimension that is either fixed or left open until feed time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dim {
    Fixed(usize),
    Unbound,
}

impl Serialize for Dim {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Dim::Fixed(n) => serializer.serialize_i64(*n as i64),
            Dim::Unbound => serializer.serialize_i64(-1),
        }
    }
}

impl<'de> Deserialize<'de> for Dim {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = i64::deserialize(deserializer)?;
        if raw < 0 {
            Ok(Dim::Unbound)
        } else {
            Ok(Dim::Fixed(raw as usize))
        }
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Fixed(n) => write!(f, "{n}"),
            Dim::Unbound => f.write_str("?"),
        }
    }
}

/// Named input slot of the serving signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placeholder {
    pub name: String,
    pub dtype: DType,
    pub shape: [Dim; 2],
}

/// The inference contract recorded alongside an exported model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServingSignature {
    pub features: BTreeMap<String, Placeholder>,
    /// Always `None`: serving never sees a label.
    pub label: Option<Placeholder>,
    pub default_inputs: BTreeMap<String, Placeholder>,
}

/// Describes one placeholder per feature column; never fed real data here.
#[derive(Debug, Clone)]
pub struct ServingInputFn {
    roles: ColumnRoles,
}

impl ServingInputFn {
    pub fn new(roles: ColumnRoles) -> Self {
        Self { roles }
    }

    pub fn invoke(&self) -> ServingSignature {
        let placeholder = |name: &String, dtype| {
            (
                name.clone(),
                Placeholder {
                    name: name.clone(),
                    dtype,
                    shape: [Dim::Unbound, Dim::Fixed(1)],
                },
            )
        };
        let placeholders: BTreeMap<String, Placeholder> = self
            .roles
            .continuous()
            .iter()
            .map(|name| placeholder(name, DType::Float64))
            .chain(
                self.roles
                    .categorical()
                    .iter()
                    .map(|name| placeholder(name, DType::String)),
            )
            .collect();

        ServingSignature {
            features: placeholders.clone(),
            label: None,
            default_inputs: placeholders,
        }
    }
}

/// Training and serving input functions built from the same partition.
#[derive(Debug, Clone)]
pub struct InputFnPair {
    training: TrainingInputFn,
    serving: ServingInputFn,
}

impl InputFnPair {
    /// Build both functions and verify their feature contracts agree.
    pub fn new(table: Table, roles: ColumnRoles) -> Result<Self, FixtureError> {
        let pair = Self {
            training: TrainingInputFn::new(table, roles.clone()),
            serving: ServingInputFn::new(roles),
        };
        check_parity(&pair.training, &pair.serving)?;
        Ok(pair)
    }

    pub fn training(&self) -> &TrainingInputFn {
        &self.training
    }

    pub fn serving(&self) -> &ServingInputFn {
        &self.serving
    }
}

/// Feature names and dtypes must match exactly between the two functions,
/// and every serving placeholder must be a `[?, 1]` column.
pub fn check_parity(training: &TrainingInputFn, serving: &ServingInputFn) -> Result<(), FixtureError> {
    let batch = training.invoke()?;
    let signature = serving.invoke();

    let trained: BTreeMap<&str, DType> = batch
        .features
        .iter()
        .map(|(name, tensor)| (name.as_str(), tensor.dtype()))
        .collect();
    let served: BTreeMap<&str, DType> = signature
        .features
        .iter()
        .map(|(name, placeholder)| (name.as_str(), placeholder.dtype))
        .collect();

    if trained != served {
        return Err(FixtureError::SignatureMismatch(format!(
            "training features {trained:?} vs serving placeholders {served:?}"
        )));
    }
    if signature.label.is_some() {
        return Err(FixtureError::SignatureMismatch(
            "serving signature must not carry a label".to_string(),
        ));
    }
    if signature.default_inputs != signature.features {
        return Err(FixtureError::SignatureMismatch(
            "default inputs differ from feature placeholders".to_string(),
        ));
    }
    for (name, tensor) in &batch.features {
        if tensor.shape() != [training.row_count(), 1] {
            return Err(FixtureError::SignatureMismatch(format!(
                "training tensor `{name}` has shape {:?}",
                tensor.shape()
            )));
        }
        let shape = signature.features[name].shape;
        if shape[1] != Dim::Fixed(1) {
            return Err(FixtureError::SignatureMismatch(format!(
                "placeholder `{name}` has shape [{}, {}]",
                shape[0], shape[1]
            )));
        }
    }
    Ok(())
}
