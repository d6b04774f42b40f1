//! Text serialisation of trained estimators.
//!
//! Layout of one export:
//!
//! ```text
//! <export_dir_base>/<unix-seconds>/
//!     saved_model.json          model description + serving signature
//!     variables/variables.json  learned parameters
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::Architecture;
use super::head::Head;
use crate::encoding::FeatureColumn;
use crate::errors::FixtureError;
use crate::input_fn::{Dim, ServingInputFn};
use crate::table::DType;

pub const SAVED_MODEL_FILE: &str = "saved_model.json";
pub const VARIABLES_DIR: &str = "variables";
pub const VARIABLES_FILE: &str = "variables.json";
pub const SERVING_SIGNATURE_KEY: &str = "serving_default";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorInfo {
    pub dtype: DType,
    pub shape: Vec<Dim>,
}

/// Named inputs and outputs of one callable entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureDef {
    pub method: String,
    pub inputs: BTreeMap<String, TensorInfo>,
    pub outputs: BTreeMap<String, TensorInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedModel {
    pub format_version: u32,
    pub estimator: String,
    pub architecture: Architecture,
    pub head: Head,
    pub feature_columns: Vec<FeatureColumn>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hidden_units: Vec<usize>,
    pub global_step: u64,
    pub signatures: BTreeMap<String, SignatureDef>,
}

impl SavedModel {
    pub const FORMAT_VERSION: u32 = 1;

    /// Describe a model, deriving its serving signature from the serving
    /// input function. The placeholders must cover exactly the model's
    /// feature columns with the same dtypes.
    pub fn new(
        estimator: String,
        architecture: Architecture,
        head: Head,
        feature_columns: Vec<FeatureColumn>,
        hidden_units: Vec<usize>,
        global_step: u64,
        serving_input_fn: &ServingInputFn,
    ) -> Result<Self, FixtureError> {
        check_columns(&feature_columns, serving_input_fn)?;
        let serving = serving_input_fn.invoke();

        let inputs = serving
            .default_inputs
            .iter()
            .map(|(name, p)| {
                (
                    name.clone(),
                    TensorInfo {
                        dtype: p.dtype,
                        shape: p.shape.to_vec(),
                    },
                )
            })
            .collect();

        let mut outputs = BTreeMap::new();
        let method = match head.n_classes() {
            Some(k) => {
                outputs.insert(
                    "classes".to_string(),
                    TensorInfo {
                        dtype: DType::Int64,
                        shape: vec![Dim::Unbound, Dim::Fixed(1)],
                    },
                );
                outputs.insert(
                    "probabilities".to_string(),
                    TensorInfo {
                        dtype: DType::Float64,
                        shape: vec![Dim::Unbound, Dim::Fixed(k)],
                    },
                );
                "classify"
            }
            None => {
                outputs.insert(
                    "predictions".to_string(),
                    TensorInfo {
                        dtype: DType::Float64,
                        shape: vec![Dim::Unbound, Dim::Fixed(1)],
                    },
                );
                "regress"
            }
        };

        let mut signatures = BTreeMap::new();
        signatures.insert(
            SERVING_SIGNATURE_KEY.to_string(),
            SignatureDef {
                method: method.to_string(),
                inputs,
                outputs,
            },
        );

        Ok(Self {
            format_version: Self::FORMAT_VERSION,
            estimator,
            architecture,
            head,
            feature_columns,
            hidden_units,
            global_step,
            signatures,
        })
    }

    pub fn serving_signature(&self) -> Option<&SignatureDef> {
        self.signatures.get(SERVING_SIGNATURE_KEY)
    }

    /// Check that a reloaded model can be fed by `serving_input_fn`: its
    /// columns and its recorded signature inputs must both match.
    pub fn check_serving(&self, serving_input_fn: &ServingInputFn) -> Result<(), FixtureError> {
        check_columns(&self.feature_columns, serving_input_fn)?;
        let signature = self.serving_signature().ok_or_else(|| {
            FixtureError::SignatureMismatch(format!("no `{SERVING_SIGNATURE_KEY}` signature"))
        })?;
        let recorded: BTreeMap<&str, DType> = signature
            .inputs
            .iter()
            .map(|(name, info)| (name.as_str(), info.dtype))
            .collect();
        let served = serving_input_fn.invoke();
        let declared: BTreeMap<&str, DType> = served
            .default_inputs
            .iter()
            .map(|(name, p)| (name.as_str(), p.dtype))
            .collect();
        if recorded != declared {
            return Err(FixtureError::SignatureMismatch(format!(
                "recorded inputs {recorded:?} vs serving placeholders {declared:?}"
            )));
        }
        Ok(())
    }
}

fn check_columns(
    feature_columns: &[FeatureColumn],
    serving_input_fn: &ServingInputFn,
) -> Result<(), FixtureError> {
    let serving = serving_input_fn.invoke();
    let expected: BTreeMap<&str, DType> = feature_columns
        .iter()
        .map(|c| (c.column(), c.dtype()))
        .collect();
    let declared: BTreeMap<&str, DType> = serving
        .features
        .iter()
        .map(|(name, p)| (name.as_str(), p.dtype))
        .collect();
    if expected != declared {
        return Err(FixtureError::SignatureMismatch(format!(
            "model columns {expected:?} vs serving placeholders {declared:?}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub shape: Vec<usize>,
    pub values: Vec<f64>,
}

impl Variable {
    pub fn new(shape: Vec<usize>, values: Vec<f64>) -> Self {
        Self { shape, values }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Variables {
    pub tensors: BTreeMap<String, Variable>,
}

impl Variables {
    pub fn insert(&mut self, name: impl Into<String>, variable: Variable) {
        self.tensors.insert(name.into(), variable);
    }

    /// Values of `name`, which must exist with exactly `shape`.
    pub fn values(&self, name: &str, shape: &[usize]) -> Result<&[f64]> {
        let variable = self
            .tensors
            .get(name)
            .ok_or_else(|| anyhow!("variable `{name}` is missing"))?;
        if variable.shape != shape {
            bail!(
                "variable `{name}` has shape {:?}, expected {shape:?}",
                variable.shape
            );
        }
        let expected: usize = shape.iter().product();
        if variable.values.len() != expected {
            bail!(
                "variable `{name}` holds {} values, expected {expected}",
                variable.values.len()
            );
        }
        Ok(&variable.values)
    }
}

/// Write a new timestamped export directory under `export_dir_base`.
pub fn write_saved_model(
    export_dir_base: &Path,
    model: &SavedModel,
    variables: &Variables,
) -> Result<PathBuf> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before the unix epoch")?
        .as_secs();
    let export_dir = export_dir_base.join(timestamp.to_string());
    if export_dir.exists() {
        bail!("export directory {} already exists", export_dir.display());
    }

    let variables_dir = export_dir.join(VARIABLES_DIR);
    fs::create_dir_all(&variables_dir)
        .with_context(|| format!("failed to create {}", variables_dir.display()))?;

    let model_json = serde_json::to_string_pretty(model).context("failed to serialize model")?;
    fs::write(export_dir.join(SAVED_MODEL_FILE), model_json)
        .with_context(|| format!("failed to write {SAVED_MODEL_FILE}"))?;

    let variables_json =
        serde_json::to_string_pretty(variables).context("failed to serialize variables")?;
    fs::write(variables_dir.join(VARIABLES_FILE), variables_json)
        .with_context(|| format!("failed to write {VARIABLES_FILE}"))?;

    info!(
        path = %export_dir.display(),
        estimator = %model.estimator,
        variables = variables.tensors.len(),
        "exported model"
    );
    Ok(export_dir)
}

/// Read back the model description from an export directory.
pub fn read_saved_model(export_dir: &Path) -> Result<SavedModel> {
    let path = export_dir.join(SAVED_MODEL_FILE);
    let text = fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

/// Read back the learned parameters from an export directory.
pub fn read_variables(export_dir: &Path) -> Result<Variables> {
    let path = export_dir.join(VARIABLES_DIR).join(VARIABLES_FILE);
    let text = fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}
