//! Trainable model interface and the reference estimators used to produce
//! fixtures.
//!
//! The pipeline only talks to models through [`Estimator`]. The linear and
//! DNN implementations here cover the classifier/regressor shapes the
//! fixture catalog needs.

pub mod dnn;
pub mod export;
pub mod head;
pub mod layout;
pub mod linear;
pub mod optim;

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::encoding::{FeatureEncoding, InputDensity, feature_columns};
use crate::input_fn::{ServingInputFn, TrainingInputFn};
use crate::roles::Task;
use crate::table::Value;

pub use dnn::DnnEstimator;
use export::{SavedModel, read_saved_model, read_variables};
pub use head::Head;
pub use linear::LinearEstimator;

/// A model that can be trained, queried and exported.
pub trait Estimator {
    /// Display name, e.g. `LinearClassifier`.
    fn name(&self) -> String;

    /// Train for exactly `steps` optimisation steps.
    fn fit(&mut self, input_fn: &TrainingInputFn, steps: u64) -> Result<()>;

    /// One point estimate per row, in row order.
    fn predict(&self, input_fn: &TrainingInputFn) -> Result<Vec<Value>>;

    /// One class distribution per row, in row order.
    fn predict_probabilities(&self, input_fn: &TrainingInputFn) -> Result<Vec<Vec<f64>>>;

    /// Write the model under a fresh directory inside `export_dir_base` and
    /// return that directory.
    fn export(&self, export_dir_base: &Path, serving_input_fn: &ServingInputFn) -> Result<PathBuf>;
}

/// Model family, as named in fixture configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    Linear,
    Dnn,
}

impl Architecture {
    /// DNNs cannot consume sparse categorical input.
    pub fn input_density(&self) -> InputDensity {
        match self {
            Architecture::Linear => InputDensity::Sparse,
            Architecture::Dnn => InputDensity::Dense,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Architecture::Linear => "Linear",
            Architecture::Dnn => "DNN",
        }
    }

    /// Name of the estimator [`Architecture::build`] returns for `task`.
    pub fn estimator_name(&self, task: Task) -> Result<String> {
        Ok(format!("{}{}", self.display_name(), Head::for_task(task)?.estimator_suffix()))
    }

    /// Construct an untrained estimator over `encodings`, densifying them
    /// first when this architecture asks for it.
    pub fn build(
        &self,
        task: Task,
        encodings: &[FeatureEncoding],
        hidden_units: &[usize],
        seed: i64,
    ) -> Result<Box<dyn Estimator>> {
        let head = Head::for_task(task)?;
        let columns = feature_columns(encodings, self.input_density());
        let estimator: Box<dyn Estimator> = match self {
            Architecture::Linear => Box::new(LinearEstimator::new(head, columns)),
            Architecture::Dnn => Box::new(DnnEstimator::new(head, columns, hidden_units, seed)?),
        };
        Ok(estimator)
    }
}

/// Reload an exported model so it can be queried again. Fails when the
/// export's format version, architecture, head or layer shapes do not
/// agree with its stored variables.
pub fn load(export_dir: &Path) -> Result<Box<dyn Estimator>> {
    let model = read_saved_model(export_dir)?;
    if model.format_version != SavedModel::FORMAT_VERSION {
        bail!(
            "{}: unsupported format version {} (expected {})",
            export_dir.display(),
            model.format_version,
            SavedModel::FORMAT_VERSION
        );
    }
    let variables = read_variables(export_dir)?;
    let estimator: Box<dyn Estimator> = match model.architecture {
        Architecture::Linear => Box::new(LinearEstimator::restore(&model, &variables)?),
        Architecture::Dnn => Box::new(DnnEstimator::restore(&model, &variables)?),
    };
    if estimator.name() != model.estimator {
        bail!(
            "{}: recorded as {} but restores as {}",
            export_dir.display(),
            model.estimator,
            estimator.name()
        );
    }
    debug!(path = %export_dir.display(), estimator = %model.estimator, "model restored");
    Ok(estimator)
}
