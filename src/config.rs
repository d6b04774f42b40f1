//! Fixture catalog configuration.
//!
//! The built-in catalog is [`Config::default`]; a JSON file with the same
//! shape can replace it.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use heck::ToUpperCamelCase;
use serde::{Deserialize, Serialize};

use crate::estimator::Architecture;
use crate::roles::{LabelKind, RoleSpec, Task};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Input datasets are read from here and prediction CSVs written here.
    pub csv_dir: PathBuf,
    pub savedmodel_dir: PathBuf,
    pub datasets: Vec<DatasetConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub name: String,
    /// File name inside `csv_dir`.
    pub file: String,
    #[serde(flatten)]
    pub roles: RoleSpec,
    pub steps: u64,
    pub estimators: Vec<EstimatorConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EstimatorConfig {
    pub architecture: Architecture,
    #[serde(default)]
    pub hidden_units: Vec<usize>,
    #[serde(default)]
    pub seed: i64,
}

impl EstimatorConfig {
    pub fn linear() -> Self {
        Self {
            architecture: Architecture::Linear,
            hidden_units: Vec::new(),
            seed: 0,
        }
    }

    pub fn dnn(hidden_units: Vec<usize>) -> Self {
        Self {
            architecture: Architecture::Dnn,
            hidden_units,
            seed: 42,
        }
    }
}

impl DatasetConfig {
    /// The task this dataset's label implies.
    pub fn task(&self) -> Task {
        match &self.roles.label_kind {
            LabelKind::Classes { vocabulary } => Task::Classification {
                n_classes: vocabulary.len(),
            },
            LabelKind::Numeric => Task::Regression,
        }
    }

    /// `<Arch><Task><Dataset>`, e.g. `DNNRegressionAuto`.
    pub fn fixture_name(&self, estimator: &EstimatorConfig) -> String {
        format!(
            "{}{}{}",
            estimator.architecture.display_name(),
            self.task().display_name(),
            self.name.to_upper_camel_case()
        )
    }
}

fn names(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            csv_dir: PathBuf::from("csv"),
            savedmodel_dir: PathBuf::from("savedmodel"),
            datasets: vec![
                DatasetConfig {
                    name: "Audit".to_string(),
                    file: "Audit.csv".to_string(),
                    roles: RoleSpec {
                        continuous: names(&["Age", "Income", "Deductions", "Hours"]),
                        categorical: names(&[
                            "Employment",
                            "Education",
                            "Marital",
                            "Occupation",
                            "Gender",
                        ]),
                        label: "Adjusted".to_string(),
                        label_kind: LabelKind::Classes {
                            vocabulary: names(&["0", "1"]),
                        },
                    },
                    steps: 2000,
                    estimators: vec![EstimatorConfig::dnn(vec![71, 11]), EstimatorConfig::linear()],
                },
                DatasetConfig {
                    name: "Iris".to_string(),
                    file: "Iris.csv".to_string(),
                    roles: RoleSpec {
                        continuous: names(&[
                            "Sepal.Length",
                            "Sepal.Width",
                            "Petal.Length",
                            "Petal.Width",
                        ]),
                        categorical: Vec::new(),
                        label: "Species".to_string(),
                        label_kind: LabelKind::Classes {
                            vocabulary: names(&["setosa", "versicolor", "virginica"]),
                        },
                    },
                    steps: 500,
                    estimators: vec![EstimatorConfig::dnn(vec![11]), EstimatorConfig::linear()],
                },
                DatasetConfig {
                    name: "Auto".to_string(),
                    file: "Auto.csv".to_string(),
                    roles: RoleSpec {
                        continuous: names(&[
                            "cylinders",
                            "displacement",
                            "horsepower",
                            "weight",
                            "acceleration",
                            "model_year",
                        ]),
                        categorical: names(&["origin"]),
                        label: "mpg".to_string(),
                        label_kind: LabelKind::Numeric,
                    },
                    steps: 2000,
                    estimators: vec![
                        EstimatorConfig::dnn(vec![7, 5, 3]),
                        EstimatorConfig::linear(),
                    ],
                },
            ],
        }
    }
}

impl Config {
    /// Load a JSON config file. Missing top-level fields take their defaults.
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Config = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply one step budget to every dataset.
    pub fn override_steps(&mut self, steps: u64) {
        for dataset in &mut self.datasets {
            dataset.steps = steps;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut datasets = HashSet::new();
        let mut fixtures = HashSet::new();
        for dataset in &self.datasets {
            if !datasets.insert(dataset.name.as_str()) {
                bail!("dataset `{}` is configured twice", dataset.name);
            }
            if dataset.estimators.is_empty() {
                bail!("dataset `{}` has no estimators", dataset.name);
            }
            for estimator in &dataset.estimators {
                let name = dataset.fixture_name(estimator);
                if !fixtures.insert(name.clone()) {
                    bail!("fixture `{name}` is configured twice");
                }
            }
        }
        Ok(())
    }
}
