//! Train → predict → export → persist, for one fixture at a time.
//!
//! Predictions are staged to a hidden temp file and the export goes to a
//! scratch dir; the fixture's real names are only touched once every model
//! call has succeeded, so a failed run never leaves a partial fixture behind.
//!
//! [`verify_artifact`] runs the other direction: it reloads an installed
//! artifact and checks it still reproduces the CSV written beside it.

use std::fmt;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use tracing::{debug, error, info};

use crate::errors::FixtureError;
use crate::estimator::export::read_saved_model;
use crate::estimator::{self, Estimator};
use crate::input_fn::{InputFnPair, TrainingInputFn};
use crate::roles::Task;
use crate::store::{ArtifactStore, PredictionTable};

/// Which prediction columns a fixture records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputPolicy {
    PointOnly,
    WithProbabilities { n_classes: usize },
}

impl OutputPolicy {
    /// Classifiers record class probabilities, regressors do not.
    pub fn for_task(task: Task) -> Self {
        match task {
            Task::Classification { n_classes } => OutputPolicy::WithProbabilities { n_classes },
            Task::Regression => OutputPolicy::PointOnly,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureSpec {
    pub name: String,
    pub steps: u64,
    pub output: OutputPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Untrained,
    Trained,
    Predicted,
    Exported,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Untrained => "untrained",
            Stage::Trained => "trained",
            Stage::Predicted => "predicted",
            Stage::Exported => "exported",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

/// Where a finished fixture ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureReport {
    pub name: String,
    pub estimator: String,
    pub rows: usize,
    pub predictions: PathBuf,
    pub artifact: PathBuf,
}

struct Progress<'a> {
    fixture: &'a str,
    stage: Stage,
}

impl Progress<'_> {
    fn advance(&mut self, next: Stage) {
        debug!(fixture = self.fixture, from = %self.stage, to = %next, "stage transition");
        self.stage = next;
        info!(fixture = self.fixture, stage = %next, "fixture progress");
    }
}

/// Predict every training row in the layout `spec.output` asks for.
fn score(estimator: &dyn Estimator, training: &TrainingInputFn, spec: &FixtureSpec) -> Result<PredictionTable> {
    let rows = training.row_count();
    let targets = estimator
        .predict(training)
        .with_context(|| format!("{}: prediction failed", spec.name))?;
    if targets.len() != rows {
        return Err(FixtureError::RowCountMismatch {
            what: "point predictions".to_string(),
            expected: rows,
            actual: targets.len(),
        }
        .into());
    }
    let table = match spec.output {
        OutputPolicy::PointOnly => PredictionTable::point_only(targets),
        OutputPolicy::WithProbabilities { n_classes } => {
            let probabilities = estimator
                .predict_probabilities(training)
                .with_context(|| format!("{}: probability prediction failed", spec.name))?;
            PredictionTable::with_probabilities(targets, probabilities, n_classes)?
        }
    };
    Ok(table)
}

/// Build one fixture end to end. Any error before the final persist step
/// leaves the previous fixture untouched. A failure inside it leaves the
/// new artifact without a predictions CSV, never beside a stale one.
pub fn run_fixture(
    estimator: &mut dyn Estimator,
    inputs: &InputFnPair,
    spec: &FixtureSpec,
    store: &ArtifactStore,
) -> Result<FixtureReport> {
    let mut progress = Progress {
        fixture: &spec.name,
        stage: Stage::Untrained,
    };
    let training = inputs.training();
    let rows = training.row_count();
    info!(
        fixture = %spec.name,
        estimator = %estimator.name(),
        rows,
        steps = spec.steps,
        "building fixture"
    );

    estimator
        .fit(training, spec.steps)
        .with_context(|| format!("{}: training failed", spec.name))?;
    progress.advance(Stage::Trained);

    let table = score(&*estimator, training, spec)?;
    let staged = store.stage_predictions(&table, &spec.name)?;
    progress.advance(Stage::Predicted);

    let scratch = store.scratch_dir(&spec.name)?;
    let export_dir = estimator
        .export(scratch.path(), inputs.serving())
        .with_context(|| format!("{}: export failed", spec.name))?;
    if !export_dir.starts_with(scratch.path()) || !export_dir.is_dir() {
        bail!(
            "{}: export returned {} outside its scratch directory",
            spec.name,
            export_dir.display()
        );
    }
    progress.advance(Stage::Exported);

    // The previous CSV goes first so it can never sit next to the new artifact.
    store.discard_predictions(&spec.name)?;
    let artifact = store.replace_artifact(&export_dir, &spec.name)?;
    let predictions = staged.commit().inspect_err(|err| {
        error!(
            fixture = %spec.name,
            artifact = %artifact.display(),
            error = %format!("{err:#}"),
            "artifact installed but predictions were not written"
        );
    })?;
    progress.advance(Stage::Done);

    Ok(FixtureReport {
        name: spec.name.clone(),
        estimator: estimator.name(),
        rows,
        predictions,
        artifact,
    })
}

/// Reload a built fixture's artifact, predict its training rows again and
/// require the result to equal its predictions CSV cell for cell.
pub fn verify_artifact(inputs: &InputFnPair, spec: &FixtureSpec, store: &ArtifactStore) -> Result<FixtureReport> {
    let artifact = store.artifact_path(&spec.name);
    if !artifact.is_dir() {
        bail!("{}: no artifact at {}", spec.name, artifact.display());
    }
    let model = read_saved_model(&artifact)?;
    model
        .check_serving(inputs.serving())
        .with_context(|| format!("{}: artifact no longer matches its dataset", spec.name))?;
    let estimator = estimator::load(&artifact).with_context(|| format!("{}: reload failed", spec.name))?;

    let expected = score(estimator.as_ref(), inputs.training(), spec)?;
    let (headers, records) = store.read_predictions(&spec.name)?;
    compare_predictions(&expected, &headers, &records)
        .with_context(|| format!("{}: reloaded model disagrees with its predictions", spec.name))?;
    info!(fixture = %spec.name, rows = records.len(), "fixture verified");

    Ok(FixtureReport {
        name: spec.name.clone(),
        estimator: estimator.name(),
        rows: records.len(),
        predictions: store.predictions_path(&spec.name),
        artifact,
    })
}

fn compare_predictions(
    expected: &PredictionTable,
    headers: &[String],
    records: &[Vec<String>],
) -> Result<(), FixtureError> {
    let expected_headers = expected.headers();
    if headers != expected_headers.as_slice() {
        return Err(FixtureError::PredictionMismatch {
            location: "header".to_string(),
            expected: expected_headers.join(","),
            actual: headers.join(","),
        });
    }
    if records.len() != expected.row_count() {
        return Err(FixtureError::RowCountMismatch {
            what: "stored predictions".to_string(),
            expected: expected.row_count(),
            actual: records.len(),
        });
    }
    for (row, actual) in records.iter().enumerate() {
        let wanted = expected.record(row);
        if actual != &wanted {
            return Err(FixtureError::PredictionMismatch {
                location: format!("row {row}"),
                expected: wanted.join(","),
                actual: actual.join(","),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use anyhow::anyhow;
    use tempfile::tempdir;

    use super::*;
    use crate::input_fn::ServingInputFn;
    use crate::roles::{LabelKind, RoleSpec, classify};
    use crate::table::{Column, Table, Value};

    /// Echoes the row index as the prediction so row order is observable.
    #[derive(Default)]
    struct EchoEstimator {
        fail_at: Option<Stage>,
        /// Deletes staged CSV files here during export, so the final commit fails.
        lose_staged_in: Option<PathBuf>,
        probability_width: usize,
        fitted_steps: Option<u64>,
    }

    impl Estimator for EchoEstimator {
        fn name(&self) -> String {
            "EchoEstimator".to_string()
        }

        fn fit(&mut self, _input_fn: &TrainingInputFn, steps: u64) -> Result<()> {
            if self.fail_at == Some(Stage::Trained) {
                return Err(anyhow!("boom"));
            }
            self.fitted_steps = Some(steps);
            Ok(())
        }

        fn predict(&self, input_fn: &TrainingInputFn) -> Result<Vec<Value>> {
            if self.fail_at == Some(Stage::Predicted) {
                return Err(anyhow!("boom"));
            }
            Ok((0..input_fn.row_count() as i64).map(Value::Int).collect())
        }

        fn predict_probabilities(&self, input_fn: &TrainingInputFn) -> Result<Vec<Vec<f64>>> {
            Ok((0..input_fn.row_count())
                .map(|row| {
                    (0..self.probability_width)
                        .map(|k| (row * 10 + k) as f64)
                        .collect()
                })
                .collect())
        }

        fn export(&self, base: &Path, _serving: &ServingInputFn) -> Result<PathBuf> {
            if self.fail_at == Some(Stage::Exported) {
                return Err(anyhow!("boom"));
            }
            if let Some(csv_dir) = &self.lose_staged_in {
                for entry in fs::read_dir(csv_dir)? {
                    let path = entry?.path();
                    if path.to_string_lossy().ends_with(".csv.tmp") {
                        fs::remove_file(path)?;
                    }
                }
            }
            let dir = base.join("1");
            fs::create_dir_all(&dir)?;
            fs::write(dir.join("saved_model.json"), "{}")?;
            Ok(dir)
        }
    }

    fn inputs() -> InputFnPair {
        let mut table = Table::from_columns(vec![
            ("x".to_string(), Column::Float(vec![0.1, 0.2, 0.3])),
            ("y".to_string(), Column::Int(vec![0, 1, 1])),
        ])
        .unwrap();
        let roles = classify(
            &mut table,
            &RoleSpec {
                continuous: vec!["x".into()],
                categorical: vec![],
                label: "y".into(),
                label_kind: LabelKind::Classes {
                    vocabulary: vec!["0".into(), "1".into()],
                },
            },
        )
        .unwrap();
        InputFnPair::new(table, roles).unwrap()
    }

    fn spec(output: OutputPolicy) -> FixtureSpec {
        FixtureSpec {
            name: "EchoFixture".to_string(),
            steps: 7,
            output,
        }
    }

    #[test]
    fn test_output_policy_for_task() {
        assert_eq!(
            OutputPolicy::for_task(Task::Classification { n_classes: 3 }),
            OutputPolicy::WithProbabilities { n_classes: 3 }
        );
        assert_eq!(OutputPolicy::for_task(Task::Regression), OutputPolicy::PointOnly);
    }

    #[test]
    fn test_run_preserves_row_order_and_step_budget() {
        let tmp = tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path().join("csv"), tmp.path().join("savedmodel"));
        let mut estimator = EchoEstimator {
            probability_width: 2,
            ..Default::default()
        };

        let report = run_fixture(
            &mut estimator,
            &inputs(),
            &spec(OutputPolicy::WithProbabilities { n_classes: 2 }),
            &store,
        )
        .unwrap();

        assert_eq!(estimator.fitted_steps, Some(7));
        assert_eq!(report.rows, 3);
        assert_eq!(
            fs::read_to_string(&report.predictions).unwrap(),
            "_target,probability(0),probability(1)\n0,0,1\n1,10,11\n2,20,21\n"
        );
        assert!(report.artifact.join("saved_model.json").exists());
        // scratch directory is cleaned up once the artifact is moved out
        let entries: Vec<_> = fs::read_dir(tmp.path().join("savedmodel")).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_wrong_probability_width_aborts() {
        let tmp = tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path().join("csv"), tmp.path().join("savedmodel"));
        let mut estimator = EchoEstimator {
            probability_width: 3,
            ..Default::default()
        };
        let result = run_fixture(
            &mut estimator,
            &inputs(),
            &spec(OutputPolicy::WithProbabilities { n_classes: 2 }),
            &store,
        );
        assert!(result.is_err());
        assert!(!store.predictions_path("EchoFixture").exists());
        assert!(!store.artifact_path("EchoFixture").exists());
    }

    #[test]
    fn test_failures_leave_no_fixture() {
        for stage in [Stage::Trained, Stage::Predicted, Stage::Exported] {
            let tmp = tempdir().unwrap();
            let store = ArtifactStore::new(tmp.path().join("csv"), tmp.path().join("savedmodel"));
            let mut estimator = EchoEstimator {
                fail_at: Some(stage),
                ..Default::default()
            };
            let result = run_fixture(&mut estimator, &inputs(), &spec(OutputPolicy::PointOnly), &store);
            assert!(result.is_err(), "expected failure at {stage}");
            assert!(!store.predictions_path("EchoFixture").exists());
            assert!(!store.artifact_path("EchoFixture").exists());
        }
    }

    #[test]
    fn test_failed_commit_never_keeps_stale_predictions() {
        let tmp = tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path().join("csv"), tmp.path().join("savedmodel"));
        let mut first = EchoEstimator::default();
        run_fixture(&mut first, &inputs(), &spec(OutputPolicy::PointOnly), &store).unwrap();
        assert!(store.predictions_path("EchoFixture").exists());

        let mut second = EchoEstimator {
            lose_staged_in: Some(tmp.path().join("csv")),
            ..Default::default()
        };
        let result = run_fixture(&mut second, &inputs(), &spec(OutputPolicy::PointOnly), &store);
        assert!(result.is_err());
        // the new artifact is in place, and the old run's CSV is not left beside it
        assert!(store.artifact_path("EchoFixture").join("saved_model.json").exists());
        assert!(!store.predictions_path("EchoFixture").exists());
    }

    fn header(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_compare_predictions_is_exact() {
        let table = PredictionTable::with_probabilities(
            vec![Value::Int(1), Value::Int(0)],
            vec![vec![0.25, 0.75], vec![0.5, 0.5]],
            2,
        )
        .unwrap();
        let headers = header(&["_target", "probability(0)", "probability(1)"]);
        let rows = vec![header(&["1", "0.25", "0.75"]), header(&["0", "0.5", "0.5"])];
        compare_predictions(&table, &headers, &rows).unwrap();

        let mut drifted = rows.clone();
        drifted[1][2] = "0.5000000001".to_string();
        let err = compare_predictions(&table, &headers, &drifted).unwrap_err();
        assert!(matches!(err, FixtureError::PredictionMismatch { ref location, .. } if location == "row 1"));

        let narrow = header(&["_target", "probability(0)"]);
        assert!(matches!(
            compare_predictions(&table, &narrow, &rows),
            Err(FixtureError::PredictionMismatch { .. })
        ));
        assert!(matches!(
            compare_predictions(&table, &headers, &rows[..1]),
            Err(FixtureError::RowCountMismatch { .. })
        ));
    }

    #[test]
    fn test_verify_without_artifact_fails() {
        let tmp = tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path().join("csv"), tmp.path().join("savedmodel"));
        let err = verify_artifact(&inputs(), &spec(OutputPolicy::PointOnly), &store).unwrap_err();
        assert!(format!("{err:#}").contains("no artifact"));
    }
}
