//! Turns a [`Config`] into fixture runs.
//!
//! Each dataset is loaded, classified, encoded and wrapped in input
//! functions once; every estimator configured for it then reuses the
//! same encodings so all fixtures of a dataset share one vocabulary.

use std::collections::BTreeSet;

use anyhow::{Context, Result, bail};
use tracing::{error, info, warn};

use crate::config::{Config, DatasetConfig, EstimatorConfig};
use crate::driver::{FixtureReport, FixtureSpec, OutputPolicy, run_fixture, verify_artifact};
use crate::encoding::{FeatureEncoding, build_encodings};
use crate::input_fn::InputFnPair;
use crate::roles::classify;
use crate::store::ArtifactStore;
use crate::table::TableSource;

/// One fixture the catalog can build.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedFixture<'a> {
    pub name: String,
    pub dataset: &'a DatasetConfig,
    pub estimator: &'a EstimatorConfig,
}

#[derive(Debug)]
pub enum FixtureOutcome {
    Succeeded(FixtureReport),
    Failed { name: String, error: anyhow::Error },
}

impl FixtureOutcome {
    pub fn name(&self) -> &str {
        match self {
            FixtureOutcome::Succeeded(report) => &report.name,
            FixtureOutcome::Failed { name, .. } => name,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, FixtureOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
    /// Continue with the remaining fixtures after one fails.
    pub keep_going: bool,
}

/// Every configured fixture in catalog order.
pub fn plan(config: &Config) -> Vec<PlannedFixture<'_>> {
    config
        .datasets
        .iter()
        .flat_map(|dataset| {
            dataset.estimators.iter().map(move |estimator| PlannedFixture {
                name: dataset.fixture_name(estimator),
                dataset,
                estimator,
            })
        })
        .collect()
}

/// Restrict `planned` to `selection`, keeping catalog order. An empty
/// selection keeps everything; an unknown name is an error.
pub fn select<'a>(
    planned: Vec<PlannedFixture<'a>>,
    selection: &[String],
) -> Result<Vec<PlannedFixture<'a>>> {
    if selection.is_empty() {
        return Ok(planned);
    }
    let known: BTreeSet<&str> = planned.iter().map(|p| p.name.as_str()).collect();
    let unknown: Vec<&str> = selection
        .iter()
        .map(String::as_str)
        .filter(|name| !known.contains(name))
        .collect();
    if !unknown.is_empty() {
        bail!(
            "unknown fixture(s): {} (known: {})",
            unknown.join(", "),
            known.into_iter().collect::<Vec<_>>().join(", ")
        );
    }
    Ok(planned
        .into_iter()
        .filter(|p| selection.contains(&p.name))
        .collect())
}

/// A dataset after role classification and encoding.
pub struct PreparedDataset {
    pub encodings: Vec<FeatureEncoding>,
    pub inputs: InputFnPair,
}

pub fn prepare_dataset(source: &dyn TableSource, dataset: &DatasetConfig) -> Result<PreparedDataset> {
    let mut table = source.load(&dataset.file)?;
    let roles = classify(&mut table, &dataset.roles)
        .with_context(|| format!("dataset `{}`: invalid column roles", dataset.name))?;
    let encodings = build_encodings(&table, &roles)
        .with_context(|| format!("dataset `{}`: failed to build encodings", dataset.name))?;
    let inputs = InputFnPair::new(table, roles)
        .with_context(|| format!("dataset `{}`: input functions disagree", dataset.name))?;
    info!(
        dataset = %dataset.name,
        features = encodings.len(),
        rows = inputs.training().row_count(),
        "prepared dataset"
    );
    Ok(PreparedDataset { encodings, inputs })
}

fn fixture_spec(fixture: &PlannedFixture<'_>) -> FixtureSpec {
    FixtureSpec {
        name: fixture.name.clone(),
        steps: fixture.dataset.steps,
        output: OutputPolicy::for_task(fixture.dataset.task()),
    }
}

/// Build one planned fixture against an already prepared dataset.
pub fn build_fixture(
    fixture: &PlannedFixture<'_>,
    prepared: &PreparedDataset,
    store: &ArtifactStore,
) -> Result<FixtureReport> {
    let mut estimator = fixture.estimator.architecture.build(
        fixture.dataset.task(),
        &prepared.encodings,
        &fixture.estimator.hidden_units,
        fixture.estimator.seed,
    )?;
    run_fixture(estimator.as_mut(), &prepared.inputs, &fixture_spec(fixture), store)
}

/// Reload one built fixture and check it against its predictions CSV.
/// The artifact must also have been built with the estimator the catalog
/// configures for it.
pub fn verify_fixture(
    fixture: &PlannedFixture<'_>,
    prepared: &PreparedDataset,
    store: &ArtifactStore,
) -> Result<FixtureReport> {
    let report = verify_artifact(&prepared.inputs, &fixture_spec(fixture), store)?;
    let expected = fixture.estimator.architecture.estimator_name(fixture.dataset.task())?;
    if report.estimator != expected {
        bail!(
            "{}: artifact holds a {} but the catalog configures a {expected}",
            fixture.name,
            report.estimator
        );
    }
    Ok(report)
}

/// Build `fixtures` in order. Without `keep_going` the first failure is
/// returned as the error; with it, failures are collected as outcomes.
pub fn build_all(
    fixtures: &[PlannedFixture<'_>],
    source: &dyn TableSource,
    store: &ArtifactStore,
    options: BuildOptions,
) -> Result<Vec<FixtureOutcome>> {
    run_all(fixtures, source, options, |fixture, prepared| {
        build_fixture(fixture, prepared, store)
    })
}

/// Verify `fixtures` in order, with the same failure policy as [`build_all`].
pub fn verify_all(
    fixtures: &[PlannedFixture<'_>],
    source: &dyn TableSource,
    store: &ArtifactStore,
    options: BuildOptions,
) -> Result<Vec<FixtureOutcome>> {
    run_all(fixtures, source, options, |fixture, prepared| {
        verify_fixture(fixture, prepared, store)
    })
}

/// Prepare each dataset once and run `action` on every fixture that uses it.
fn run_all<F>(
    fixtures: &[PlannedFixture<'_>],
    source: &dyn TableSource,
    options: BuildOptions,
    mut action: F,
) -> Result<Vec<FixtureOutcome>>
where
    F: FnMut(&PlannedFixture<'_>, &PreparedDataset) -> Result<FixtureReport>,
{
    let mut outcomes = Vec::with_capacity(fixtures.len());
    let mut index = 0;

    while index < fixtures.len() {
        let dataset = fixtures[index].dataset;
        let group_end = fixtures[index..]
            .iter()
            .position(|f| !std::ptr::eq(f.dataset, dataset))
            .map_or(fixtures.len(), |offset| index + offset);
        let group = &fixtures[index..group_end];
        index = group_end;

        let prepared = match prepare_dataset(source, dataset) {
            Ok(prepared) => prepared,
            Err(err) if options.keep_going => {
                error!(dataset = %dataset.name, error = %format!("{err:#}"), "dataset skipped");
                for fixture in group {
                    outcomes.push(FixtureOutcome::Failed {
                        name: fixture.name.clone(),
                        error: anyhow::anyhow!("{err:#}"),
                    });
                }
                continue;
            }
            Err(err) => return Err(err),
        };

        for fixture in group {
            match action(fixture, &prepared) {
                Ok(report) => outcomes.push(FixtureOutcome::Succeeded(report)),
                Err(err) if options.keep_going => {
                    warn!(fixture = %fixture.name, error = %format!("{err:#}"), "fixture failed");
                    outcomes.push(FixtureOutcome::Failed {
                        name: fixture.name.clone(),
                        error: err,
                    });
                }
                Err(err) => return Err(err.context(format!("fixture `{}` failed", fixture.name))),
            }
        }
    }
    Ok(outcomes)
}
