use std::fmt::Write as _;

use crate::catalog::{FixtureOutcome, PlannedFixture};

/// Render the end-of-run table printed by `build` and `verify`; `done`
/// names what happened to the fixtures that succeeded.
pub fn format_summary(outcomes: &[FixtureOutcome], done: &str) -> String {
    let width = outcomes
        .iter()
        .map(|o| o.name().len())
        .max()
        .unwrap_or(0)
        .max("fixture".len());

    let mut out = String::new();
    let _ = writeln!(out, "{:<width$}  {:<7}  {:>5}  {}", "fixture", "status", "rows", "detail");
    for outcome in outcomes {
        match outcome {
            FixtureOutcome::Succeeded(report) => {
                let _ = writeln!(
                    out,
                    "{:<width$}  {:<7}  {:>5}  {}",
                    report.name,
                    "ok",
                    report.rows,
                    report.artifact.display()
                );
            }
            FixtureOutcome::Failed { name, error } => {
                let _ = writeln!(out, "{:<width$}  {:<7}  {:>5}  {error:#}", name, "failed", "-");
            }
        }
    }
    let failed = outcomes.iter().filter(|o| o.is_failure()).count();
    let _ = write!(
        out,
        "{} {done}, {} failed",
        outcomes.len() - failed,
        failed
    );
    out
}

pub fn print_summary(outcomes: &[FixtureOutcome], done: &str) {
    println!("{}", format_summary(outcomes, done));
}

/// One line per fixture for `list`.
pub fn format_plan(planned: &[PlannedFixture<'_>]) -> String {
    let width = planned.iter().map(|p| p.name.len()).max().unwrap_or(0);
    planned
        .iter()
        .map(|p| {
            format!(
                "{:<width$}  dataset={} architecture={} steps={}",
                p.name,
                p.dataset.name,
                p.estimator.architecture.display_name(),
                p.dataset.steps
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
