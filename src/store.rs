//! On-disk persistence of fixtures: prediction CSVs and exported model
//! directories, both replaced wholesale under a stable name.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tempfile::{NamedTempFile, TempDir};
use tracing::{debug, info, warn};

use crate::errors::FixtureError;
use crate::table::Value;

/// Point estimates, optionally followed by one probability per class.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionTable {
    targets: Vec<Value>,
    probabilities: Option<Vec<Vec<f64>>>,
    n_classes: usize,
}

impl PredictionTable {
    pub const TARGET_COLUMN: &'static str = "_target";

    pub fn point_only(targets: Vec<Value>) -> Self {
        Self {
            targets,
            probabilities: None,
            n_classes: 0,
        }
    }

    /// Pair point estimates with probability rows. Both must be row-aligned
    /// and every probability row must have exactly `n_classes` entries.
    pub fn with_probabilities(
        targets: Vec<Value>,
        probabilities: Vec<Vec<f64>>,
        n_classes: usize,
    ) -> Result<Self, FixtureError> {
        if probabilities.len() != targets.len() {
            return Err(FixtureError::RowCountMismatch {
                what: "probability rows".to_string(),
                expected: targets.len(),
                actual: probabilities.len(),
            });
        }
        if let Some((row, p)) = probabilities
            .iter()
            .enumerate()
            .find(|(_, p)| p.len() != n_classes)
        {
            return Err(FixtureError::ProbabilityWidth {
                row,
                expected: n_classes,
                actual: p.len(),
            });
        }
        Ok(Self {
            targets,
            probabilities: Some(probabilities),
            n_classes,
        })
    }

    pub fn row_count(&self) -> usize {
        self.targets.len()
    }

    pub fn headers(&self) -> Vec<String> {
        let mut headers = vec![Self::TARGET_COLUMN.to_string()];
        headers.extend((0..self.n_classes).map(|k| format!("probability({k})")));
        headers
    }

    pub fn record(&self, row: usize) -> Vec<String> {
        let mut record = vec![self.targets[row].to_string()];
        if let Some(probabilities) = &self.probabilities {
            record.extend(probabilities[row].iter().map(ToString::to_string));
        }
        record
    }

    fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        wtr.write_record(self.headers())?;
        for row in 0..self.row_count() {
            wtr.write_record(self.record(row))?;
        }
        wtr.flush()?;
        Ok(())
    }
}

/// A predictions CSV written to a temporary file next to its final name.
/// Dropping it without [`StagedPredictions::commit`] discards the file.
#[derive(Debug)]
pub struct StagedPredictions {
    file: NamedTempFile,
    target: PathBuf,
}

impl StagedPredictions {
    /// Rename the staged file over `<name>.csv`.
    pub fn commit(self) -> Result<PathBuf> {
        let target = self.target;
        self.file
            .persist(&target)
            .map_err(|e| anyhow!(e.error))
            .with_context(|| format!("failed to persist predictions to {}", target.display()))?;
        info!(path = %target.display(), "wrote predictions");
        Ok(target)
    }
}

/// Owns the two output namespaces keyed by fixture name.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    csv_dir: PathBuf,
    savedmodel_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(csv_dir: impl Into<PathBuf>, savedmodel_dir: impl Into<PathBuf>) -> Self {
        Self {
            csv_dir: csv_dir.into(),
            savedmodel_dir: savedmodel_dir.into(),
        }
    }

    pub fn predictions_path(&self, name: &str) -> PathBuf {
        self.csv_dir.join(format!("{name}.csv"))
    }

    pub fn artifact_path(&self, name: &str) -> PathBuf {
        self.savedmodel_dir.join(name)
    }

    /// A fresh, uniquely named directory inside the artifact root, so a
    /// finished export can be renamed into place on the same filesystem.
    /// It is a hidden sibling of `<name>`, swept by the next replace if a
    /// crash leaves it behind.
    pub fn scratch_dir(&self, name: &str) -> Result<TempDir> {
        fs::create_dir_all(&self.savedmodel_dir).with_context(|| {
            format!("failed to create artifact root {}", self.savedmodel_dir.display())
        })?;
        tempfile::Builder::new()
            .prefix(&format!(".{name}.scratch-"))
            .tempdir_in(&self.savedmodel_dir)
            .context("failed to create scratch export directory")
    }

    /// Serialise `table` to a temporary file in the CSV directory.
    pub fn stage_predictions(&self, table: &PredictionTable, name: &str) -> Result<StagedPredictions> {
        fs::create_dir_all(&self.csv_dir)
            .with_context(|| format!("failed to create CSV dir {}", self.csv_dir.display()))?;
        let prefix = format!(".{name}-");
        sweep(&self.csv_dir, |path| {
            let file = file_name(path);
            file.starts_with(&prefix) && file.ends_with(".csv.tmp")
        });
        let mut file = tempfile::Builder::new()
            .prefix(&format!(".{name}-"))
            .suffix(".csv.tmp")
            .tempfile_in(&self.csv_dir)
            .context("failed to create staging file for predictions")?;
        table
            .write_csv(file.as_file_mut())
            .with_context(|| format!("failed to serialize predictions for {name}"))?;
        debug!(fixture = name, rows = table.row_count(), "staged predictions");
        Ok(StagedPredictions {
            file,
            target: self.predictions_path(name),
        })
    }

    /// Delete `<name>.csv` from an earlier run. Returns whether one existed.
    pub fn discard_predictions(&self, name: &str) -> Result<bool> {
        let path = self.predictions_path(name);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "removed previous predictions");
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(anyhow!(err))
                .with_context(|| format!("failed to remove {}", path.display())),
        }
    }

    /// Header and records of `<name>.csv`, as written.
    pub fn read_predictions(&self, name: &str) -> Result<(Vec<String>, Vec<Vec<String>>)> {
        let path = self.predictions_path(name);
        let mut reader = csv::Reader::from_path(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let headers = reader
            .headers()
            .with_context(|| format!("failed to read header of {}", path.display()))?
            .iter()
            .map(String::from)
            .collect();
        let records = reader
            .records()
            .map(|record| Ok(record?.iter().map(String::from).collect()))
            .collect::<Result<_, csv::Error>>()
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok((headers, records))
    }

    /// Write `<name>.csv`, unconditionally replacing any previous file.
    pub fn write_predictions(&self, table: &PredictionTable, name: &str) -> Result<PathBuf> {
        self.stage_predictions(table, name)?.commit()
    }

    /// Move `scratch` to `<savedmodel_dir>/<name>`, replacing any previous
    /// artifact so exactly one (the latest) remains.
    ///
    /// A prior artifact is renamed aside before the new one is renamed in,
    /// so the name is only vacant between two renames. If renaming is not
    /// possible the store falls back to copy-then-rename, and as a last
    /// resort to remove-then-move.
    pub fn replace_artifact(&self, scratch: &Path, name: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.savedmodel_dir).with_context(|| {
            format!("failed to create artifact root {}", self.savedmodel_dir.display())
        })?;
        let target = self.artifact_path(name);
        let prefix = format!(".{name}.");
        // Leftovers of interrupted runs. The live scratch dir contains `scratch`.
        sweep(&self.savedmodel_dir, |path| {
            file_name(path).starts_with(&prefix) && !scratch.starts_with(path)
        });

        if !target.exists() {
            self.move_into_place(scratch, &target, name)?;
            info!(path = %target.display(), "installed artifact");
            return Ok(target);
        }

        let aside = self.sibling(name, "replaced");
        if aside.exists() {
            fs::remove_dir_all(&aside)
                .with_context(|| format!("failed to clear {}", aside.display()))?;
        }

        match fs::rename(&target, &aside) {
            Ok(()) => {
                if let Err(err) = self.move_into_place(scratch, &target, name) {
                    if let Err(restore) = fs::rename(&aside, &target) {
                        warn!(
                            path = %target.display(),
                            err = %restore,
                            "failed to restore previous artifact"
                        );
                    }
                    return Err(err);
                }
                if let Err(err) = fs::remove_dir_all(&aside) {
                    warn!(path = %aside.display(), err = %err, "failed to remove replaced artifact");
                }
            }
            Err(err) => {
                warn!(
                    path = %target.display(),
                    err = %err,
                    "cannot rename previous artifact aside; removing it before move"
                );
                fs::remove_dir_all(&target)
                    .with_context(|| format!("failed to remove {}", target.display()))?;
                self.move_into_place(scratch, &target, name)?;
            }
        }

        info!(path = %target.display(), "replaced artifact");
        Ok(target)
    }

    fn move_into_place(&self, source: &Path, target: &Path, name: &str) -> Result<()> {
        match fs::rename(source, target) {
            Ok(()) => Ok(()),
            Err(err) => {
                debug!(err = %err, "rename failed; copying artifact instead");
                let staging = self.sibling(name, "staging");
                if staging.exists() {
                    fs::remove_dir_all(&staging)
                        .with_context(|| format!("failed to clear {}", staging.display()))?;
                }
                copy_dir_all(source, &staging)?;
                fs::rename(&staging, target)
                    .with_context(|| format!("failed to move artifact to {}", target.display()))?;
                fs::remove_dir_all(source)
                    .with_context(|| format!("failed to remove {}", source.display()))?;
                Ok(())
            }
        }
    }

    fn sibling(&self, name: &str, purpose: &str) -> PathBuf {
        self.savedmodel_dir
            .join(format!(".{name}.{purpose}-{}", std::process::id()))
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Best-effort removal of every entry of `dir` matching `stale`.
fn sweep(dir: &Path, stale: impl Fn(&Path) -> bool) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for path in entries.flatten().map(|e| e.path()).filter(|p| stale(p)) {
        let removed = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match removed {
            Ok(()) => debug!(path = %path.display(), "swept stale entry"),
            Err(err) => warn!(path = %path.display(), err = %err, "failed to sweep stale entry"),
        }
    }
}

fn copy_dir_all(source: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest).with_context(|| format!("failed to create {}", dest.display()))?;
    for entry in fs::read_dir(source).with_context(|| format!("failed to read {}", source.display()))? {
        let entry = entry?;
        let path = entry.path();
        let to = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&path, &to)?;
        } else {
            fs::copy(&path, &to)
                .with_context(|| format!("failed to copy {} to {}", path.display(), to.display()))?;
        }
    }
    Ok(())
}
