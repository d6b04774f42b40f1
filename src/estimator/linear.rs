//! Linear classifier/regressor over sparse input.
//!
//! Sparse columns are consumed directly: a category's slot indexes straight
//! into the weight matrix, so no one-hot expansion is needed.

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use tracing::{debug, trace};

use super::{Architecture, Estimator};
use super::export::{SavedModel, Variable, Variables, write_saved_model};
use super::head::Head;
use super::layout::{InputLayout, SparseRow};
use super::optim::Adagrad;
use crate::encoding::FeatureColumn;
use crate::input_fn::{ServingInputFn, TrainingInputFn};
use crate::table::Value;

const LEARNING_RATE: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct LinearEstimator {
    head: Head,
    layout: InputLayout,
    /// Row-major `[width][logits_dim]`.
    weights: Vec<f64>,
    bias: Vec<f64>,
    trained_steps: u64,
}

impl LinearEstimator {
    pub fn new(head: Head, columns: Vec<FeatureColumn>) -> Self {
        let layout = InputLayout::new(columns);
        let k = head.logits_dim();
        Self {
            head,
            weights: vec![0.0; layout.width() * k],
            bias: vec![0.0; k],
            layout,
            trained_steps: 0,
        }
    }

    fn logits(&self, row: &SparseRow) -> Vec<f64> {
        let k = self.head.logits_dim();
        let mut out = self.bias.clone();
        for &(slot, v) in row {
            for (j, o) in out.iter_mut().enumerate() {
                *o += self.weights[slot * k + j] * v;
            }
        }
        out
    }

    fn rows(&self, input_fn: &TrainingInputFn) -> Result<Vec<SparseRow>> {
        let batch = input_fn.invoke()?;
        Ok(self.layout.sparse_rows(&batch.features)?)
    }

    fn labelled_rows(&self, input_fn: &TrainingInputFn) -> Result<(Vec<SparseRow>, Vec<f64>)> {
        let batch = input_fn.invoke()?;
        let rows = self.layout.sparse_rows(&batch.features)?;
        let targets = self.head.targets(&batch.label)?;
        Ok((rows, targets))
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Rebuild a trained model from its exported description and variables.
    pub fn restore(model: &SavedModel, variables: &Variables) -> Result<Self> {
        if model.architecture != Architecture::Linear || !model.hidden_units.is_empty() {
            bail!("`{}` is not a linear export", model.estimator);
        }
        let mut restored = Self::new(model.head, model.feature_columns.clone());
        let k = restored.head.logits_dim();
        restored.weights = variables
            .values("linear/weights", &[restored.layout.width(), k])?
            .to_vec();
        restored.bias = variables.values("linear/bias", &[k])?.to_vec();
        if variables.tensors.len() != 2 {
            bail!(
                "linear export holds {} variables, expected weights and bias",
                variables.tensors.len()
            );
        }
        restored.trained_steps = model.global_step;
        Ok(restored)
    }
}

impl Estimator for LinearEstimator {
    fn name(&self) -> String {
        format!("Linear{}", self.head.estimator_suffix())
    }

    fn fit(&mut self, input_fn: &TrainingInputFn, steps: u64) -> Result<()> {
        let (rows, targets) = self.labelled_rows(input_fn)?;
        if rows.is_empty() {
            bail!("cannot fit {} on an empty dataset", self.name());
        }
        let k = self.head.logits_dim();
        let n = rows.len() as f64;
        let mut weight_opt = Adagrad::new(LEARNING_RATE, self.weights.len());
        let mut bias_opt = Adagrad::new(LEARNING_RATE, self.bias.len());

        for step in 0..steps {
            let mut weight_grad = vec![0.0; self.weights.len()];
            let mut bias_grad = vec![0.0; k];
            let mut loss = 0.0;

            for (row, &target) in rows.iter().zip(&targets) {
                let (row_loss, dlogits) = self.head.loss_and_gradient(&self.logits(row), target);
                loss += row_loss;
                for (j, g) in dlogits.iter().enumerate() {
                    bias_grad[j] += g / n;
                    for &(slot, v) in row {
                        weight_grad[slot * k + j] += g * v / n;
                    }
                }
            }

            weight_opt.step(&mut self.weights, &weight_grad);
            bias_opt.step(&mut self.bias, &bias_grad);
            if step % 100 == 0 {
                trace!(step, loss = loss / n, "linear training step");
            }
        }

        self.trained_steps += steps;
        debug!(
            estimator = %self.name(),
            steps = self.trained_steps,
            "linear training finished"
        );
        Ok(())
    }

    fn predict(&self, input_fn: &TrainingInputFn) -> Result<Vec<Value>> {
        let rows = self.rows(input_fn)?;
        Ok(rows.iter().map(|r| self.head.predict(&self.logits(r))).collect())
    }

    fn predict_probabilities(&self, input_fn: &TrainingInputFn) -> Result<Vec<Vec<f64>>> {
        if self.head.n_classes().is_none() {
            bail!("{} does not produce class probabilities", self.name());
        }
        let rows = self.rows(input_fn)?;
        rows.iter()
            .map(|r| {
                self.head
                    .probabilities(&self.logits(r))
                    .ok_or_else(|| anyhow::anyhow!("missing class probabilities"))
            })
            .collect()
    }

    fn export(&self, export_dir_base: &Path, serving_input_fn: &ServingInputFn) -> Result<PathBuf> {
        let model = SavedModel::new(
            self.name(),
            Architecture::Linear,
            self.head,
            self.layout.columns().to_vec(),
            Vec::new(),
            self.trained_steps,
            serving_input_fn,
        )?;
        let k = self.head.logits_dim();
        let mut variables = Variables::default();
        variables.insert(
            "linear/weights",
            Variable::new(vec![self.layout.width(), k], self.weights.clone()),
        );
        variables.insert("linear/bias", Variable::new(vec![k], self.bias.clone()));
        write_saved_model(export_dir_base, &model, &variables)
    }
}
