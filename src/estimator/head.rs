//! Output heads: how logits turn into losses, predictions and probabilities.

use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Serialize};

use crate::input_fn::Tensor;
use crate::roles::Task;
use crate::table::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Head {
    /// Single logit, sigmoid.
    Binary,
    /// One logit per class, softmax.
    MultiClass { n_classes: usize },
    /// Single real-valued output, squared error.
    Regression,
}

impl Head {
    pub fn for_task(task: Task) -> Result<Self> {
        match task {
            Task::Classification { n_classes } if n_classes < 2 => {
                bail!("classification needs at least 2 classes, got {n_classes}")
            }
            Task::Classification { n_classes: 2 } => Ok(Head::Binary),
            Task::Classification { n_classes } => Ok(Head::MultiClass { n_classes }),
            Task::Regression => Ok(Head::Regression),
        }
    }

    pub fn logits_dim(&self) -> usize {
        match self {
            Head::Binary | Head::Regression => 1,
            Head::MultiClass { n_classes } => *n_classes,
        }
    }

    pub fn n_classes(&self) -> Option<usize> {
        match self {
            Head::Binary => Some(2),
            Head::MultiClass { n_classes } => Some(*n_classes),
            Head::Regression => None,
        }
    }

    pub fn estimator_suffix(&self) -> &'static str {
        match self {
            Head::Binary | Head::MultiClass { .. } => "Classifier",
            Head::Regression => "Regressor",
        }
    }

    /// Label tensor as per-row targets: class index or real value.
    pub fn targets(&self, label: &Tensor) -> Result<Vec<f64>> {
        match self {
            Head::Regression => label
                .as_f64()
                .map(<[f64]>::to_vec)
                .ok_or_else(|| anyhow!("regression label must be float64, got {}", label.dtype())),
            Head::Binary | Head::MultiClass { .. } => {
                let classes = label.as_i64().ok_or_else(|| {
                    anyhow!("classification label must be int64, got {}", label.dtype())
                })?;
                let k = self.logits_dim().max(2) as i64;
                classes
                    .iter()
                    .map(|&c| {
                        if (0..k).contains(&c) {
                            Ok(c as f64)
                        } else {
                            Err(anyhow!("class index {c} outside 0..{k}"))
                        }
                    })
                    .collect()
            }
        }
    }

    /// Loss for one row and its gradient with respect to the logits.
    pub fn loss_and_gradient(&self, logits: &[f64], target: f64) -> (f64, Vec<f64>) {
        match self {
            Head::Binary => {
                let p = sigmoid(logits[0]);
                let eps = 1e-12;
                let loss = -(target * (p + eps).ln() + (1.0 - target) * (1.0 - p + eps).ln());
                (loss, vec![p - target])
            }
            Head::MultiClass { .. } => {
                let probs = softmax(logits);
                let class = target as usize;
                let loss = -(probs[class] + 1e-12).ln();
                let grad = probs
                    .iter()
                    .enumerate()
                    .map(|(k, p)| if k == class { p - 1.0 } else { *p })
                    .collect();
                (loss, grad)
            }
            Head::Regression => {
                let diff = logits[0] - target;
                (0.5 * diff * diff, vec![diff])
            }
        }
    }

    /// Class probabilities in ascending class order, or `None` for
    /// regression.
    pub fn probabilities(&self, logits: &[f64]) -> Option<Vec<f64>> {
        match self {
            Head::Binary => {
                let p = sigmoid(logits[0]);
                Some(vec![1.0 - p, p])
            }
            Head::MultiClass { .. } => Some(softmax(logits)),
            Head::Regression => None,
        }
    }

    /// Point estimate. Classifiers pick the most probable class, the lower
    /// index winning ties.
    pub fn predict(&self, logits: &[f64]) -> Value {
        match self.probabilities(logits) {
            Some(probs) => {
                let mut best = 0;
                for (k, p) in probs.iter().enumerate() {
                    if *p > probs[best] {
                        best = k;
                    }
                }
                Value::Int(best as i64)
            }
            None => Value::Float(logits[0]),
        }
    }
}

fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}
