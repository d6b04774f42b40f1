//! Fully-connected feed-forward network with ReLU hidden layers.

use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow, bail};
use tracing::{debug, trace};

use super::{Architecture, Estimator};
use super::export::{SavedModel, Variable, Variables, write_saved_model};
use super::head::Head;
use super::layout::InputLayout;
use super::optim::{Adagrad, LcgRng};
use crate::encoding::FeatureColumn;
use crate::input_fn::{ServingInputFn, TrainingInputFn};
use crate::table::Value;

const LEARNING_RATE: f64 = 0.05;

#[derive(Debug, Clone)]
struct Dense {
    inputs: usize,
    outputs: usize,
    /// Row-major `[inputs][outputs]`.
    kernel: Vec<f64>,
    bias: Vec<f64>,
}

impl Dense {
    fn new(inputs: usize, outputs: usize, rng: &mut LcgRng) -> Self {
        let kernel = (0..inputs * outputs).map(|_| rng.glorot(inputs, outputs)).collect();
        Self {
            inputs,
            outputs,
            kernel,
            bias: vec![0.0; outputs],
        }
    }

    fn forward(&self, x: &[f64]) -> Vec<f64> {
        let mut out = self.bias.clone();
        for (i, xi) in x.iter().enumerate() {
            if *xi == 0.0 {
                continue;
            }
            let row = &self.kernel[i * self.outputs..(i + 1) * self.outputs];
            for (o, w) in out.iter_mut().zip(row) {
                *o += xi * w;
            }
        }
        out
    }
}

/// Variable scope of layer `idx`; `last` is the logits layer.
fn layer_scope(idx: usize, last: usize) -> String {
    if idx == last {
        "dnn/logits".to_string()
    } else {
        format!("dnn/hiddenlayer_{idx}")
    }
}

#[derive(Debug, Clone)]
pub struct DnnEstimator {
    head: Head,
    layout: InputLayout,
    hidden_units: Vec<usize>,
    layers: Vec<Dense>,
    trained_steps: u64,
}

impl DnnEstimator {
    /// Build an untrained network. Every categorical column must already be
    /// densified into a one-hot block.
    pub fn new(head: Head, columns: Vec<FeatureColumn>, hidden_units: &[usize], seed: i64) -> Result<Self> {
        let layout = InputLayout::new(columns);
        if !layout.is_dense() {
            bail!("DNN estimators require dense input; wrap sparse columns in one-hot");
        }
        if hidden_units.contains(&0) {
            bail!("hidden layer sizes must be positive, got {hidden_units:?}");
        }

        let mut rng = LcgRng::new(seed);
        let mut layers = Vec::with_capacity(hidden_units.len() + 1);
        let mut inputs = layout.width();
        for &units in hidden_units.iter().chain(std::iter::once(&head.logits_dim())) {
            layers.push(Dense::new(inputs, units, &mut rng));
            inputs = units;
        }

        Ok(Self {
            head,
            layout,
            hidden_units: hidden_units.to_vec(),
            layers,
            trained_steps: 0,
        })
    }

    /// Activations of every layer, input first. Hidden layers are ReLU'd;
    /// the last entry holds the raw logits.
    fn activations(&self, x: Vec<f64>) -> Vec<Vec<f64>> {
        let mut acts = Vec::with_capacity(self.layers.len() + 1);
        acts.push(x);
        let last = self.layers.len() - 1;
        for (idx, layer) in self.layers.iter().enumerate() {
            let mut z = layer.forward(&acts[idx]);
            if idx < last {
                z.iter_mut().for_each(|v| *v = v.max(0.0));
            }
            acts.push(z);
        }
        acts
    }

    fn logits(&self, x: Vec<f64>) -> Vec<f64> {
        self.activations(x).pop().unwrap_or_default()
    }

    fn inputs(&self, input_fn: &TrainingInputFn) -> Result<Vec<Vec<f64>>> {
        let batch = input_fn.invoke()?;
        Ok(self.layout.dense_rows(&batch.features)?)
    }

    /// Rebuild a trained network from its exported description and
    /// variables. Layer shapes follow `hidden_units` and must match the
    /// stored tensors exactly.
    pub fn restore(model: &SavedModel, variables: &Variables) -> Result<Self> {
        if model.architecture != Architecture::Dnn {
            bail!("`{}` is not a DNN export", model.estimator);
        }
        let mut restored = Self::new(model.head, model.feature_columns.clone(), &model.hidden_units, 0)?;
        let last = restored.layers.len() - 1;
        for (idx, layer) in restored.layers.iter_mut().enumerate() {
            let scope = layer_scope(idx, last);
            layer.kernel = variables
                .values(&format!("{scope}/kernel"), &[layer.inputs, layer.outputs])?
                .to_vec();
            layer.bias = variables
                .values(&format!("{scope}/bias"), &[layer.outputs])?
                .to_vec();
        }
        if variables.tensors.len() != 2 * restored.layers.len() {
            bail!(
                "DNN export holds {} variables, expected {} for hidden units {:?}",
                variables.tensors.len(),
                2 * restored.layers.len(),
                model.hidden_units
            );
        }
        restored.trained_steps = model.global_step;
        Ok(restored)
    }

    pub fn parameters(&self) -> Vec<f64> {
        self.layers
            .iter()
            .flat_map(|l| l.kernel.iter().chain(&l.bias).copied())
            .collect()
    }
}

impl Estimator for DnnEstimator {
    fn name(&self) -> String {
        format!("DNN{}", self.head.estimator_suffix())
    }

    fn fit(&mut self, input_fn: &TrainingInputFn, steps: u64) -> Result<()> {
        let batch = input_fn.invoke()?;
        let inputs = self.layout.dense_rows(&batch.features)?;
        let targets = self.head.targets(&batch.label)?;
        if inputs.is_empty() {
            bail!("cannot fit {} on an empty dataset", self.name());
        }
        let n = inputs.len() as f64;
        let mut kernel_opts: Vec<Adagrad> = self
            .layers
            .iter()
            .map(|l| Adagrad::new(LEARNING_RATE, l.kernel.len()))
            .collect();
        let mut bias_opts: Vec<Adagrad> = self
            .layers
            .iter()
            .map(|l| Adagrad::new(LEARNING_RATE, l.bias.len()))
            .collect();

        for step in 0..steps {
            let mut kernel_grads: Vec<Vec<f64>> =
                self.layers.iter().map(|l| vec![0.0; l.kernel.len()]).collect();
            let mut bias_grads: Vec<Vec<f64>> =
                self.layers.iter().map(|l| vec![0.0; l.bias.len()]).collect();
            let mut loss = 0.0;

            for (x, &target) in inputs.iter().zip(&targets) {
                let acts = self.activations(x.clone());
                let logits = acts.last().ok_or_else(|| anyhow!("network has no layers"))?;
                let (row_loss, mut delta) = self.head.loss_and_gradient(logits, target);
                loss += row_loss;

                for (idx, layer) in self.layers.iter().enumerate().rev() {
                    let input = &acts[idx];
                    for (i, xi) in input.iter().enumerate() {
                        if *xi == 0.0 {
                            continue;
                        }
                        for (o, d) in delta.iter().enumerate() {
                            kernel_grads[idx][i * layer.outputs + o] += xi * d / n;
                        }
                    }
                    for (b, d) in bias_grads[idx].iter_mut().zip(&delta) {
                        *b += d / n;
                    }
                    if idx == 0 {
                        break;
                    }
                    // Propagate through the kernel, then through the ReLU
                    // that produced this layer's input.
                    delta = (0..layer.inputs)
                        .map(|i| {
                            if input[i] <= 0.0 {
                                return 0.0;
                            }
                            let row = &layer.kernel[i * layer.outputs..(i + 1) * layer.outputs];
                            row.iter().zip(&delta).map(|(w, d)| w * d).sum()
                        })
                        .collect();
                }
            }

            for (idx, layer) in self.layers.iter_mut().enumerate() {
                kernel_opts[idx].step(&mut layer.kernel, &kernel_grads[idx]);
                bias_opts[idx].step(&mut layer.bias, &bias_grads[idx]);
            }
            if step % 100 == 0 {
                trace!(step, loss = loss / n, "dnn training step");
            }
        }

        self.trained_steps += steps;
        debug!(
            estimator = %self.name(),
            steps = self.trained_steps,
            hidden_units = ?self.hidden_units,
            "dnn training finished"
        );
        Ok(())
    }

    fn predict(&self, input_fn: &TrainingInputFn) -> Result<Vec<Value>> {
        Ok(self
            .inputs(input_fn)?
            .into_iter()
            .map(|x| self.head.predict(&self.logits(x)))
            .collect())
    }

    fn predict_probabilities(&self, input_fn: &TrainingInputFn) -> Result<Vec<Vec<f64>>> {
        if self.head.n_classes().is_none() {
            bail!("{} does not produce class probabilities", self.name());
        }
        self.inputs(input_fn)?
            .into_iter()
            .map(|x| {
                self.head
                    .probabilities(&self.logits(x))
                    .ok_or_else(|| anyhow!("missing class probabilities"))
            })
            .collect()
    }

    fn export(&self, export_dir_base: &Path, serving_input_fn: &ServingInputFn) -> Result<PathBuf> {
        let model = SavedModel::new(
            self.name(),
            Architecture::Dnn,
            self.head,
            self.layout.columns().to_vec(),
            self.hidden_units.clone(),
            self.trained_steps,
            serving_input_fn,
        )?;

        let mut variables = Variables::default();
        let last = self.layers.len() - 1;
        for (idx, layer) in self.layers.iter().enumerate() {
            let scope = layer_scope(idx, last);
            variables.insert(
                format!("{scope}/kernel"),
                Variable::new(vec![layer.inputs, layer.outputs], layer.kernel.clone()),
            );
            variables.insert(
                format!("{scope}/bias"),
                Variable::new(vec![layer.outputs], layer.bias.clone()),
            );
        }
        write_saved_model(export_dir_base, &model, &variables)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::encoding::{InputDensity, build_encodings, feature_columns};
    use crate::estimator::export::{read_saved_model, read_variables};
    use crate::input_fn::InputFnPair;
    use crate::roles::{LabelKind, RoleSpec, classify};
    use crate::table::{Column, Table};

    fn iris_like() -> (InputFnPair, Vec<FeatureColumn>) {
        let mut table = Table::from_columns(vec![
            (
                "Petal.Length".to_string(),
                Column::Float(vec![1.4, 1.3, 4.7, 4.5, 6.0, 5.9, 1.5, 4.4, 6.1]),
            ),
            (
                "Species".to_string(),
                Column::Str(
                    [
                        "setosa", "setosa", "versicolor", "versicolor", "virginica", "virginica",
                        "setosa", "versicolor", "virginica",
                    ]
                    .into_iter()
                    .map(String::from)
                    .collect(),
                ),
            ),
        ])
        .expect("table");
        let roles = classify(
            &mut table,
            &RoleSpec {
                continuous: vec!["Petal.Length".into()],
                categorical: vec![],
                label: "Species".into(),
                label_kind: LabelKind::Classes {
                    vocabulary: vec!["setosa".into(), "versicolor".into(), "virginica".into()],
                },
            },
        )
        .expect("classify");
        let encodings = build_encodings(&table, &roles).expect("encode");
        let columns = feature_columns(&encodings, InputDensity::Dense);
        (InputFnPair::new(table, roles).expect("pair"), columns)
    }

    #[test]
    fn test_rejects_sparse_columns() {
        let (_, columns) = iris_like();
        let sparse = vec![FeatureColumn::SparseWithKeys(crate::encoding::SparseWithKeys {
            column: "c".into(),
            dtype: crate::table::DType::String,
            vocabulary: vec!["a".into()],
        })];
        assert!(DnnEstimator::new(Head::Binary, sparse, &[4], 1).is_err());
        assert!(DnnEstimator::new(Head::Binary, columns, &[0], 1).is_err());
    }

    #[test]
    fn test_same_seed_same_model() {
        let (pair, columns) = iris_like();
        let head = Head::MultiClass { n_classes: 3 };
        let mut a = DnnEstimator::new(head, columns.clone(), &[5], 42).unwrap();
        let mut b = DnnEstimator::new(head, columns, &[5], 42).unwrap();
        a.fit(pair.training(), 20).unwrap();
        b.fit(pair.training(), 20).unwrap();
        assert_eq!(a.parameters(), b.parameters());
        assert_eq!(
            a.predict_probabilities(pair.training()).unwrap(),
            b.predict_probabilities(pair.training()).unwrap()
        );
    }

    #[test]
    fn test_multiclass_outputs_three_probabilities_per_row() {
        let (pair, columns) = iris_like();
        let mut model =
            DnnEstimator::new(Head::MultiClass { n_classes: 3 }, columns, &[11], 3).unwrap();
        model.fit(pair.training(), 50).unwrap();

        let probs = model.predict_probabilities(pair.training()).unwrap();
        assert_eq!(probs.len(), 9);
        for row in &probs {
            assert_eq!(row.len(), 3);
            assert!((row.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        }
        let preds = model.predict(pair.training()).unwrap();
        assert!(preds.iter().all(|p| matches!(p, Value::Int(0..=2))));
    }

    #[test]
    fn test_export_writes_layers() {
        let (pair, columns) = iris_like();
        let model = DnnEstimator::new(Head::MultiClass { n_classes: 3 }, columns, &[4, 2], 9).unwrap();
        let tmp = tempdir().unwrap();
        let dir = model.export(tmp.path(), pair.serving()).unwrap();

        let saved = read_saved_model(&dir).unwrap();
        assert_eq!(saved.estimator, "DNNClassifier");
        assert_eq!(saved.hidden_units, vec![4, 2]);

        let vars = read_variables(&dir).unwrap();
        assert_eq!(vars.tensors["dnn/hiddenlayer_0/kernel"].shape, vec![1, 4]);
        assert_eq!(vars.tensors["dnn/hiddenlayer_1/kernel"].shape, vec![4, 2]);
        assert_eq!(vars.tensors["dnn/logits/kernel"].shape, vec![2, 3]);
    }

    #[test]
    fn test_restore_reproduces_probabilities() {
        let (pair, columns) = iris_like();
        let mut model =
            DnnEstimator::new(Head::MultiClass { n_classes: 3 }, columns, &[6, 4], 5).unwrap();
        model.fit(pair.training(), 40).unwrap();
        let tmp = tempdir().unwrap();
        let dir = model.export(tmp.path(), pair.serving()).unwrap();

        let restored =
            DnnEstimator::restore(&read_saved_model(&dir).unwrap(), &read_variables(&dir).unwrap())
                .unwrap();
        assert_eq!(restored.hidden_units, vec![6, 4]);
        assert_eq!(restored.trained_steps, 40);
        assert_eq!(restored.parameters(), model.parameters());
        assert_eq!(
            restored.predict_probabilities(pair.training()).unwrap(),
            model.predict_probabilities(pair.training()).unwrap()
        );
    }

    #[test]
    fn test_restore_rejects_layer_mismatch() {
        let (pair, columns) = iris_like();
        let model = DnnEstimator::new(Head::MultiClass { n_classes: 3 }, columns, &[4, 2], 9).unwrap();
        let tmp = tempdir().unwrap();
        let dir = model.export(tmp.path(), pair.serving()).unwrap();
        let saved = read_saved_model(&dir).unwrap();
        let variables = read_variables(&dir).unwrap();

        let mut fewer = saved.clone();
        fewer.hidden_units = vec![4];
        assert!(DnnEstimator::restore(&fewer, &variables).is_err());

        let mut wider = saved.clone();
        wider.hidden_units = vec![5, 2];
        assert!(DnnEstimator::restore(&wider, &variables).is_err());

        let mut missing = variables.clone();
        missing.tensors.remove("dnn/logits/bias");
        assert!(DnnEstimator::restore(&saved, &missing).is_err());

        let mut as_linear = saved;
        as_linear.architecture = Architecture::Linear;
        assert!(DnnEstimator::restore(&as_linear, &variables).is_err());
    }
}
