// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Linear probe trained with Nesterov SGD on frozen, normalized features.

use super::features::{extract_features, ExtractedFeatures};
use super::masking::{EvalProtocol, TaskDescriptor};
use super::{accuracy_percent, argmax_rows, count_correct, Encoder, FeatureMode};
use crate::dataset::loader::DataLoader;
use crate::{ContinualError, Result};
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::Rng;
use spiral_config::determinism;
use tracing::{debug, info, warn};

#[derive(Clone, Debug, PartialEq)]
pub struct ProbeConfig {
    /// Hard ceiling on training passes over the memory split.
    pub max_passes: usize,
    /// Converged once a pass's mean loss is this close to the best so far.
    pub tolerance: f32,
    /// Learning rate for a batch of 256; scaled linearly with batch size.
    pub base_lr: f32,
    pub momentum: f32,
    pub nesterov: bool,
    pub mode: FeatureMode,
    pub seed: Option<u64>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            max_passes: 100,
            tolerance: 1e-2,
            base_lr: 0.1,
            momentum: 0.9,
            nesterov: true,
            mode: FeatureMode::default(),
            seed: None,
        }
    }
}

impl ProbeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_passes == 0 {
            return Err(ContinualError::InvalidArgument(
                "probe max_passes must be > 0".into(),
            ));
        }
        if self.base_lr.is_nan() || self.base_lr <= 0.0 {
            return Err(ContinualError::InvalidArgument(format!(
                "probe base_lr must be > 0 (got {})",
                self.base_lr
            )));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(ContinualError::InvalidArgument(format!(
                "probe momentum must lie in [0, 1) (got {})",
                self.momentum
            )));
        }
        Ok(())
    }
}

/// Single affine layer `x·W + b` with SGD momentum buffers.
#[derive(Clone, Debug, PartialEq)]
pub struct LinearProbe {
    weight: Array2<f32>,
    bias: Array1<f32>,
    weight_velocity: Array2<f32>,
    bias_velocity: Array1<f32>,
}

impl LinearProbe {
    /// Uniform `±1/sqrt(input_dim)` initialisation.
    pub fn new(input_dim: usize, classes: usize, rng: &mut StdRng) -> Result<Self> {
        if input_dim == 0 || classes == 0 {
            return Err(ContinualError::InvalidArgument(format!(
                "probe needs a non-empty shape (input {input_dim}, classes {classes})"
            )));
        }
        let bound = 1.0 / (input_dim as f32).sqrt();
        let weight = Array2::from_shape_fn((input_dim, classes), |_| rng.gen_range(-bound..bound));
        let bias = Array1::from_shape_fn(classes, |_| rng.gen_range(-bound..bound));
        Ok(Self {
            weight_velocity: Array2::zeros(weight.dim()),
            bias_velocity: Array1::zeros(classes),
            weight,
            bias,
        })
    }

    pub fn input_dim(&self) -> usize {
        self.weight.nrows()
    }

    pub fn classes(&self) -> usize {
        self.weight.ncols()
    }

    pub fn forward(&self, x: ArrayView2<'_, f32>) -> Array2<f32> {
        x.dot(&self.weight) + &self.bias
    }

    pub fn predict(&self, x: ArrayView2<'_, f32>) -> Vec<usize> {
        argmax_rows(self.forward(x).view())
    }

    /// Mean cross-entropy of the current parameters, without an update.
    pub fn loss(&self, x: ArrayView2<'_, f32>, targets: &[usize]) -> f32 {
        let logits = self.forward(x);
        let total: f32 = logits
            .axis_iter(Axis(0))
            .zip(targets)
            .map(|(row, &target)| log_sum_exp(row) - row[target])
            .sum();
        total / targets.len().max(1) as f32
    }

    /// One SGD step on mean cross-entropy; returns the loss before the update.
    pub fn step(
        &mut self,
        x: ArrayView2<'_, f32>,
        targets: &[usize],
        lr: f32,
        momentum: f32,
        nesterov: bool,
    ) -> f32 {
        let n = targets.len().max(1) as f32;
        let mut grad = self.forward(x);
        let mut loss = 0.0f32;
        for (mut row, &target) in grad.axis_iter_mut(Axis(0)).zip(targets) {
            let lse = log_sum_exp(row.view());
            loss += lse - row[target];
            row.mapv_inplace(|z| (z - lse).exp());
            row[target] -= 1.0;
        }
        grad /= n;
        let grad_w = x.t().dot(&grad);
        let grad_b = grad.sum_axis(Axis(0));

        self.weight_velocity *= momentum;
        self.weight_velocity += &grad_w;
        self.bias_velocity *= momentum;
        self.bias_velocity += &grad_b;
        if nesterov {
            self.weight.scaled_add(-lr, &grad_w);
            self.weight.scaled_add(-lr * momentum, &self.weight_velocity);
            self.bias.scaled_add(-lr, &grad_b);
            self.bias.scaled_add(-lr * momentum, &self.bias_velocity);
        } else {
            self.weight.scaled_add(-lr, &self.weight_velocity);
            self.bias.scaled_add(-lr, &self.bias_velocity);
        }
        loss / n
    }
}

fn log_sum_exp(row: ArrayView1<'_, f32>) -> f32 {
    let peak = row.fold(f32::NEG_INFINITY, |acc, &z| acc.max(z));
    peak + row.iter().map(|&z| (z - peak).exp()).sum::<f32>().ln()
}

/// Outcome of one probe fit.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProbeReport {
    pub train_acc: f64,
    pub test_acc: f64,
    pub passes: usize,
    /// `false` when `max_passes` ran out; the best pass is reported instead.
    pub converged: bool,
    /// Mean memory-split loss of the returned probe, measured after its
    /// last update.
    pub final_loss: f32,
}

fn probe_targets(labels: &[usize], descriptor: &TaskDescriptor) -> Vec<usize> {
    match descriptor.protocol {
        EvalProtocol::TaskIncremental => labels
            .iter()
            .map(|label| label % descriptor.classes_per_task)
            .collect(),
        EvalProtocol::ClassIncremental => labels.to_vec(),
    }
}

fn probe_width(descriptor: &TaskDescriptor, targets: &[usize]) -> Result<usize> {
    let width = match descriptor.protocol {
        EvalProtocol::TaskIncremental => descriptor.classes_per_task,
        EvalProtocol::ClassIncremental => descriptor.seen_classes,
    };
    match targets.iter().max() {
        Some(&label) if label >= width => Err(ContinualError::InvalidArgument(format!(
            "label {label} does not fit a probe over {width} classes"
        ))),
        _ => Ok(width),
    }
}

fn probe_accuracy(
    probe: &LinearProbe,
    split: &ExtractedFeatures,
    targets: &[usize],
    name: &str,
) -> Result<f64> {
    let preds = probe.predict(split.features.view());
    accuracy_percent(count_correct(&preds, targets), targets.len(), name)
}

/// Trains a fresh probe on the memory split until the mean pass loss
/// plateaus, then scores it on the memory and test splits.
///
/// Under the task-incremental protocol labels are taken modulo
/// `classes_per_task`, so the probe only separates the current task's
/// classes.
pub fn probe_monitor<E: Encoder + ?Sized>(
    encoder: &E,
    descriptor: TaskDescriptor,
    memory: &DataLoader,
    test: &DataLoader,
    config: &ProbeConfig,
) -> Result<ProbeReport> {
    config.validate()?;
    // The encoder is frozen and the memory loader unshuffled, so one
    // extraction serves every pass.
    let train = extract_features(encoder, memory, config.mode, true, |_, _| false)?;
    let evaluation = extract_features(encoder, test, config.mode, true, |_, _| false)?;
    if evaluation.features.ncols() != train.features.ncols() {
        return Err(ContinualError::Shape(format!(
            "test features are {} wide, memory features {}",
            evaluation.features.ncols(),
            train.features.ncols()
        )));
    }
    let train_targets = probe_targets(&train.labels, &descriptor);
    let test_targets = probe_targets(&evaluation.labels, &descriptor);
    let classes = probe_width(&descriptor, &train_targets)?;
    probe_width(&descriptor, &test_targets)?;

    let mut rng = determinism::rng_from_optional(config.seed, "probe/init");
    let mut probe = LinearProbe::new(train.features.ncols(), classes, &mut rng)?;
    let batch = memory.batch_size();
    let lr = config.base_lr * batch as f32 / 256.0;
    let samples = train.len();

    let mut min_loss = f32::INFINITY;
    let mut best = probe.clone();
    let mut best_loss = f32::INFINITY;
    let mut fitted_loss = f32::INFINITY;
    let mut passes = 0;
    let mut converged = false;
    while passes < config.max_passes {
        let mut total = 0.0f32;
        for start in (0..samples).step_by(batch) {
            let end = (start + batch).min(samples);
            let loss = probe.step(
                train.features.slice(s![start..end, ..]),
                &train_targets[start..end],
                lr,
                config.momentum,
                config.nesterov,
            );
            total += loss * (end - start) as f32;
        }
        let avg_loss = total / samples as f32;
        passes += 1;
        fitted_loss = probe.loss(train.features.view(), &train_targets);
        debug!(pass = passes, avg_loss, fitted_loss, "probe pass");

        if fitted_loss < best_loss {
            best_loss = fitted_loss;
            best = probe.clone();
        }
        if (min_loss - avg_loss).abs() < config.tolerance {
            converged = true;
            break;
        }
        min_loss = min_loss.min(avg_loss);
    }

    if !converged {
        warn!(
            max_passes = config.max_passes,
            last_loss = fitted_loss,
            best_loss,
            "probe did not converge; keeping the best pass"
        );
        probe = best;
        fitted_loss = best_loss;
    }

    let report = ProbeReport {
        train_acc: probe_accuracy(&probe, &train, &train_targets, "probe train")?,
        test_acc: probe_accuracy(&probe, &evaluation, &test_targets, "probe test")?,
        passes,
        converged,
        final_loss: fitted_loss,
    };
    info!(
        passes,
        converged,
        train_acc = report.train_acc,
        test_acc = report.test_acc,
        "probe finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Shard;
    use crate::registry::IdentityEncoder;
    use rand::SeedableRng;

    fn loader(points: &[([f32; 2], usize)], batch: usize) -> DataLoader {
        let rows = points.iter().map(|(p, _)| p.to_vec()).collect();
        let labels = points.iter().map(|(_, l)| *l).collect();
        DataLoader::new(Shard::from_rows(rows, labels).unwrap()).batched(batch)
    }

    fn quadrants(offset: usize) -> Vec<([f32; 2], usize)> {
        let mut points = Vec::new();
        for i in 0..8 {
            let jitter = i as f32 * 0.05;
            points.push(([1.0, jitter], offset));
            points.push(([-1.0, jitter], offset + 1));
        }
        points
    }

    fn descriptor(protocol: EvalProtocol, seen: usize) -> TaskDescriptor {
        TaskDescriptor {
            seen_classes: seen,
            classes_per_task: 2,
            protocol,
        }
    }

    fn config() -> ProbeConfig {
        ProbeConfig {
            mode: FeatureMode::Features,
            seed: Some(3),
            base_lr: 25.6,
            ..ProbeConfig::default()
        }
    }

    #[test]
    fn probe_separates_two_clusters_and_is_reproducible() {
        let memory = loader(&quadrants(0), 4);
        let test = loader(&quadrants(0), 4);
        let d = descriptor(EvalProtocol::ClassIncremental, 2);
        let first = probe_monitor(&IdentityEncoder, d, &memory, &test, &config()).unwrap();
        let second = probe_monitor(&IdentityEncoder, d, &memory, &test, &config()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.test_acc, 100.0);
        assert_eq!(first.train_acc, 100.0);
    }

    #[test]
    fn task_incremental_probe_remaps_labels() {
        let memory = loader(&quadrants(2), 4);
        let test = loader(&quadrants(2), 4);
        let d = descriptor(EvalProtocol::TaskIncremental, 4);
        let report = probe_monitor(&IdentityEncoder, d, &memory, &test, &config()).unwrap();
        assert_eq!(report.test_acc, 100.0);

        let narrow = descriptor(EvalProtocol::ClassIncremental, 2);
        assert!(probe_monitor(&IdentityEncoder, narrow, &memory, &test, &config()).is_err());
    }

    #[test]
    fn pass_cap_bounds_training() {
        let memory = loader(&quadrants(0), 4);
        let cfg = ProbeConfig {
            max_passes: 1,
            ..config()
        };
        let d = descriptor(EvalProtocol::ClassIncremental, 2);
        let report = probe_monitor(&IdentityEncoder, d, &memory, &memory, &cfg).unwrap();
        assert_eq!(report.passes, 1);
        assert!(!report.converged);
        assert!(report.final_loss.is_finite());
    }

    #[test]
    fn pass_cap_keeps_the_lowest_loss_pass() {
        // identical inputs with alternating labels and a huge step: the logit
        // gap overshoots zero on every pass instead of settling
        let rows = vec![vec![1.0f32]; 4];
        let targets = [0, 1, 0, 1];
        let memory = DataLoader::new(Shard::from_rows(rows, targets.to_vec()).unwrap()).batched(4);
        let base = ProbeConfig {
            max_passes: 1,
            tolerance: 0.0,
            base_lr: 2560.0,
            momentum: 0.0,
            nesterov: false,
            mode: FeatureMode::Features,
            seed: Some(5),
        };

        let x = Array2::<f32>::ones((4, 1));
        let lr = base.base_lr * 4.0 / 256.0;
        let mut rng = determinism::rng_from_optional(base.seed, "probe/init");
        let mut replay = LinearProbe::new(1, 2, &mut rng).unwrap();
        let mut losses = Vec::new();
        for _ in 0..10 {
            replay.step(x.view(), &targets, lr, 0.0, false);
            losses.push(replay.loss(x.view(), &targets));
        }
        let lowest = |n: usize| losses[..n].iter().copied().fold(f32::INFINITY, f32::min);
        let cap = (2..=losses.len())
            .find(|&n| losses[n - 1] > lowest(n))
            .expect("the loss should oscillate");

        let cfg = ProbeConfig {
            max_passes: cap,
            ..base
        };
        let d = descriptor(EvalProtocol::ClassIncremental, 2);
        let report = probe_monitor(&IdentityEncoder, d, &memory, &memory, &cfg).unwrap();
        assert!(!report.converged);
        assert_eq!(report.passes, cap);
        assert!((report.final_loss - lowest(cap)).abs() < 1e-5);
        assert!(report.final_loss < losses[cap - 1]);
    }

    struct WidthByBatch;

    impl Encoder for WidthByBatch {
        fn forward(&self, inputs: &Array2<f32>, _mode: FeatureMode) -> Result<Array2<f32>> {
            let width = if inputs.nrows() == 4 { 3 } else { 2 };
            Ok(Array2::ones((inputs.nrows(), width)))
        }
    }

    #[test]
    fn split_width_mismatch_is_a_shape_error() {
        let memory = loader(&quadrants(0), 4);
        let test = loader(&quadrants(0), 8);
        let d = descriptor(EvalProtocol::ClassIncremental, 2);
        let err = probe_monitor(&WidthByBatch, d, &memory, &test, &config()).unwrap_err();
        assert!(matches!(err, ContinualError::Shape(_)));
    }

    #[test]
    fn loss_matches_the_pre_update_step_loss() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut probe = LinearProbe::new(2, 2, &mut rng).unwrap();
        let x = ndarray::array![[1.0f32, 0.5], [-1.0, 0.2]];
        let before = probe.loss(x.view(), &[0, 1]);
        assert!((probe.step(x.view(), &[0, 1], 0.1, 0.9, true) - before).abs() < 1e-6);
        assert!(probe.loss(x.view(), &[0, 1]) < before);
    }

    #[test]
    fn sgd_step_lowers_the_loss() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut probe = LinearProbe::new(2, 2, &mut rng).unwrap();
        let x = ndarray::array![[1.0f32, 0.0], [-1.0, 0.0]];
        let first = probe.step(x.view(), &[0, 1], 0.5, 0.9, true);
        let mut last = first;
        for _ in 0..20 {
            last = probe.step(x.view(), &[0, 1], 0.5, 0.9, true);
        }
        assert!(last < first);
        assert_eq!(probe.predict(x.view()), vec![0, 1]);
    }
}
