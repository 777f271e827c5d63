// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Warm-started logistic-regression sweeps over a regularisation grid.

use super::features::extract_features;
use super::logistic::LogisticRegression;
use super::{accuracy_percent, count_correct, Encoder, FeatureMode};
use crate::dataset::loader::DataLoader;
use crate::{ContinualError, Result};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use std::collections::BTreeSet;
use tracing::{debug, info, info_span};

const STD_EPS: f64 = 1e-8;

/// `num` points spaced evenly on a log10 scale from `10^start` to `10^end`.
pub fn logspace(start: f64, end: f64, num: usize) -> Vec<f64> {
    match num {
        0 => Vec::new(),
        1 => vec![10f64.powf(start)],
        _ => {
            let step = (end - start) / (num - 1) as f64;
            (0..num)
                .map(|i| 10f64.powf(start + step * i as f64))
                .collect()
        }
    }
}

/// Per-feature affine standardisation fitted on one split.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureStandardizer {
    mean: Array1<f64>,
    std: Array1<f64>,
}

impl FeatureStandardizer {
    /// Column means and standard deviations of `reference`; deviations are
    /// floored at `1e-8`.
    pub fn fit(reference: ArrayView2<'_, f32>) -> Result<Self> {
        if reference.nrows() == 0 {
            return Err(ContinualError::empty_split("standardizer reference"));
        }
        let wide = reference.mapv(f64::from);
        let n = wide.nrows() as f64;
        let mean = wide.sum_axis(Axis(0)) / n;
        let centered = &wide - &mean;
        let std = (centered.mapv(|v| v * v).sum_axis(Axis(0)) / n).mapv(|v| v.sqrt().max(STD_EPS));
        Ok(Self { mean, std })
    }

    pub fn mean(&self) -> &Array1<f64> {
        &self.mean
    }

    pub fn std(&self) -> &Array1<f64> {
        &self.std
    }

    pub fn transform(&self, features: ArrayView2<'_, f32>) -> Result<Array2<f64>> {
        if features.ncols() != self.mean.len() {
            return Err(ContinualError::Shape(format!(
                "standardizer fitted on {} features, got {}",
                self.mean.len(),
                features.ncols()
            )));
        }
        Ok((features.mapv(f64::from) - &self.mean) / &self.std)
    }
}

/// Standardises every split with statistics from `features[reference]`.
pub fn normalize_features(features: &[Array2<f32>], reference: usize) -> Result<Vec<Array2<f64>>> {
    let base = features.get(reference).ok_or_else(|| {
        ContinualError::InvalidArgument(format!(
            "reference split {reference} out of {} splits",
            features.len()
        ))
    })?;
    let scaler = FeatureStandardizer::fit(base.view())?;
    features
        .iter()
        .map(|split| scaler.transform(split.view()))
        .collect()
}

#[derive(Clone, Debug, PartialEq)]
pub struct SweepConfig {
    pub num_cs: usize,
    /// log10 of the first `C`.
    pub start_c: f64,
    /// log10 of the last `C`.
    pub end_c: f64,
    pub max_iter: usize,
    pub random_state: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            num_cs: 10,
            start_c: -7.0,
            end_c: 2.0,
            max_iter: 200,
            random_state: 0,
        }
    }
}

/// Accuracies (percent) of every evaluated split at one `C`.
#[derive(Clone, Debug, PartialEq)]
pub struct SweepRow {
    pub c: f64,
    /// `train/acc` for the training split, `test_acc/<name>` for the others.
    pub accuracies: Vec<(String, f64)>,
}

impl SweepRow {
    pub fn get(&self, key: &str) -> Option<f64> {
        self.accuracies
            .iter()
            .find_map(|(name, acc)| (name == key).then_some(*acc))
    }
}

#[derive(Clone, Debug)]
pub struct SweepOutcome {
    /// Snapshot of the model at the winning `C`.
    pub model: LogisticRegression,
    pub best_c: f64,
    pub best_index: usize,
    pub rows: Vec<SweepRow>,
}

impl SweepOutcome {
    pub fn best_row(&self) -> &SweepRow {
        &self.rows[self.best_index]
    }
}

fn split_key(index: usize, train_index: usize, names: &[&str]) -> String {
    if index == train_index {
        "train/acc".to_string()
    } else {
        format!("test_acc/{}", names[index])
    }
}

/// Fits one warm-started model per `C` on `features[train_index]`, scores the
/// `eval_indices` splits after each fit and keeps the model with the best
/// accuracy on `val_index` (first one wins on ties).
pub fn warm_start_sweep(
    features: &[Array2<f64>],
    labels: &[Vec<usize>],
    train_index: usize,
    eval_indices: &[usize],
    val_index: usize,
    names: &[&str],
    config: &SweepConfig,
) -> Result<SweepOutcome> {
    if features.len() != labels.len() || features.len() != names.len() {
        return Err(ContinualError::Shape(format!(
            "{} feature splits, {} label splits, {} names",
            features.len(),
            labels.len(),
            names.len()
        )));
    }
    let in_range = |idx: usize| idx < features.len();
    if !in_range(train_index) || !in_range(val_index) || !eval_indices.iter().all(|&i| in_range(i)) {
        return Err(ContinualError::InvalidArgument(
            "sweep split index out of range".into(),
        ));
    }
    if !eval_indices.contains(&val_index) {
        return Err(ContinualError::InvalidArgument(format!(
            "validation split {val_index} is not evaluated"
        )));
    }
    if config.num_cs == 0 {
        return Err(ContinualError::InvalidArgument("num_cs must be > 0".into()));
    }

    let span = info_span!("logreg_sweep", num_cs = config.num_cs, random_state = config.random_state);
    let _guard = span.enter();

    let mut clf = LogisticRegression::new(1.0)
        .with_max_iter(config.max_iter)
        .with_warm_start(true);
    let mut rows = Vec::with_capacity(config.num_cs);
    let mut best: Option<(f64, LogisticRegression, f64, usize)> = None;
    let mut best_acc = -1.0;

    for (index, c) in logspace(config.start_c, config.end_c, config.num_cs)
        .into_iter()
        .enumerate()
    {
        clf.c = c;
        clf.fit(features[train_index].view(), &labels[train_index])?;
        let mut accuracies = Vec::with_capacity(eval_indices.len());
        for &split in eval_indices {
            let preds = clf.predict(features[split].view())?;
            let acc = accuracy_percent(
                count_correct(&preds, &labels[split]),
                labels[split].len(),
                names[split],
            )?;
            if split == val_index && acc > best_acc {
                best_acc = acc;
                best = Some((acc, clf.clone(), c, index));
            }
            accuracies.push((split_key(split, train_index, names), acc));
        }
        debug!(c, ?accuracies, "sweep step");
        rows.push(SweepRow { c, accuracies });
    }

    let (val_acc, model, best_c, best_index) = best.ok_or_else(|| {
        ContinualError::InvalidArgument("sweep produced no validation accuracy".into())
    })?;
    info!(best_c, best_index, val_acc, "sweep finished");
    Ok(SweepOutcome {
        model,
        best_c,
        best_index,
        rows,
    })
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LogisticMonitorConfig {
    pub mode: FeatureMode,
    /// Fit on a prefix holding two classes and score a single test batch.
    pub debug: bool,
    pub sweep: SweepConfig,
}

/// Accuracies (percent) of the winning model and its `C`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LogisticReport {
    pub train_acc: f64,
    pub test_acc: f64,
    pub c: f64,
}

/// Fits the sweep on raw memory features, with the test split as validation.
pub fn logistic_monitor<E: Encoder + ?Sized>(
    encoder: &E,
    memory: &DataLoader,
    test: &DataLoader,
    config: &LogisticMonitorConfig,
) -> Result<LogisticReport> {
    let debug_mode = config.debug;
    let mut seen = BTreeSet::new();
    let train = extract_features(encoder, memory, config.mode, false, |batch, _| {
        seen.extend(batch.targets.iter().copied());
        debug_mode && seen.len() > 1
    })?;
    let test = extract_features(encoder, test, config.mode, false, |_, _| debug_mode)?;

    let normalized = normalize_features(&[train.features, test.features], 0)?;
    let labels = vec![train.labels, test.labels];
    let outcome = warm_start_sweep(
        &normalized,
        &labels,
        0,
        &[0, 1],
        1,
        &["train", "test"],
        &config.sweep,
    )?;
    let row = outcome.best_row();
    Ok(LogisticReport {
        train_acc: row.get("train/acc").unwrap_or_default(),
        test_acc: row.get("test_acc/test").unwrap_or_default(),
        c: row.c,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn logspace_matches_endpoints() {
        let cs = logspace(-7.0, 2.0, 10);
        assert_eq!(cs.len(), 10);
        assert!((cs[0] - 1e-7).abs() < 1e-18);
        assert!((cs[9] - 100.0).abs() < 1e-9);
        assert!((cs[1] / cs[0] - 10.0).abs() < 1e-9);
        assert_eq!(logspace(0.0, 1.0, 1), vec![1.0]);
    }

    #[test]
    fn standardizer_uses_reference_statistics_per_feature() {
        let reference = array![[1.0f32, 10.0], [3.0, 10.0]];
        let scaler = FeatureStandardizer::fit(reference.view()).unwrap();
        assert_eq!(scaler.mean().to_vec(), vec![2.0, 10.0]);
        let out = scaler.transform(array![[2.0f32, 10.0], [4.0, 11.0]].view()).unwrap();
        assert!(out[(0, 0)].abs() < 1e-12);
        assert!((out[(1, 0)] - 2.0).abs() < 1e-12);
        // zero-variance column is scaled by the floor, not divided by zero
        assert!(out[(1, 1)].is_finite());
        assert!(out[(1, 1)] > 1e6);
    }

    fn splits() -> (Vec<Array2<f64>>, Vec<Vec<usize>>) {
        let train = array![
            [1.0, 0.2],
            [1.2, -0.1],
            [0.9, 0.0],
            [-1.0, 0.1],
            [-1.1, -0.2],
            [-0.8, 0.0],
        ];
        let test = array![[1.1, 0.0], [-0.9, 0.1], [0.7, -0.3]];
        (vec![train, test], vec![vec![0, 0, 0, 1, 1, 1], vec![0, 1, 0]])
    }

    #[test]
    fn sweep_records_every_strength_and_is_reproducible() {
        let (features, labels) = splits();
        let config = SweepConfig {
            num_cs: 5,
            ..SweepConfig::default()
        };
        let run = || {
            warm_start_sweep(&features, &labels, 0, &[0, 1], 1, &["train", "test"], &config)
                .unwrap()
        };
        let first = run();
        let second = run();
        assert_eq!(first.rows.len(), 5);
        assert_eq!(first.rows, second.rows);
        assert_eq!(first.best_c, second.best_c);
        assert_eq!(first.best_index, second.best_index);
        let best = first.best_row();
        assert!(best.get("train/acc").is_some());
        assert_eq!(best.get("test_acc/test"), Some(100.0));
        assert_eq!(best.c, first.best_c);
    }

    #[test]
    fn sweep_rejects_an_unevaluated_validation_split() {
        let (features, labels) = splits();
        let err = warm_start_sweep(
            &features,
            &labels,
            0,
            &[0],
            1,
            &["train", "test"],
            &SweepConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ContinualError::InvalidArgument(_)));
    }
}
