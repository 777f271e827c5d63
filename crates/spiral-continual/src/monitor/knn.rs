// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Weighted k-nearest-neighbour monitor (InstDisc style) over a feature bank.

use super::features::{l2_normalize_rows, FeatureBank, FeatureBankBuilder};
use super::masking::{EvalProtocol, TaskDescriptor, TaskMaskedScorer};
use super::{accuracy_percent, argmax_rows, checked_forward, count_correct, Encoder, FeatureMode};
use crate::dataset::loader::DataLoader;
use crate::{ContinualError, Result};
use ndarray::{Array2, ArrayView2};
use std::time::Instant;
use tracing::{debug, info_span};

/// Largest `k` entries of every row with their column indices, highest first.
/// Equal values keep their column order.
pub fn topk_rows(x: ArrayView2<'_, f32>, k: usize) -> (Array2<f32>, Array2<usize>) {
    let (rows, cols) = x.dim();
    let k = k.min(cols);
    let mut vals = Array2::<f32>::zeros((rows, k));
    let mut idxs = Array2::<usize>::zeros((rows, k));
    let by_score = |a: &(f32, usize), b: &(f32, usize)| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1));
    for r in 0..rows {
        let mut v: Vec<(f32, usize)> = x.row(r).iter().copied().zip(0..cols).collect();
        if k > 0 && k < cols {
            v.select_nth_unstable_by(k - 1, by_score);
            v.truncate(k);
        }
        v.sort_unstable_by(by_score);
        for t in 0..k {
            vals[(r, t)] = v[t].0;
            idxs[(r, t)] = v[t].1;
        }
    }
    (vals, idxs)
}

/// Scores `query` rows against `bank`.
///
/// `query` must already be L2-normalized so the dot product is a cosine
/// similarity. Each of the `k` most similar bank entries votes for its label
/// with weight `exp(sim / t)`; the result has shape `(batch, classes)`.
/// `k` is clamped to the bank size.
pub fn knn_predict(
    query: ArrayView2<'_, f32>,
    bank: &FeatureBank,
    classes: usize,
    k: usize,
    t: f32,
) -> Result<Array2<f32>> {
    if k == 0 {
        return Err(ContinualError::InvalidArgument("knn k must be > 0".into()));
    }
    if t.is_nan() || t <= 0.0 {
        return Err(ContinualError::InvalidArgument(format!(
            "knn temperature must be > 0 (got {t})"
        )));
    }
    if classes == 0 {
        return Err(ContinualError::InvalidArgument(
            "knn needs at least one class".into(),
        ));
    }
    if query.ncols() != bank.dim() {
        return Err(ContinualError::Shape(format!(
            "query dim {} does not match bank dim {}",
            query.ncols(),
            bank.dim()
        )));
    }
    if let Some(&label) = bank.labels().iter().find(|&&label| label >= classes) {
        return Err(ContinualError::InvalidArgument(format!(
            "bank label {label} is outside the {classes} scored classes"
        )));
    }

    let sim = query.dot(bank.features());
    let (weights, indices) = topk_rows(sim.view(), k);
    let labels = bank.labels();
    let mut scores = Array2::<f32>::zeros((query.nrows(), classes));
    for ((row, slot), &idx) in indices.indexed_iter() {
        let vote = (weights[(row, slot)] / t).exp();
        scores[(row, labels[idx])] += vote;
    }
    Ok(scores)
}

#[derive(Clone, Debug, PartialEq)]
pub struct KnnConfig {
    pub k: usize,
    pub t: f32,
    /// Width of the score matrix; defaults to the classes seen so far.
    pub num_classes: Option<usize>,
    pub mode: FeatureMode,
    /// Fast mode: small bank prefix and a single test batch.
    pub debug: bool,
    pub debug_bank_limit: usize,
}

impl Default for KnnConfig {
    fn default() -> Self {
        Self {
            k: 200,
            t: 0.1,
            num_classes: None,
            mode: FeatureMode::default(),
            debug: false,
            debug_bank_limit: 200,
        }
    }
}

/// Top-1 accuracies (percent) from one kNN pass.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct KnnAccuracy {
    pub top1: f64,
    /// Accuracy after restricting scores to `task_id`'s classes.
    pub top1_masked: f64,
    /// Number of test samples scored.
    pub evaluated: usize,
}

/// Builds a bank from `memory` and classifies `test` against it.
pub fn knn_monitor<E: Encoder + ?Sized>(
    encoder: &E,
    descriptor: TaskDescriptor,
    memory: &DataLoader,
    test: &DataLoader,
    task_id: usize,
    config: &KnnConfig,
) -> Result<KnnAccuracy> {
    let span = info_span!("knn_monitor", task_id, k = config.k);
    let _guard = span.enter();
    let started = Instant::now();

    let mut builder = FeatureBankBuilder::new(config.mode);
    if config.debug {
        builder = builder.with_sample_limit(config.debug_bank_limit);
    }
    let bank = builder.build(encoder, memory)?;
    let classes = config.num_classes.unwrap_or(descriptor.seen_classes);
    let scorer = TaskMaskedScorer::new(TaskDescriptor {
        protocol: EvalProtocol::TaskIncremental,
        ..descriptor
    });

    let (mut correct, mut correct_masked, mut total) = (0usize, 0usize, 0usize);
    for batch in test {
        let mut query = checked_forward(encoder, &batch.inputs, config.mode)?;
        l2_normalize_rows(&mut query);
        let mut scores = knn_predict(query.view(), &bank, classes, config.k, config.t)?;
        correct += count_correct(&argmax_rows(scores.view()), &batch.targets);
        scorer.apply(&mut scores, task_id);
        correct_masked += count_correct(&argmax_rows(scores.view()), &batch.targets);
        total += batch.len();
        if config.debug {
            break;
        }
    }

    let accuracy = KnnAccuracy {
        top1: accuracy_percent(correct, total, "knn test")?,
        top1_masked: accuracy_percent(correct_masked, total, "knn test")?,
        evaluated: total,
    };
    debug!(
        bank = bank.len(),
        evaluated = total,
        top1 = accuracy.top1,
        masked = accuracy.top1_masked,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "knn pass finished"
    );
    Ok(accuracy)
}
