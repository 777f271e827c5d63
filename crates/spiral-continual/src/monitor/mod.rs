// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Representation-quality monitors run on a frozen encoder.

pub mod features;
pub mod knn;
pub mod logistic;
pub mod masking;
pub mod probe;
pub mod sweep;

use crate::{ContinualError, Result};
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

/// Which head of the backbone a forward pass should read.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureMode {
    /// Classification logits (the default forward).
    #[default]
    Logits,
    /// Penultimate features.
    Features,
}

impl FeatureMode {
    /// Continual-default backbones carry a classifier and must be asked for
    /// their features explicitly.
    pub fn from_cl_default(cl_default: bool) -> Self {
        if cl_default {
            FeatureMode::Features
        } else {
            FeatureMode::Logits
        }
    }
}

/// Frozen backbone mapping a batch of samples (rows) to output rows.
///
/// Monitors only ever borrow the encoder immutably, so no parameter can be
/// updated while features are extracted.
pub trait Encoder {
    fn forward(&self, inputs: &Array2<f32>, mode: FeatureMode) -> Result<Array2<f32>>;
}

impl<E: Encoder + ?Sized> Encoder for &E {
    fn forward(&self, inputs: &Array2<f32>, mode: FeatureMode) -> Result<Array2<f32>> {
        (**self).forward(inputs, mode)
    }
}

impl<E: Encoder + ?Sized> Encoder for Box<E> {
    fn forward(&self, inputs: &Array2<f32>, mode: FeatureMode) -> Result<Array2<f32>> {
        (**self).forward(inputs, mode)
    }
}

pub(crate) fn checked_forward<E: Encoder + ?Sized>(
    encoder: &E,
    inputs: &Array2<f32>,
    mode: FeatureMode,
) -> Result<Array2<f32>> {
    let out = encoder.forward(inputs, mode)?;
    if out.nrows() != inputs.nrows() {
        return Err(ContinualError::Shape(format!(
            "encoder returned {} rows for a batch of {}",
            out.nrows(),
            inputs.nrows()
        )));
    }
    Ok(out)
}

/// Index of the first maximum in every row.
pub fn argmax_rows(scores: ArrayView2<'_, f32>) -> Vec<usize> {
    scores
        .rows()
        .into_iter()
        .map(|row| {
            let mut best = 0usize;
            let mut best_value = f32::NEG_INFINITY;
            for (idx, &value) in row.iter().enumerate() {
                if value > best_value {
                    best = idx;
                    best_value = value;
                }
            }
            best
        })
        .collect()
}

/// `correct / total * 100`, refusing to divide by an empty split.
pub fn accuracy_percent(correct: usize, total: usize, split: &str) -> Result<f64> {
    if total == 0 {
        return Err(ContinualError::empty_split(split));
    }
    Ok(correct as f64 / total as f64 * 100.0)
}

pub(crate) fn count_correct(predictions: &[usize], targets: &[usize]) -> usize {
    predictions
        .iter()
        .zip(targets)
        .filter(|(pred, target)| pred == target)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn argmax_prefers_the_first_maximum() {
        let scores = array![[0.1, 0.7, 0.7], [2.0, -1.0, 0.0]];
        assert_eq!(argmax_rows(scores.view()), vec![1, 0]);
    }

    #[test]
    fn empty_split_accuracy_is_an_error() {
        assert_eq!(
            accuracy_percent(0, 0, "test").unwrap_err(),
            ContinualError::EmptySplit {
                split: "test".to_string()
            }
        );
        assert!((accuracy_percent(3, 4, "test").unwrap() - 75.0).abs() < 1e-12);
    }
}
