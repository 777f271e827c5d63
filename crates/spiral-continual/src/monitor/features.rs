// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::{checked_forward, Encoder, FeatureMode};
use crate::dataset::loader::{Batch, DataLoader};
use crate::{ContinualError, Result};
use ndarray::{concatenate, Array2, ArrayView2, Axis};
use tracing::debug;

const NORM_EPS: f32 = 1e-12;

/// Divides every row by its L2 norm (floored at `1e-12`).
pub fn l2_normalize_rows(features: &mut Array2<f32>) {
    for mut row in features.rows_mut() {
        let norm = row
            .iter()
            .map(|v| (*v as f64).powi(2))
            .sum::<f64>()
            .sqrt() as f32;
        let denom = norm.max(NORM_EPS);
        row.mapv_inplace(|v| v / denom);
    }
}

/// Encoder outputs stacked in loader order with their labels.
#[derive(Clone, Debug, PartialEq)]
pub struct ExtractedFeatures {
    pub features: Array2<f32>,
    pub labels: Vec<usize>,
}

impl ExtractedFeatures {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Runs `encoder` over `loader`, optionally L2-normalizing each batch, until
/// the loader is exhausted or `stop` returns `true` after a batch.
pub fn extract_features<E, F>(
    encoder: &E,
    loader: &DataLoader,
    mode: FeatureMode,
    normalize: bool,
    mut stop: F,
) -> Result<ExtractedFeatures>
where
    E: Encoder + ?Sized,
    F: FnMut(&Batch, usize) -> bool,
{
    let mut chunks: Vec<Array2<f32>> = Vec::new();
    let mut labels: Vec<usize> = Vec::new();
    for batch in loader {
        let mut features = checked_forward(encoder, &batch.inputs, mode)?;
        if normalize {
            l2_normalize_rows(&mut features);
        }
        if let Some(first) = chunks.first() {
            if first.ncols() != features.ncols() {
                return Err(ContinualError::Shape(format!(
                    "encoder emitted {} features after {} on an earlier batch",
                    features.ncols(),
                    first.ncols()
                )));
            }
        }
        labels.extend_from_slice(&batch.targets);
        chunks.push(features);
        if stop(&batch, labels.len()) {
            break;
        }
    }
    if chunks.is_empty() {
        return Err(ContinualError::empty_split("feature extraction"));
    }
    let views: Vec<ArrayView2<'_, f32>> = chunks.iter().map(|c| c.view()).collect();
    let features =
        concatenate(Axis(0), &views).map_err(|err| ContinualError::Shape(err.to_string()))?;
    Ok(ExtractedFeatures { features, labels })
}

/// Reference set for similarity search: normalized features laid out as
/// `(dim, samples)` with column `j` belonging to `labels[j]`.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureBank {
    features: Array2<f32>,
    labels: Vec<usize>,
}

impl FeatureBank {
    /// Wraps an already transposed `(dim, samples)` matrix.
    pub fn new(features: Array2<f32>, labels: Vec<usize>) -> Result<Self> {
        if features.ncols() != labels.len() {
            return Err(ContinualError::Shape(format!(
                "feature bank has {} columns but {} labels",
                features.ncols(),
                labels.len()
            )));
        }
        if labels.is_empty() {
            return Err(ContinualError::empty_split("feature bank"));
        }
        Ok(Self { features, labels })
    }

    /// Builds a bank from row-major `(samples, dim)` features.
    pub fn from_rows(rows: Array2<f32>, labels: Vec<usize>) -> Result<Self> {
        let transposed = rows.reversed_axes().as_standard_layout().into_owned();
        Self::new(transposed, labels)
    }

    pub fn dim(&self) -> usize {
        self.features.nrows()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn features(&self) -> &Array2<f32> {
        &self.features
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }
}

/// Builds a [`FeatureBank`] from a memory loader.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeatureBankBuilder {
    mode: FeatureMode,
    sample_limit: Option<usize>,
}

impl FeatureBankBuilder {
    pub fn new(mode: FeatureMode) -> Self {
        Self {
            mode,
            sample_limit: None,
        }
    }

    /// Stops once more than `limit` samples were collected. The bank is then a
    /// prefix of the memory set.
    pub fn with_sample_limit(mut self, limit: usize) -> Self {
        self.sample_limit = Some(limit);
        self
    }

    pub fn build<E: Encoder + ?Sized>(&self, encoder: &E, loader: &DataLoader) -> Result<FeatureBank> {
        let limit = self.sample_limit;
        let extracted = extract_features(encoder, loader, self.mode, true, |_, collected| {
            limit.map_or(false, |limit| collected > limit)
        })?;
        debug!(
            samples = extracted.len(),
            dim = extracted.features.ncols(),
            truncated = extracted.len() < loader.len(),
            "feature bank built"
        );
        FeatureBank::from_rows(extracted.features, extracted.labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Shard;
    use crate::registry::IdentityEncoder;
    use ndarray::array;

    fn loader() -> DataLoader {
        let shard = Shard::new(
            array![[3.0, 4.0], [0.0, 2.0], [1.0, 0.0], [0.0, 0.0], [6.0, 8.0]],
            vec![0, 1, 0, 1, 0],
        )
        .unwrap();
        DataLoader::new(shard).batched(2)
    }

    #[test]
    fn bank_is_transposed_normalized_and_aligned() {
        let bank = FeatureBankBuilder::new(FeatureMode::Features)
            .build(&IdentityEncoder, &loader())
            .unwrap();
        assert_eq!(bank.dim(), 2);
        assert_eq!(bank.len(), 5);
        assert_eq!(bank.labels(), &[0, 1, 0, 1, 0]);
        let col = bank.features().column(0);
        assert!((col[0] - 0.6).abs() < 1e-6);
        assert!((col[1] - 0.8).abs() < 1e-6);
        // zero rows stay finite
        assert!(bank.features().column(3).iter().all(|v| v.is_finite()));
    }

    #[test]
    fn sample_limit_truncates_to_a_prefix() {
        let bank = FeatureBankBuilder::new(FeatureMode::Features)
            .with_sample_limit(2)
            .build(&IdentityEncoder, &loader())
            .unwrap();
        assert_eq!(bank.len(), 4);
        assert_eq!(bank.labels(), &[0, 1, 0, 1]);
    }

    #[test]
    fn empty_loader_cannot_build_a_bank() {
        let empty = DataLoader::new(Shard::new(Array2::zeros((0, 2)), vec![]).unwrap());
        let err = FeatureBankBuilder::new(FeatureMode::Features)
            .build(&IdentityEncoder, &empty)
            .unwrap_err();
        assert!(matches!(err, ContinualError::EmptySplit { .. }));
    }
}
