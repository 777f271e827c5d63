// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Continual self-supervised learning harness: class-incremental task splits
//! and representation-quality monitors (weighted kNN over a feature bank,
//! logistic-regression sweeps and SGD linear probes).

pub mod config;
pub mod dataset;
pub mod evaluate;
pub mod metrics;
pub mod monitor;
pub mod registry;
pub mod run;

use thiserror::Error;

pub use config::RunConfig;
pub use dataset::continual::{
    ContinualDataset, ContinualSettings, InMemorySequentialDataset, SequentialDataset, TaskLoaders,
};
pub use dataset::loader::{Batch, DataLoader};
pub use dataset::{ClassRange, MaskedShards, Shard, TaskMasker};
pub use evaluate::{evaluate, TaskAccuracies};
pub use monitor::masking::{EvalProtocol, TaskDescriptor, TaskMaskedScorer};
pub use monitor::{Encoder, FeatureMode};
pub use registry::{EncoderSpec, ModelRegistry};
pub use run::{ContinualLearner, ContinualRun, RunOptions, TaskSummary};

/// Errors surfaced by the continual-learning harness.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ContinualError {
    /// Parallel arrays or matrices disagree on their dimensions.
    #[error("shape mismatch: {0}")]
    Shape(String),
    /// A parameter (temperature, neighbour count, ...) is out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Accuracy was requested over a split without samples.
    #[error("split `{split}` is empty; accuracy is undefined")]
    EmptySplit { split: String },
    /// The cursor has not advanced past a full task yet.
    #[error("no previous task: cursor {cursor} is below classes_per_task {classes_per_task}")]
    NoPreviousTask {
        cursor: usize,
        classes_per_task: usize,
    },
    /// No constructor registered under the requested model name.
    #[error("unknown model `{0}`")]
    UnknownModel(String),
    /// Run configuration could not be read or failed validation.
    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ContinualError>;

impl ContinualError {
    pub(crate) fn empty_split(split: impl Into<String>) -> Self {
        ContinualError::EmptySplit {
            split: split.into(),
        }
    }
}
