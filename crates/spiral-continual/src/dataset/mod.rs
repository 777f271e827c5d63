// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Class-range task masking over owned dataset shards.

pub mod continual;
pub mod loader;

use crate::{ContinualError, Result};
use ndarray::{Array2, Axis};

/// Ordered `(sample, label)` pairs. Samples are stored as the rows of `data`.
///
/// Every filtering operation returns a fresh shard; nothing aliases the
/// source arrays.
#[derive(Clone, Debug, PartialEq)]
pub struct Shard {
    data: Array2<f32>,
    targets: Vec<usize>,
}

impl Shard {
    /// Pairs a sample matrix with its label vector.
    pub fn new(data: Array2<f32>, targets: Vec<usize>) -> Result<Self> {
        if data.nrows() != targets.len() {
            return Err(ContinualError::Shape(format!(
                "shard has {} samples but {} targets",
                data.nrows(),
                targets.len()
            )));
        }
        Ok(Self { data, targets })
    }

    /// Builds a shard from row vectors of equal width.
    pub fn from_rows(rows: Vec<Vec<f32>>, targets: Vec<usize>) -> Result<Self> {
        let width = rows.first().map(Vec::len).unwrap_or(0);
        let mut flat = Vec::with_capacity(rows.len() * width);
        for (idx, row) in rows.iter().enumerate() {
            if row.len() != width {
                return Err(ContinualError::Shape(format!(
                    "row {idx} has width {} (expected {width})",
                    row.len()
                )));
            }
            flat.extend_from_slice(row);
        }
        let data = Array2::from_shape_vec((rows.len(), width), flat)
            .map_err(|err| ContinualError::Shape(err.to_string()))?;
        Self::new(data, targets)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Width of a flattened sample.
    pub fn sample_dim(&self) -> usize {
        self.data.ncols()
    }

    pub fn data(&self) -> &Array2<f32> {
        &self.data
    }

    pub fn targets(&self) -> &[usize] {
        &self.targets
    }

    /// Copies the rows whose mask entry is `true`, preserving order.
    pub fn select(&self, mask: &[bool]) -> Result<Shard> {
        if mask.len() != self.len() {
            return Err(ContinualError::Shape(format!(
                "mask has {} entries for a shard of {} samples",
                mask.len(),
                self.len()
            )));
        }
        let keep: Vec<usize> = mask
            .iter()
            .enumerate()
            .filter_map(|(idx, &keep)| keep.then_some(idx))
            .collect();
        Ok(self.gather(&keep))
    }

    /// Copies the given rows in the given order.
    pub(crate) fn gather(&self, indices: &[usize]) -> Shard {
        Shard {
            data: self.data.select(Axis(0), indices),
            targets: indices.iter().map(|&idx| self.targets[idx]).collect(),
        }
    }
}

/// Half-open class interval `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ClassRange {
    pub start: usize,
    pub end: usize,
}

impl ClassRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    /// Classes introduced by task `task` when every task adds `classes_per_task`.
    pub fn for_task(task: usize, classes_per_task: usize) -> Self {
        Self::new(task * classes_per_task, (task + 1) * classes_per_task)
    }

    pub fn contains(&self, label: usize) -> bool {
        self.start <= label && label < self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// `mask[j] = range.start <= labels[j] < range.end`.
pub fn task_mask(labels: &[usize], range: ClassRange) -> Vec<bool> {
    labels.iter().map(|&label| range.contains(label)).collect()
}

/// Filtered copies produced for one task.
#[derive(Clone, Debug, PartialEq)]
pub struct MaskedShards {
    pub train: Shard,
    pub memory: Shard,
    pub test: Shard,
}

/// Computes the class mask for a task boundary and applies it to the train,
/// memory and test shards.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskMasker {
    range: ClassRange,
    divide_tasks: bool,
}

impl TaskMasker {
    /// Masker for the task starting at `cursor`.
    pub fn new(cursor: usize, classes_per_task: usize) -> Self {
        Self {
            range: ClassRange::new(cursor, cursor + classes_per_task),
            divide_tasks: true,
        }
    }

    /// Disables class filtering; every sample passes. Used for joint baselines.
    pub fn undivided(mut self) -> Self {
        self.divide_tasks = false;
        self
    }

    pub fn range(&self) -> ClassRange {
        self.range
    }

    pub fn divides_tasks(&self) -> bool {
        self.divide_tasks
    }

    pub fn mask(&self, labels: &[usize]) -> Vec<bool> {
        if self.divide_tasks {
            task_mask(labels, self.range)
        } else {
            vec![true; labels.len()]
        }
    }

    /// Masks all three shards. The memory shard must be parallel to the train
    /// shard (same samples, same order); it is filtered with the train mask.
    /// The test shard gets its own mask.
    pub fn apply(&self, train: &Shard, memory: &Shard, test: &Shard) -> Result<MaskedShards> {
        if train.len() != memory.len() {
            return Err(ContinualError::Shape(format!(
                "memory shard has {} samples but train shard has {}",
                memory.len(),
                train.len()
            )));
        }
        if train.targets() != memory.targets() {
            return Err(ContinualError::Shape(
                "memory shard labels are not parallel to the train shard".to_string(),
            ));
        }
        let train_mask = self.mask(train.targets());
        let test_mask = self.mask(test.targets());
        Ok(MaskedShards {
            train: train.select(&train_mask)?,
            memory: memory.select(&train_mask)?,
            test: test.select(&test_mask)?,
        })
    }
}
