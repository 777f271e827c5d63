// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::dataset::ClassRange;
use crate::ContinualError;
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which classes a prediction may choose from at test time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EvalProtocol {
    /// Every class seen so far.
    #[default]
    #[serde(rename = "class-il")]
    ClassIncremental,
    /// Only the classes of the task the sample belongs to.
    #[serde(rename = "task-il")]
    TaskIncremental,
}

impl EvalProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvalProtocol::ClassIncremental => "class-il",
            EvalProtocol::TaskIncremental => "task-il",
        }
    }
}

impl fmt::Display for EvalProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvalProtocol {
    type Err = ContinualError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "class-il" | "class_il" => Ok(EvalProtocol::ClassIncremental),
            "task-il" | "task_il" => Ok(EvalProtocol::TaskIncremental),
            other => Err(ContinualError::InvalidArgument(format!(
                "unknown evaluation protocol `{other}` (expected class-il or task-il)"
            ))),
        }
    }
}

/// Snapshot of a continual dataset as seen by the scorers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskDescriptor {
    /// Classes materialized so far (the dataset cursor).
    pub seen_classes: usize,
    pub classes_per_task: usize,
    pub protocol: EvalProtocol,
}

/// Zeroes the score columns a protocol rules out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskMaskedScorer {
    descriptor: TaskDescriptor,
}

impl TaskMaskedScorer {
    pub fn new(descriptor: TaskDescriptor) -> Self {
        Self { descriptor }
    }

    pub fn descriptor(&self) -> TaskDescriptor {
        self.descriptor
    }

    /// Columns a prediction for `task_id` may land in.
    pub fn eligible(&self, task_id: usize) -> ClassRange {
        match self.descriptor.protocol {
            EvalProtocol::ClassIncremental => ClassRange::new(0, self.descriptor.seen_classes),
            EvalProtocol::TaskIncremental => {
                ClassRange::for_task(task_id, self.descriptor.classes_per_task)
            }
        }
    }

    /// Zeroes every column outside [`eligible`](Self::eligible) in place.
    pub fn apply(&self, scores: &mut Array2<f32>, task_id: usize) {
        let range = self.eligible(task_id);
        let cols = scores.ncols();
        let start = range.start.min(cols);
        let end = range.end.min(cols);
        for (col, mut column) in scores.axis_iter_mut(Axis(1)).enumerate() {
            if col < start || col >= end {
                column.fill(0.0);
            }
        }
    }

    /// Copying variant of [`apply`](Self::apply).
    pub fn masked(&self, scores: &Array2<f32>, task_id: usize) -> Array2<f32> {
        let mut out = scores.clone();
        self.apply(&mut out, task_id);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores() -> Array2<f32> {
        Array2::from_shape_fn((3, 6), |(r, c)| 1.0 + r as f32 + c as f32 * 0.5)
    }

    fn scorer(protocol: EvalProtocol, seen: usize) -> TaskMaskedScorer {
        TaskMaskedScorer::new(TaskDescriptor {
            seen_classes: seen,
            classes_per_task: 2,
            protocol,
        })
    }

    #[test]
    fn task_incremental_keeps_only_the_task_block() {
        let masked = scorer(EvalProtocol::TaskIncremental, 6).masked(&scores(), 1);
        let mut zeroed = 0.0f32;
        for ((_, col), value) in masked.indexed_iter() {
            if !(2..4).contains(&col) {
                zeroed += value.abs();
            } else {
                assert!(*value > 0.0);
            }
        }
        assert_eq!(zeroed, 0.0);
    }

    #[test]
    fn class_incremental_keeps_the_seen_prefix() {
        let masked = scorer(EvalProtocol::ClassIncremental, 4).masked(&scores(), 0);
        assert!(masked.column(3).iter().all(|v| *v > 0.0));
        assert!(masked.column(4).iter().all(|v| *v == 0.0));
        assert!(masked.column(5).iter().all(|v| *v == 0.0));
    }

    #[test]
    fn ranges_past_the_score_width_are_clamped() {
        let mut narrow = Array2::<f32>::ones((2, 3));
        scorer(EvalProtocol::TaskIncremental, 6).apply(&mut narrow, 2);
        assert!(narrow.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn protocol_parses_and_displays() {
        assert_eq!(
            "task-il".parse::<EvalProtocol>().unwrap(),
            EvalProtocol::TaskIncremental
        );
        assert_eq!(EvalProtocol::ClassIncremental.to_string(), "class-il");
        assert!("domain-il".parse::<EvalProtocol>().is_err());
    }
}
