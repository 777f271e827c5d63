// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::dataset::continual::ContinualDataset;
use crate::dataset::ClassRange;
use crate::monitor::{accuracy_percent, argmax_rows, checked_forward, count_correct};
use crate::monitor::{Encoder, FeatureMode};
use crate::{ContinualError, Result};
use ndarray::{s, Array2};
use tracing::info;

/// Optional head applied to the encoder logits before scoring.
pub type Classifier<'a> = &'a dyn Fn(&Array2<f32>) -> Result<Array2<f32>>;

/// Per-task accuracies (percent) over every registered test loader.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TaskAccuracies {
    /// Argmax over every output column.
    pub class_il: Vec<f64>,
    /// Argmax restricted to the columns of the loader's own task.
    pub task_il: Vec<f64>,
}

impl TaskAccuracies {
    pub fn mean_class_il(&self) -> Option<f64> {
        mean(&self.class_il)
    }

    pub fn mean_task_il(&self) -> Option<f64> {
        mean(&self.task_il)
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

/// First maximum inside `range` for every row. Columns outside the range can
/// never win, whatever their sign.
fn argmax_within(scores: &Array2<f32>, range: ClassRange) -> Result<Vec<usize>> {
    let end = range.end.min(scores.ncols());
    if range.start >= end {
        return Err(ContinualError::Shape(format!(
            "task classes {}..{} fall outside {} output columns",
            range.start,
            range.end,
            scores.ncols()
        )));
    }
    Ok(argmax_rows(scores.slice(s![.., range.start..end]))
        .into_iter()
        .map(|idx| idx + range.start)
        .collect())
}

/// Scores the encoder on the test loader of every task seen so far.
pub fn evaluate<E: Encoder + ?Sized>(
    encoder: &E,
    dataset: &ContinualDataset,
    classifier: Option<Classifier<'_>>,
) -> Result<TaskAccuracies> {
    let per_task = dataset.settings().classes_per_task;
    let mut accuracies = TaskAccuracies::default();
    for (task, loader) in dataset.test_loaders().iter().enumerate() {
        let range = ClassRange::for_task(task, per_task);
        let (mut correct, mut correct_masked, mut total) = (0usize, 0usize, 0usize);
        for batch in loader {
            let mut outputs = checked_forward(encoder, &batch.inputs, FeatureMode::Logits)?;
            if let Some(head) = classifier {
                outputs = head(&outputs)?;
            }
            correct += count_correct(&argmax_rows(outputs.view()), &batch.targets);
            correct_masked += count_correct(&argmax_within(&outputs, range)?, &batch.targets);
            total += batch.len();
        }
        let split = format!("test/task-{task}");
        accuracies
            .class_il
            .push(accuracy_percent(correct, total, &split)?);
        accuracies
            .task_il
            .push(accuracy_percent(correct_masked, total, &split)?);
    }
    info!(
        tasks = accuracies.class_il.len(),
        class_il = ?accuracies.mean_class_il(),
        task_il = ?accuracies.mean_task_il(),
        "evaluated past tasks"
    );
    Ok(accuracies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::continual::ContinualSettings;
    use crate::dataset::Shard;
    use ndarray::array;

    /// One-hot "logits" that always favour class 0.
    struct Biased;

    impl Encoder for Biased {
        fn forward(&self, inputs: &Array2<f32>, _mode: FeatureMode) -> Result<Array2<f32>> {
            let mut out = Array2::from_elem((inputs.nrows(), 4), -1.0);
            out.column_mut(0).fill(5.0);
            for (mut row, input) in out.rows_mut().into_iter().zip(inputs.rows()) {
                row[input[0] as usize] += 1.0;
            }
            Ok(out)
        }
    }

    #[test]
    fn masked_accuracy_ignores_negative_out_of_task_columns() {
        let labels = vec![0, 1, 2, 3];
        let data = array![[0.0], [1.0], [2.0], [3.0]];
        let shard = Shard::new(data, labels).unwrap();
        let settings = ContinualSettings::new("eval", 2, 2, 2).unwrap();
        let mut dataset = ContinualDataset::new(settings);
        dataset.advance_task(&shard, &shard, &shard).unwrap();
        dataset.advance_task(&shard, &shard, &shard).unwrap();

        let accs = evaluate(&Biased, &dataset, None).unwrap();
        assert_eq!(accs.class_il, vec![50.0, 0.0]);
        assert_eq!(accs.task_il, vec![50.0, 100.0]);
        assert_eq!(accs.mean_task_il(), Some(75.0));
    }

    #[test]
    fn classifier_head_is_applied() {
        let shard = Shard::new(array![[1.0], [1.0]], vec![1, 1]).unwrap();
        let mut dataset = ContinualDataset::new(ContinualSettings::new("eval", 1, 2, 2).unwrap());
        dataset.advance_task(&shard, &shard, &shard).unwrap();
        let swap = |x: &Array2<f32>| -> Result<Array2<f32>> {
            Ok(x.slice(s![.., ..2;-1]).to_owned())
        };
        let head: Classifier<'_> = &swap;
        let accs = evaluate(&Biased, &dataset, Some(head)).unwrap();
        assert_eq!(accs.class_il, vec![100.0]);
    }
}
