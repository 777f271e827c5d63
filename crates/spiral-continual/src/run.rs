// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Task-by-task driver: train on each task, monitor every task seen so far.

use crate::dataset::continual::{ContinualDataset, SequentialDataset};
use crate::dataset::loader::Batch;
use crate::evaluate::{evaluate, TaskAccuracies};
use crate::metrics::{MetricValue, MetricsSink, TaskAccuracyReport};
use crate::monitor::knn::{knn_monitor, KnnAccuracy, KnnConfig};
use crate::monitor::{Encoder, FeatureMode};
use crate::{ContinualError, Result};
use tracing::{info, info_span};

/// Model trained by the driver. Optimisation and checkpointing stay inside
/// the implementation.
pub trait ContinualLearner {
    /// Consumes one training batch and returns its loss.
    fn observe(&mut self, batch: &Batch) -> Result<f32>;

    /// Backbone the monitors read from.
    fn encoder(&self) -> &dyn Encoder;

    /// Called once every epoch of a task has run.
    fn end_task(&mut self, _dataset: &ContinualDataset) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunOptions {
    /// Epochs per task.
    pub stop_at_epoch: usize,
    pub knn_monitor: bool,
    /// Run the kNN monitor on epochs divisible by this.
    pub knn_interval: usize,
    pub knn: KnnConfig,
    /// The backbone carries a classifier: monitors read features and the
    /// classifier is scored on past tasks after each task.
    pub cl_default: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            stop_at_epoch: 1,
            knn_monitor: true,
            knn_interval: 1,
            knn: KnnConfig::default(),
            cl_default: false,
        }
    }
}

/// What happened while training on one task.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskSummary {
    pub task: usize,
    pub epochs: usize,
    pub last_loss: Option<f32>,
    /// kNN accuracies from the last monitored epoch, one per task seen.
    pub knn: Vec<KnnAccuracy>,
    pub mean_acc: Option<f64>,
    pub evaluation: Option<TaskAccuracies>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ContinualRun {
    options: RunOptions,
}

impl ContinualRun {
    pub fn new(options: RunOptions) -> Result<Self> {
        if options.knn_interval == 0 {
            return Err(ContinualError::InvalidArgument(
                "knn_interval must be > 0".into(),
            ));
        }
        Ok(Self { options })
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    fn monitor_tasks<L: ContinualLearner + ?Sized>(
        &self,
        state: &ContinualDataset,
        learner: &L,
    ) -> Result<Vec<KnnAccuracy>> {
        let descriptor = state.descriptor();
        let total_classes = state.settings().total_classes();
        state
            .test_loaders()
            .iter()
            .zip(state.memory_loaders())
            .enumerate()
            .map(|(task, (test, memory))| {
                let config = KnnConfig {
                    k: self.options.knn.k.min(memory.len()).max(1),
                    num_classes: Some(self.options.knn.num_classes.unwrap_or(total_classes)),
                    mode: FeatureMode::from_cl_default(self.options.cl_default),
                    ..self.options.knn.clone()
                };
                knn_monitor(learner.encoder(), descriptor, memory, test, task, &config)
            })
            .collect()
    }

    /// Runs every task of `dataset` and reports to `sink` as it goes:
    /// `loss` per batch, `acc_task_{n}`, `acc_mask_task_{n}`, `mean_acc` and
    /// `knn.acc_masked` per monitored epoch, and the past-task evaluation when
    /// `cl_default` is set.
    pub fn execute<D, L, S>(
        &self,
        dataset: &mut D,
        learner: &mut L,
        sink: &mut S,
    ) -> Result<Vec<TaskSummary>>
    where
        D: SequentialDataset + ?Sized,
        L: ContinualLearner + ?Sized,
        S: MetricsSink + ?Sized,
    {
        let n_tasks = dataset.state().settings().n_tasks;
        let mut summaries = Vec::with_capacity(n_tasks);
        for task in 0..n_tasks {
            let span = info_span!("task", task);
            let _guard = span.enter();
            let loaders = dataset.get_data_loaders()?;
            let mut summary = TaskSummary {
                task,
                epochs: 0,
                last_loss: None,
                knn: Vec::new(),
                mean_acc: None,
                evaluation: None,
            };

            for epoch in 0..self.options.stop_at_epoch {
                for batch in &loaders.train {
                    let loss = learner.observe(&batch)?;
                    sink.report(MetricValue::scalar("loss", f64::from(loss)));
                    summary.last_loss = Some(loss);
                }
                summary.epochs = epoch + 1;

                if self.options.knn_monitor && epoch % self.options.knn_interval == 0 {
                    let accuracies = self.monitor_tasks(dataset.state(), &*learner)?;
                    let report = TaskAccuracyReport {
                        per_task: accuracies.iter().map(|acc| acc.top1).collect(),
                        per_task_masked: accuracies.iter().map(|acc| acc.top1_masked).collect(),
                    };
                    for value in report.to_values() {
                        sink.report(value);
                    }
                    summary.mean_acc = report.mean();
                    summary.knn = accuracies;
                }
                info!(epoch, loss = ?summary.last_loss, mean_acc = ?summary.mean_acc, "epoch finished");
            }

            if self.options.cl_default {
                let accs = evaluate(learner.encoder(), dataset.state(), None)?;
                for value in accs.to_values() {
                    sink.report(value);
                }
                info!(
                    class_il = ?accs.mean_class_il(),
                    task_il = ?accs.mean_task_il(),
                    "mean accuracy"
                );
                summary.evaluation = Some(accs);
            }

            learner.end_task(dataset.state())?;
            summaries.push(summary);
        }
        Ok(summaries)
    }
}
