// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Metric descriptors and the sink that forwards readings to whatever
//! coordinates the run (a search scheduler, a dashboard, a test).

use crate::evaluate::TaskAccuracies;
use crate::monitor::probe::ProbeReport;
use crate::monitor::sweep::LogisticReport;
use once_cell::sync::Lazy;
use std::sync::RwLock;
use tracing::info;

/// Units associated with a metric descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricUnit {
    /// Accuracy in `[0, 100]`.
    Percent,
    /// Dimensionless scalar value (losses, regularisation strengths).
    Scalar,
    /// Raw count of passes, samples or tasks.
    Count,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricDescriptor {
    /// Canonical name; a trailing `*` stands for a task index.
    pub name: &'static str,
    pub unit: MetricUnit,
    pub description: &'static str,
}

impl MetricDescriptor {
    pub fn matches(&self, name: &str) -> bool {
        match self.name.strip_suffix('*') {
            Some(prefix) => name
                .strip_prefix(prefix)
                .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit())),
            None => self.name == name,
        }
    }
}

/// One reading.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricValue {
    pub name: String,
    pub value: f64,
    pub unit: MetricUnit,
}

impl MetricValue {
    pub fn new(name: impl Into<String>, value: f64, unit: MetricUnit) -> Self {
        Self {
            name: name.into(),
            value,
            unit,
        }
    }

    pub fn percent(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, value, MetricUnit::Percent)
    }

    pub fn scalar(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, value, MetricUnit::Scalar)
    }
}

static REGISTRY: Lazy<RwLock<Vec<MetricDescriptor>>> = Lazy::new(|| RwLock::new(Vec::new()));

/// Registers a collection of metric descriptors, ignoring duplicates.
pub fn register_descriptors(descriptors: &[MetricDescriptor]) {
    let mut registry = REGISTRY
        .write()
        .expect("metric registry write lock should not be poisoned");
    for descriptor in descriptors {
        if registry
            .iter()
            .all(|existing| existing.name != descriptor.name)
        {
            registry.push(*descriptor);
        }
    }
}

pub fn descriptors() -> Vec<MetricDescriptor> {
    REGISTRY
        .read()
        .expect("metric registry read lock should not be poisoned")
        .clone()
}

/// Registered descriptor covering `name`, if any.
pub fn lookup(name: &str) -> Option<MetricDescriptor> {
    REGISTRY
        .read()
        .expect("metric registry read lock should not be poisoned")
        .iter()
        .find(|descriptor| descriptor.matches(name))
        .copied()
}

pub const CONTINUAL_DESCRIPTORS: &[MetricDescriptor] = &[
    MetricDescriptor {
        name: "loss",
        unit: MetricUnit::Scalar,
        description: "Training loss returned by the learner for one batch.",
    },
    MetricDescriptor {
        name: "acc_task_*",
        unit: MetricUnit::Percent,
        description: "kNN top-1 accuracy on the test split of task N (1-based).",
    },
    MetricDescriptor {
        name: "acc_mask_task_*",
        unit: MetricUnit::Percent,
        description: "kNN top-1 accuracy on task N with scores masked to its classes.",
    },
    MetricDescriptor {
        name: "mean_acc",
        unit: MetricUnit::Percent,
        description: "Mean kNN accuracy over every task seen so far.",
    },
    MetricDescriptor {
        name: "knn.acc_masked",
        unit: MetricUnit::Percent,
        description: "Mean task-masked kNN accuracy over every task seen so far.",
    },
    MetricDescriptor {
        name: "eval.class_il_*",
        unit: MetricUnit::Percent,
        description: "Class-incremental accuracy of the classifier head on task N.",
    },
    MetricDescriptor {
        name: "eval.task_il_*",
        unit: MetricUnit::Percent,
        description: "Task-incremental accuracy of the classifier head on task N.",
    },
    MetricDescriptor {
        name: "probe.train_acc",
        unit: MetricUnit::Percent,
        description: "Linear probe accuracy on the memory split.",
    },
    MetricDescriptor {
        name: "probe.test_acc",
        unit: MetricUnit::Percent,
        description: "Linear probe accuracy on the test split.",
    },
    MetricDescriptor {
        name: "probe.passes",
        unit: MetricUnit::Count,
        description: "Training passes the probe needed to plateau.",
    },
    MetricDescriptor {
        name: "logreg.train_acc",
        unit: MetricUnit::Percent,
        description: "Sweep-selected logistic regression accuracy on the memory split.",
    },
    MetricDescriptor {
        name: "logreg.test_acc",
        unit: MetricUnit::Percent,
        description: "Sweep-selected logistic regression accuracy on the test split.",
    },
    MetricDescriptor {
        name: "logreg.c",
        unit: MetricUnit::Scalar,
        description: "Inverse regularisation strength chosen by the sweep.",
    },
];

pub fn register_continual_descriptors() {
    register_descriptors(CONTINUAL_DESCRIPTORS);
}

/// Receiver for metric readings.
pub trait MetricsSink {
    fn report(&mut self, value: MetricValue);

    fn report_all(&mut self, values: impl IntoIterator<Item = MetricValue>)
    where
        Self: Sized,
    {
        for value in values {
            self.report(value);
        }
    }
}

impl<S: MetricsSink + ?Sized> MetricsSink for &mut S {
    fn report(&mut self, value: MetricValue) {
        (**self).report(value);
    }
}

/// Keeps every reading in arrival order.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    values: Vec<MetricValue>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn values(&self) -> &[MetricValue] {
        &self.values
    }

    /// Most recent reading named `name`.
    pub fn last(&self, name: &str) -> Option<f64> {
        self.values
            .iter()
            .rev()
            .find(|value| value.name == name)
            .map(|value| value.value)
    }

    pub fn count(&self, name: &str) -> usize {
        self.values.iter().filter(|value| value.name == name).count()
    }
}

impl MetricsSink for RecordingSink {
    fn report(&mut self, value: MetricValue) {
        self.values.push(value);
    }
}

/// Emits every reading as an `info` event on the `spiral_continual::metrics` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn report(&mut self, value: MetricValue) {
        let registered = lookup(&value.name).is_some();
        info!(
            target: "spiral_continual::metrics",
            name = %value.name,
            value = value.value,
            unit = ?value.unit,
            registered,
            "metric"
        );
    }
}

/// kNN accuracies of every task after one monitored epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskAccuracyReport {
    pub per_task: Vec<f64>,
    /// Same tasks, scores masked to each task's classes.
    pub per_task_masked: Vec<f64>,
}

impl TaskAccuracyReport {
    pub fn mean(&self) -> Option<f64> {
        (!self.per_task.is_empty())
            .then(|| self.per_task.iter().sum::<f64>() / self.per_task.len() as f64)
    }

    pub fn mean_masked(&self) -> Option<f64> {
        (!self.per_task_masked.is_empty()).then(|| {
            self.per_task_masked.iter().sum::<f64>() / self.per_task_masked.len() as f64
        })
    }

    /// `acc_task_N` and `acc_mask_task_N` for every task, then `mean_acc`
    /// and `knn.acc_masked`.
    pub fn to_values(&self) -> Vec<MetricValue> {
        let mut values = Vec::with_capacity(2 * self.per_task.len() + 2);
        for (task, acc) in self.per_task.iter().enumerate() {
            values.push(MetricValue::percent(format!("acc_task_{}", task + 1), *acc));
            if let Some(masked) = self.per_task_masked.get(task) {
                values.push(MetricValue::percent(
                    format!("acc_mask_task_{}", task + 1),
                    *masked,
                ));
            }
        }
        if let Some(mean) = self.mean() {
            values.push(MetricValue::percent("mean_acc", mean));
        }
        if let Some(masked) = self.mean_masked() {
            values.push(MetricValue::percent("knn.acc_masked", masked));
        }
        values
    }
}

impl TaskAccuracies {
    pub fn to_values(&self) -> Vec<MetricValue> {
        let class_il = self
            .class_il
            .iter()
            .enumerate()
            .map(|(task, acc)| MetricValue::percent(format!("eval.class_il_{}", task + 1), *acc));
        let task_il = self
            .task_il
            .iter()
            .enumerate()
            .map(|(task, acc)| MetricValue::percent(format!("eval.task_il_{}", task + 1), *acc));
        class_il.chain(task_il).collect()
    }
}

impl ProbeReport {
    pub fn to_values(&self) -> [MetricValue; 3] {
        [
            MetricValue::percent("probe.train_acc", self.train_acc),
            MetricValue::percent("probe.test_acc", self.test_acc),
            MetricValue::new("probe.passes", self.passes as f64, MetricUnit::Count),
        ]
    }
}

impl LogisticReport {
    pub fn to_values(&self) -> [MetricValue; 3] {
        [
            MetricValue::percent("logreg.train_acc", self.train_acc),
            MetricValue::percent("logreg.test_acc", self.test_acc),
            MetricValue::scalar("logreg.c", self.c),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registering_descriptors_is_idempotent() {
        register_continual_descriptors();
        register_continual_descriptors();
        let registered = descriptors();
        assert_eq!(
            registered
                .iter()
                .filter(|descriptor| descriptor.name == "mean_acc")
                .count(),
            1
        );
        assert_eq!(lookup("acc_task_12").map(|d| d.unit), Some(MetricUnit::Percent));
        assert!(lookup("acc_task_").is_none());
        assert!(lookup("acc_task_x").is_none());
    }

    #[test]
    fn task_report_emits_one_value_per_task_and_the_mean() {
        let report = TaskAccuracyReport {
            per_task: vec![80.0, 60.0],
            per_task_masked: vec![90.0, 100.0],
        };
        let values = report.to_values();
        let names: Vec<&str> = values.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "acc_task_1",
                "acc_mask_task_1",
                "acc_task_2",
                "acc_mask_task_2",
                "mean_acc",
                "knn.acc_masked"
            ]
        );
        assert_eq!(values[3].value, 100.0);
        assert_eq!(values[4].value, 70.0);
        assert_eq!(values[5].value, 95.0);
        register_continual_descriptors();
        assert!(names.iter().all(|name| lookup(name).is_some()));
    }

    #[test]
    fn recording_sink_keeps_order() {
        let mut sink = RecordingSink::new();
        sink.report_all([
            MetricValue::scalar("loss", 1.0),
            MetricValue::scalar("loss", 0.5),
        ]);
        assert_eq!(sink.count("loss"), 2);
        assert_eq!(sink.last("loss"), Some(0.5));
        assert_eq!(sink.last("mean_acc"), None);
    }
}
