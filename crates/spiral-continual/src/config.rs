// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! TOML run configuration.
//!
//! ```toml
//! [dataset]
//! name = "seq-cifar10"
//! n_tasks = 5
//! classes_per_task = 2
//! batch_size = 256
//! protocol = "class-il"
//!
//! [train]
//! stop_at_epoch = 100
//! knn_interval = 5
//!
//! [monitor]
//! knn_k = 200
//! knn_t = 0.1
//!
//! [model]
//! name = "random_projection"
//! input_dim = 3072
//! output_dim = 512
//! num_classes = 10
//! ```

use crate::dataset::continual::ContinualSettings;
use crate::monitor::knn::KnnConfig;
use crate::monitor::masking::EvalProtocol;
use crate::monitor::probe::ProbeConfig;
use crate::monitor::sweep::{LogisticMonitorConfig, SweepConfig};
use crate::monitor::FeatureMode;
use crate::registry::EncoderSpec;
use crate::run::RunOptions;
use crate::{ContinualError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatasetSection {
    pub name: String,
    pub n_tasks: usize,
    pub classes_per_task: usize,
    pub batch_size: usize,
    #[serde(default)]
    pub protocol: EvalProtocol,
    #[serde(default)]
    pub num_workers: usize,
    #[serde(default)]
    pub seed: Option<u64>,
    /// `false` trains every task on all classes.
    #[serde(default = "default_divide_tasks")]
    pub divide_tasks: bool,
}

fn default_divide_tasks() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainSection {
    pub stop_at_epoch: usize,
    pub knn_monitor: bool,
    pub knn_interval: usize,
    pub cl_default: bool,
}

impl Default for TrainSection {
    fn default() -> Self {
        let options = RunOptions::default();
        Self {
            stop_at_epoch: options.stop_at_epoch,
            knn_monitor: options.knn_monitor,
            knn_interval: options.knn_interval,
            cl_default: options.cl_default,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSection {
    pub knn_k: usize,
    pub knn_t: f32,
    /// Width of the kNN score matrix; all classes of the benchmark if unset.
    pub num_classes: Option<usize>,
    pub debug: bool,
    pub debug_bank_limit: usize,
}

impl Default for MonitorSection {
    fn default() -> Self {
        let knn = KnnConfig::default();
        Self {
            knn_k: knn.k,
            knn_t: knn.t,
            num_classes: None,
            debug: knn.debug,
            debug_bank_limit: knn.debug_bank_limit,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSection {
    pub max_passes: usize,
    pub tolerance: f32,
    pub base_lr: f32,
    pub momentum: f32,
    pub nesterov: bool,
    pub seed: Option<u64>,
    pub num_cs: usize,
    pub start_c: f64,
    pub end_c: f64,
    pub max_iter: usize,
    pub random_state: u64,
}

impl Default for ProbeSection {
    fn default() -> Self {
        let probe = ProbeConfig::default();
        let sweep = SweepConfig::default();
        Self {
            max_passes: probe.max_passes,
            tolerance: probe.tolerance,
            base_lr: probe.base_lr,
            momentum: probe.momentum,
            nesterov: probe.nesterov,
            seed: probe.seed,
            num_cs: sweep.num_cs,
            start_c: sweep.start_c,
            end_c: sweep.end_c,
            max_iter: sweep.max_iter,
            random_state: sweep.random_state,
        }
    }
}

/// Everything needed to drive one continual run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub dataset: DatasetSection,
    #[serde(default)]
    pub train: TrainSection,
    #[serde(default)]
    pub monitor: MonitorSection,
    #[serde(default)]
    pub probe: ProbeSection,
    #[serde(default)]
    pub model: EncoderSpec,
}

fn invalid(message: impl Into<String>) -> ContinualError {
    ContinualError::Config(message.into())
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        let dataset = &self.dataset;
        if dataset.n_tasks == 0 || dataset.classes_per_task == 0 {
            return Err(invalid("n_tasks and classes_per_task must be > 0"));
        }
        if dataset.batch_size == 0 {
            return Err(invalid("batch_size must be > 0"));
        }
        if self.train.knn_interval == 0 {
            return Err(invalid("knn_interval must be > 0"));
        }
        if self.monitor.knn_k == 0 {
            return Err(invalid("knn_k must be > 0"));
        }
        if !self.monitor.knn_t.is_finite() || self.monitor.knn_t <= 0.0 {
            return Err(invalid(format!(
                "knn_t must be > 0, got {}",
                self.monitor.knn_t
            )));
        }
        let total = dataset.n_tasks * dataset.classes_per_task;
        if let Some(classes) = self.monitor.num_classes {
            if classes < total {
                return Err(invalid(format!(
                    "num_classes ({classes}) is below the {total} classes of the benchmark"
                )));
            }
        }
        if self.probe.num_cs == 0 {
            return Err(invalid("num_cs must be > 0"));
        }
        if self.probe.start_c > self.probe.end_c {
            return Err(invalid(format!(
                "regularisation range is inverted ({} > {})",
                self.probe.start_c, self.probe.end_c
            )));
        }
        self.probe_config()
            .validate()
            .map_err(|err| invalid(err.to_string()))
    }

    pub fn from_toml_str(config: &str) -> Result<Self> {
        let parsed: RunConfig = toml::from_str(config)
            .map_err(|err| invalid(format!("failed to parse run config: {err}")))?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read_to_string(&path).map_err(|err| {
            invalid(format!(
                "failed to read run config {}: {err}",
                path.as_ref().display()
            ))
        })?;
        Self::from_toml_str(&data)
    }

    pub fn settings(&self) -> Result<ContinualSettings> {
        let dataset = &self.dataset;
        let mut settings = ContinualSettings::new(
            dataset.name.clone(),
            dataset.n_tasks,
            dataset.classes_per_task,
            dataset.batch_size,
        )?
        .with_protocol(dataset.protocol)
        .with_workers(dataset.num_workers)
        .with_task_division(dataset.divide_tasks);
        if let Some(seed) = dataset.seed {
            settings = settings.with_seed(seed);
        }
        Ok(settings)
    }

    fn feature_mode(&self) -> FeatureMode {
        FeatureMode::from_cl_default(self.train.cl_default)
    }

    pub fn knn_config(&self) -> KnnConfig {
        KnnConfig {
            k: self.monitor.knn_k,
            t: self.monitor.knn_t,
            num_classes: Some(
                self.monitor
                    .num_classes
                    .unwrap_or(self.dataset.n_tasks * self.dataset.classes_per_task),
            ),
            mode: self.feature_mode(),
            debug: self.monitor.debug,
            debug_bank_limit: self.monitor.debug_bank_limit,
        }
    }

    pub fn probe_config(&self) -> ProbeConfig {
        ProbeConfig {
            max_passes: self.probe.max_passes,
            tolerance: self.probe.tolerance,
            base_lr: self.probe.base_lr,
            momentum: self.probe.momentum,
            nesterov: self.probe.nesterov,
            mode: self.feature_mode(),
            seed: self.probe.seed.or(self.dataset.seed),
        }
    }

    pub fn sweep_config(&self) -> SweepConfig {
        SweepConfig {
            num_cs: self.probe.num_cs,
            start_c: self.probe.start_c,
            end_c: self.probe.end_c,
            max_iter: self.probe.max_iter,
            random_state: self.probe.random_state,
        }
    }

    pub fn logistic_config(&self) -> LogisticMonitorConfig {
        LogisticMonitorConfig {
            mode: self.feature_mode(),
            debug: self.monitor.debug,
            sweep: self.sweep_config(),
        }
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            stop_at_epoch: self.train.stop_at_epoch,
            knn_monitor: self.train.knn_monitor,
            knn_interval: self.train.knn_interval,
            knn: self.knn_config(),
            cl_default: self.train.cl_default,
        }
    }

    pub fn encoder_spec(&self) -> &EncoderSpec {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [dataset]
        name = "seq-toy"
        n_tasks = 2
        classes_per_task = 2
        batch_size = 8
    "#;

    #[test]
    fn defaults_fill_the_optional_tables() {
        let config = RunConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.dataset.protocol, EvalProtocol::ClassIncremental);
        let knn = config.knn_config();
        assert_eq!(knn.k, 200);
        assert_eq!(knn.num_classes, Some(4));
        assert_eq!(config.probe_config().max_passes, 100);
        assert_eq!(config.sweep_config().num_cs, 10);
        assert_eq!(config.model.name, "identity");
        assert!(config.settings().unwrap().divide_tasks);
        assert_eq!(config.settings().unwrap().total_classes(), 4);
    }

    #[test]
    fn protocol_and_model_tables_parse() {
        let text = format!(
            "{MINIMAL}\nprotocol = \"task-il\"\nseed = 3\n[train]\ncl_default = true\n[model]\nname = \"random_projection\"\ninput_dim = 4\noutput_dim = 3\nnum_classes = 4\n"
        );
        let config = RunConfig::from_toml_str(&text).unwrap();
        assert_eq!(config.dataset.protocol, EvalProtocol::TaskIncremental);
        assert_eq!(config.settings().unwrap().seed, Some(3));
        assert_eq!(config.knn_config().mode, FeatureMode::Features);
        assert_eq!(config.probe_config().seed, Some(3));
        assert_eq!(config.encoder_spec().output_dim, 3);
    }

    #[test]
    fn divide_tasks_flag_reaches_the_settings() {
        let text = format!("{MINIMAL}\ndivide_tasks = false\n");
        let config = RunConfig::from_toml_str(&text).unwrap();
        assert!(!config.dataset.divide_tasks);
        assert!(!config.settings().unwrap().divide_tasks);
    }

    #[test]
    fn invalid_values_are_rejected() {
        for extra in [
            "[monitor]\nknn_t = 0.0",
            "[monitor]\nnum_classes = 3",
            "[train]\nknn_interval = 0",
            "[probe]\nstart_c = 3.0\nend_c = 1.0",
            "[probe]\nmomentum = 1.5",
        ] {
            let err = RunConfig::from_toml_str(&format!("{MINIMAL}\n{extra}")).unwrap_err();
            assert!(matches!(err, ContinualError::Config(_)), "{extra}: {err}");
        }
        let zero_batch = MINIMAL.replace("batch_size = 8", "batch_size = 0");
        assert!(RunConfig::from_toml_str(&zero_batch).is_err());
        assert!(RunConfig::from_toml_str("[dataset]\nname = 1").is_err());
    }
}
