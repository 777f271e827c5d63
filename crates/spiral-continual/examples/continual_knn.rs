use std::error::Error;

use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Normal};
use spiral_config::determinism::{self, DeterminismConfig};
use spiral_config::tracing::{flush_chrome_trace, init_tracing};
use spiral_continual::metrics::{register_continual_descriptors, MetricsSink, TracingSink};
use spiral_continual::monitor::probe::probe_monitor;
use spiral_continual::monitor::sweep::logistic_monitor;
use spiral_continual::registry::BoxedEncoder;
use spiral_continual::{
    Batch, ContinualLearner, ContinualRun, Encoder, InMemorySequentialDataset, ModelRegistry,
    RunConfig, SequentialDataset, Shard,
};

const DEFAULT_CONFIG: &str = r#"
[dataset]
name = "seq-blobs"
n_tasks = 5
classes_per_task = 2
batch_size = 32
seed = 7

[train]
stop_at_epoch = 2
knn_interval = 1

[monitor]
knn_k = 20
knn_t = 0.1

[probe]
num_cs = 6

[model]
name = "random_projection"
input_dim = 16
output_dim = 8
num_classes = 10
seed = 7
"#;

/// A backbone that never updates; the monitors then measure how well a fixed
/// random projection separates the classes.
struct FrozenLearner {
    encoder: BoxedEncoder,
}

impl ContinualLearner for FrozenLearner {
    fn observe(&mut self, batch: &Batch) -> spiral_continual::Result<f32> {
        let mean_norm = batch
            .inputs
            .rows()
            .into_iter()
            .map(|row| row.dot(&row).sqrt())
            .sum::<f32>()
            / batch.len() as f32;
        Ok(mean_norm)
    }

    fn encoder(&self) -> &dyn Encoder {
        &*self.encoder
    }
}

fn gaussian_classes(
    rng: &mut StdRng,
    classes: usize,
    per_class: usize,
    dim: usize,
) -> Result<Shard, Box<dyn Error>> {
    let noise = Normal::new(0.0f32, 0.5)?;
    let mut rows = Vec::with_capacity(classes * per_class);
    let mut labels = Vec::with_capacity(classes * per_class);
    for class in 0..classes {
        for _ in 0..per_class {
            let mut row: Vec<f32> = (0..dim).map(|_| noise.sample(rng)).collect();
            row[class % dim] += 3.0;
            rows.push(row);
            labels.push(class);
        }
    }
    Ok(Shard::from_rows(rows, labels)?)
}

fn main() -> Result<(), Box<dyn Error>> {
    init_tracing()?;
    register_continual_descriptors();

    let config = match std::env::var("CONTINUAL_CONFIG") {
        Ok(path) => RunConfig::load(path)?,
        Err(_) => RunConfig::from_toml_str(DEFAULT_CONFIG)?,
    };
    let settings = config.settings()?;
    let spec = config.encoder_spec();
    // components built without an explicit seed derive one from the dataset seed
    if let Some(seed) = settings.seed {
        determinism::configure(DeterminismConfig {
            enabled: true,
            base_seed: seed,
        });
    }

    let mut rng = StdRng::seed_from_u64(settings.seed.unwrap_or(0));
    let classes = settings.total_classes();
    let train = gaussian_classes(&mut rng, classes, 40, spec.input_dim)?;
    let test = gaussian_classes(&mut rng, classes, 10, spec.input_dim)?;

    let registry = ModelRegistry::with_builtins();
    let mut learner = FrozenLearner {
        encoder: registry.build(spec)?,
    };
    let mut dataset =
        InMemorySequentialDataset::new(settings, train.clone(), train, test)?;
    let mut sink = TracingSink;

    let run = ContinualRun::new(config.run_options())?;
    let summaries = run.execute(&mut dataset, &mut learner, &mut sink)?;
    for summary in &summaries {
        println!(
            "task {}: mean kNN accuracy {:.2}%",
            summary.task + 1,
            summary.mean_acc.unwrap_or_default()
        );
    }

    let state = dataset.state();
    if let (Some(memory), Some(test)) = (state.memory_loaders().last(), state.test_loaders().last()) {
        let probe = probe_monitor(
            learner.encoder(),
            state.descriptor(),
            memory,
            test,
            &config.probe_config(),
        )?;
        sink.report_all(probe.to_values());
        let logistic = logistic_monitor(learner.encoder(), memory, test, &config.logistic_config())?;
        sink.report_all(logistic.to_values());
        println!(
            "last task: probe {:.2}% / logistic {:.2}% (C = {:.2e})",
            probe.test_acc, logistic.test_acc, logistic.c
        );
    }

    flush_chrome_trace();
    Ok(())
}
