use spiral_continual::metrics::{register_continual_descriptors, RecordingSink};
use spiral_continual::registry::BoxedEncoder;
use spiral_continual::{
    Batch, ContinualLearner, ContinualRun, Encoder, InMemorySequentialDataset, ModelRegistry,
    RunConfig, Shard,
};
use std::io::Write;

const CONFIG: &str = r#"
[dataset]
name = "seq-onehot"
n_tasks = 3
classes_per_task = 2
batch_size = 4
seed = 11

[train]
stop_at_epoch = 1

[monitor]
knn_k = 3
knn_t = 0.1

[model]
name = "identity"
"#;

struct Frozen {
    encoder: BoxedEncoder,
}

impl ContinualLearner for Frozen {
    fn observe(&mut self, batch: &Batch) -> spiral_continual::Result<f32> {
        Ok(batch.inputs.sum() / batch.len() as f32)
    }

    fn encoder(&self) -> &dyn Encoder {
        &*self.encoder
    }
}

fn one_hot(classes: usize, per_class: usize) -> Shard {
    let mut rows = Vec::new();
    let mut labels = Vec::new();
    for class in 0..classes {
        for copy in 0..per_class {
            let mut row = vec![0.0f32; classes];
            row[class] = 1.0 + copy as f32 * 0.01;
            rows.push(row);
            labels.push(class);
        }
    }
    Shard::from_rows(rows, labels).unwrap()
}

#[test]
fn config_file_drives_a_full_run() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(CONFIG.as_bytes()).unwrap();
    let config = RunConfig::load(file.path()).unwrap();

    let registry = ModelRegistry::with_builtins();
    let mut learner = Frozen {
        encoder: registry.build(config.encoder_spec()).unwrap(),
    };
    let shard = one_hot(6, 4);
    let mut dataset = InMemorySequentialDataset::new(
        config.settings().unwrap(),
        shard.clone(),
        shard.clone(),
        shard,
    )
    .unwrap();

    register_continual_descriptors();
    let mut sink = RecordingSink::new();
    let run = ContinualRun::new(config.run_options()).unwrap();
    let summaries = run.execute(&mut dataset, &mut learner, &mut sink).unwrap();

    assert_eq!(summaries.len(), 3);
    assert_eq!(summaries[2].knn.len(), 3);
    assert_eq!(sink.last("acc_task_3"), Some(100.0));
    assert_eq!(sink.last("mean_acc"), Some(100.0));
    // 2 batches of 4 per task
    assert_eq!(sink.count("loss"), 6);
}

#[test]
fn missing_config_file_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = RunConfig::load(dir.path().join("absent.toml")).unwrap_err();
    assert!(err.to_string().contains("failed to read run config"));
}
