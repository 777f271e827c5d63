// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::loader::DataLoader;
use super::{ClassRange, Shard, TaskMasker};
use crate::monitor::masking::{EvalProtocol, TaskDescriptor};
use crate::{ContinualError, Result};
use spiral_config::determinism;
use tracing::{debug, info};

/// Static description of a class-incremental benchmark.
#[derive(Clone, Debug, PartialEq)]
pub struct ContinualSettings {
    pub name: String,
    pub n_tasks: usize,
    pub classes_per_task: usize,
    pub batch_size: usize,
    pub protocol: EvalProtocol,
    pub num_workers: usize,
    pub seed: Option<u64>,
    /// `false` serves every class in every task (joint-training baseline).
    pub divide_tasks: bool,
}

impl ContinualSettings {
    pub fn new(
        name: impl Into<String>,
        n_tasks: usize,
        classes_per_task: usize,
        batch_size: usize,
    ) -> Result<Self> {
        if n_tasks == 0 || classes_per_task == 0 {
            return Err(ContinualError::InvalidArgument(format!(
                "n_tasks ({n_tasks}) and classes_per_task ({classes_per_task}) must be > 0"
            )));
        }
        if batch_size == 0 {
            return Err(ContinualError::InvalidArgument(
                "batch_size must be > 0".to_string(),
            ));
        }
        Ok(Self {
            name: name.into(),
            n_tasks,
            classes_per_task,
            batch_size,
            protocol: EvalProtocol::default(),
            num_workers: 0,
            seed: None,
            divide_tasks: true,
        })
    }

    pub fn with_protocol(mut self, protocol: EvalProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_task_division(mut self, divide_tasks: bool) -> Self {
        self.divide_tasks = divide_tasks;
        self
    }

    /// Classes covered once every task has been materialized.
    pub fn total_classes(&self) -> usize {
        self.n_tasks * self.classes_per_task
    }
}

/// Loaders materialized for a single task.
#[derive(Clone, Debug)]
pub struct TaskLoaders {
    pub train: DataLoader,
    pub memory: DataLoader,
    pub test: DataLoader,
}

/// Cursor over the class sequence plus the loaders registered so far.
///
/// After `k` calls to [`ContinualDataset::advance_task`], the cursor equals
/// `k * classes_per_task` and each registry holds `k` loaders in task order.
#[derive(Debug)]
pub struct ContinualDataset {
    settings: ContinualSettings,
    cursor: usize,
    /// Set once an undivided task has exposed every class.
    all_classes_seen: bool,
    train_loader: Option<DataLoader>,
    train_loaders: Vec<DataLoader>,
    test_loaders: Vec<DataLoader>,
    memory_loaders: Vec<DataLoader>,
}

impl ContinualDataset {
    pub fn new(settings: ContinualSettings) -> Self {
        Self {
            settings,
            cursor: 0,
            all_classes_seen: false,
            train_loader: None,
            train_loaders: Vec::new(),
            test_loaders: Vec::new(),
            memory_loaders: Vec::new(),
        }
    }

    pub fn settings(&self) -> &ContinualSettings {
        &self.settings
    }

    /// First class of the next unseen task.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn tasks_seen(&self) -> usize {
        self.train_loaders.len()
    }

    /// Whether every task of the benchmark has been materialized.
    pub fn is_exhausted(&self) -> bool {
        self.tasks_seen() >= self.settings.n_tasks
    }

    /// Train loader of the most recent task.
    pub fn train_loader(&self) -> Option<&DataLoader> {
        self.train_loader.as_ref()
    }

    pub fn train_loaders(&self) -> &[DataLoader] {
        &self.train_loaders
    }

    pub fn test_loaders(&self) -> &[DataLoader] {
        &self.test_loaders
    }

    pub fn memory_loaders(&self) -> &[DataLoader] {
        &self.memory_loaders
    }

    /// Snapshot consumed by the score maskers.
    pub fn descriptor(&self) -> TaskDescriptor {
        let seen_classes = if self.all_classes_seen {
            self.settings.total_classes().max(self.cursor)
        } else {
            self.cursor
        };
        TaskDescriptor {
            seen_classes,
            classes_per_task: self.settings.classes_per_task,
            protocol: self.settings.protocol,
        }
    }

    /// Masks the shards to the next task's classes, registers the three
    /// loaders and moves the cursor forward by one task.
    pub fn advance_task(
        &mut self,
        train: &Shard,
        test: &Shard,
        memory: &Shard,
    ) -> Result<TaskLoaders> {
        let masker = TaskMasker::new(self.cursor, self.settings.classes_per_task);
        self.materialize(masker, train, test, memory)
    }

    /// Like [`advance_task`](Self::advance_task) but keeps every class, for
    /// non-continual baselines. The cursor still advances.
    pub fn advance_task_undivided(
        &mut self,
        train: &Shard,
        test: &Shard,
        memory: &Shard,
    ) -> Result<TaskLoaders> {
        let masker = TaskMasker::new(self.cursor, self.settings.classes_per_task).undivided();
        self.materialize(masker, train, test, memory)
    }

    fn materialize(
        &mut self,
        masker: TaskMasker,
        train: &Shard,
        test: &Shard,
        memory: &Shard,
    ) -> Result<TaskLoaders> {
        if self.is_exhausted() {
            return Err(ContinualError::InvalidArgument(format!(
                "all {} tasks of `{}` are already materialized",
                self.settings.n_tasks, self.settings.name
            )));
        }
        let task = self.tasks_seen();
        let masked = masker.apply(train, memory, test)?;
        debug!(
            task,
            classes = ?masker.range(),
            train = masked.train.len(),
            test = masked.test.len(),
            "masked task shards"
        );

        let seed = determinism::derive_seed(
            self.settings.seed,
            &format!("{}/train/task-{task}", self.settings.name),
        );
        let batch_size = self.settings.batch_size;
        let loaders = TaskLoaders {
            train: DataLoader::new(masked.train)
                .batched(batch_size)
                .shuffle(seed)
                .workers(self.settings.num_workers),
            memory: DataLoader::new(masked.memory).batched(batch_size),
            test: DataLoader::new(masked.test).batched(batch_size),
        };

        self.test_loaders.push(loaders.test.clone());
        self.train_loaders.push(loaders.train.clone());
        self.memory_loaders.push(loaders.memory.clone());
        self.train_loader = Some(loaders.train.clone());
        self.cursor += self.settings.classes_per_task;
        self.all_classes_seen |= !masker.divides_tasks();
        info!(task, cursor = self.cursor, "task materialized");
        Ok(loaders)
    }

    /// Shuffled loader over the classes of the task just before the cursor.
    pub fn previous_task_loader(&self, full_train: &Shard, batch_size: usize) -> Result<DataLoader> {
        let per_task = self.settings.classes_per_task;
        if self.cursor < per_task {
            return Err(ContinualError::NoPreviousTask {
                cursor: self.cursor,
                classes_per_task: per_task,
            });
        }
        let range = ClassRange::new(self.cursor - per_task, self.cursor);
        let mask = super::task_mask(full_train.targets(), range);
        let shard = full_train.select(&mask)?;
        let seed = determinism::derive_seed(
            self.settings.seed,
            &format!("{}/previous/{}", self.settings.name, range.start),
        );
        Ok(DataLoader::new(shard).batched(batch_size).shuffle(seed))
    }

    /// Rewinds the cursor and drops every registered loader.
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.all_classes_seen = false;
        self.train_loader = None;
        self.train_loaders.clear();
        self.test_loaders.clear();
        self.memory_loaders.clear();
    }
}

/// Source of per-task loaders for a benchmark.
pub trait SequentialDataset {
    fn state(&self) -> &ContinualDataset;

    /// Materializes the next task and returns its loaders.
    fn get_data_loaders(&mut self) -> Result<TaskLoaders>;

    /// Loader over the most recent task without augmentation.
    fn not_aug_dataloader(&self, batch_size: usize) -> Result<DataLoader>;
}

/// Benchmark backed by full train/memory/test shards kept in memory.
///
/// The memory shard holds the un-augmented view of the train samples, in the
/// same order.
#[derive(Debug)]
pub struct InMemorySequentialDataset {
    state: ContinualDataset,
    train: Shard,
    memory: Shard,
    test: Shard,
}

impl InMemorySequentialDataset {
    pub fn new(settings: ContinualSettings, train: Shard, memory: Shard, test: Shard) -> Result<Self> {
        if train.len() != memory.len() {
            return Err(ContinualError::Shape(format!(
                "memory shard has {} samples but train shard has {}",
                memory.len(),
                train.len()
            )));
        }
        Ok(Self {
            state: ContinualDataset::new(settings),
            train,
            memory,
            test,
        })
    }

    /// Serves every class in every task.
    pub fn undivided(mut self) -> Self {
        self.state.settings.divide_tasks = false;
        self
    }
}

impl SequentialDataset for InMemorySequentialDataset {
    fn state(&self) -> &ContinualDataset {
        &self.state
    }

    fn get_data_loaders(&mut self) -> Result<TaskLoaders> {
        if self.state.settings.divide_tasks {
            self.state.advance_task(&self.train, &self.test, &self.memory)
        } else {
            self.state
                .advance_task_undivided(&self.train, &self.test, &self.memory)
        }
    }

    fn not_aug_dataloader(&self, batch_size: usize) -> Result<DataLoader> {
        self.state.previous_task_loader(&self.memory, batch_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard(labels: &[usize]) -> Shard {
        let rows = labels.iter().enumerate().map(|(i, _)| vec![i as f32]).collect();
        Shard::from_rows(rows, labels.to_vec()).unwrap()
    }

    fn settings() -> ContinualSettings {
        ContinualSettings::new("seq-toy", 2, 2, 4).unwrap().with_seed(5)
    }

    #[test]
    fn advance_task_moves_cursor_and_registers_loaders() {
        let labels = [0, 0, 1, 1, 2, 2, 3, 3];
        let train = shard(&labels);
        let test = shard(&labels);
        let mut dataset = ContinualDataset::new(settings());

        let first = dataset.advance_task(&train, &test, &train).unwrap();
        assert_eq!(first.train.targets(), &[0, 0, 1, 1]);
        assert!(first.train.is_shuffled());
        assert!(!first.memory.is_shuffled());
        assert_eq!(dataset.cursor(), 2);

        let second = dataset.advance_task(&train, &test, &train).unwrap();
        assert_eq!(second.test.targets(), &[2, 2, 3, 3]);
        assert_eq!(dataset.cursor(), 4);
        assert_eq!(dataset.train_loaders().len(), 2);
        assert_eq!(dataset.test_loaders().len(), 2);
        assert_eq!(dataset.memory_loaders().len(), 2);
        assert_eq!(dataset.train_loader().unwrap().targets(), &[2, 2, 3, 3]);
    }

    #[test]
    fn advancing_past_the_last_task_fails() {
        let train = shard(&[0, 1, 2, 3]);
        let mut dataset = ContinualDataset::new(settings());
        dataset.advance_task(&train, &train, &train).unwrap();
        dataset.advance_task(&train, &train, &train).unwrap();
        assert!(dataset.is_exhausted());
        assert!(dataset.advance_task(&train, &train, &train).is_err());
        assert_eq!(dataset.cursor(), 4);
    }

    #[test]
    fn previous_task_loader_requires_a_completed_task() {
        let full = shard(&[0, 1, 2, 3, 2]);
        let mut dataset = ContinualDataset::new(settings());
        assert_eq!(
            dataset.previous_task_loader(&full, 2).unwrap_err(),
            ContinualError::NoPreviousTask {
                cursor: 0,
                classes_per_task: 2
            }
        );
        dataset.advance_task(&full, &full, &full).unwrap();
        dataset.advance_task(&full, &full, &full).unwrap();
        let previous = dataset.previous_task_loader(&full, 2).unwrap();
        let mut seen = previous.targets().to_vec();
        seen.sort_unstable();
        assert_eq!(seen, vec![2, 2, 3]);
    }

    #[test]
    fn undivided_dataset_serves_every_class() {
        let full = shard(&[0, 1, 2, 3]);
        let mut dataset =
            InMemorySequentialDataset::new(settings(), full.clone(), full.clone(), full)
                .unwrap()
                .undivided();
        let loaders = dataset.get_data_loaders().unwrap();
        assert_eq!(loaders.memory.len(), 4);
        assert_eq!(dataset.state().cursor(), 2);
        // labels 2 and 3 are already in the memory split
        assert_eq!(dataset.state().descriptor().seen_classes, 4);
    }

    #[test]
    fn task_division_flag_in_settings_selects_the_undivided_path() {
        let full = shard(&[0, 1, 2, 3]);
        let settings = settings().with_task_division(false);
        let mut dataset =
            InMemorySequentialDataset::new(settings, full.clone(), full.clone(), full).unwrap();
        let loaders = dataset.get_data_loaders().unwrap();
        assert_eq!(loaders.test.len(), 4);
        assert!(!dataset.state().settings().divide_tasks);
        dataset.state.reset();
        assert_eq!(dataset.state().descriptor().seen_classes, 0);
    }

    #[test]
    fn reset_rewinds_state() {
        let full = shard(&[0, 1, 2, 3]);
        let mut dataset = ContinualDataset::new(settings());
        dataset.advance_task(&full, &full, &full).unwrap();
        dataset.reset();
        assert_eq!(dataset.cursor(), 0);
        assert!(dataset.train_loader().is_none());
        assert!(dataset.memory_loaders().is_empty());
    }
}
