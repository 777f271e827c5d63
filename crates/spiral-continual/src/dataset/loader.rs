// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::Shard;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{seq::SliceRandom, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;

/// Mini-batch of stacked samples and their labels.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    pub inputs: Array2<f32>,
    pub targets: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

fn gather_batch(shard: &Shard, indices: &[usize]) -> Batch {
    let picked = shard.gather(indices);
    Batch {
        inputs: picked.data().clone(),
        targets: picked.targets().to_vec(),
    }
}

fn pass_order(len: usize, shuffle: Option<u64>, pass: u64) -> Arc<Vec<usize>> {
    let mut indices: Vec<usize> = (0..len).collect();
    if let Some(seed) = shuffle {
        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(pass));
        indices.shuffle(&mut rng);
    }
    Arc::new(indices)
}

struct ImmediateBatches {
    shard: Arc<Shard>,
    order: Arc<Vec<usize>>,
    batch_size: usize,
    position: usize,
}

impl Iterator for ImmediateBatches {
    type Item = Batch;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.order.len() {
            return None;
        }
        let start = self.position;
        let end = (start + self.batch_size).min(self.order.len());
        self.position = end;
        Some(gather_batch(&self.shard, &self.order[start..end]))
    }
}

struct PrefetchBatches {
    rx: Receiver<Batch>,
    handle: Option<thread::JoinHandle<()>>,
}

impl PrefetchBatches {
    fn spawn(shard: Arc<Shard>, order: Arc<Vec<usize>>, batch_size: usize, depth: usize) -> Self {
        let (tx, rx) = mpsc::sync_channel(depth.max(1));
        let handle = thread::spawn(move || {
            for indices in order.chunks(batch_size) {
                if tx.send(gather_batch(&shard, indices)).is_err() {
                    return;
                }
            }
        });
        Self {
            rx,
            handle: Some(handle),
        }
    }
}

impl Iterator for PrefetchBatches {
    type Item = Batch;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

impl Drop for PrefetchBatches {
    fn drop(&mut self) {
        // Dropping the receiver first unblocks a producer stuck on a full channel.
        let (_, dead) = mpsc::sync_channel(1);
        drop(std::mem::replace(&mut self.rx, dead));
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

enum Backend {
    Immediate(ImmediateBatches),
    Prefetch(PrefetchBatches),
}

/// Iterator over one pass of a [`DataLoader`].
pub struct Batches {
    backend: Backend,
}

impl Iterator for Batches {
    type Item = Batch;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.backend {
            Backend::Immediate(iter) => iter.next(),
            Backend::Prefetch(iter) => iter.next(),
        }
    }
}

/// Batched view over an owned shard.
///
/// Shuffled loaders draw a fresh permutation on every pass, derived from the
/// loader seed and the pass index, so runs are reproducible. Unshuffled
/// loaders always visit samples in shard order, which keeps feature-bank rows
/// aligned with their labels.
#[derive(Clone, Debug)]
pub struct DataLoader {
    shard: Arc<Shard>,
    batch_size: usize,
    shuffle: Option<u64>,
    workers: usize,
    passes: Arc<AtomicU64>,
}

impl DataLoader {
    /// Unshuffled loader with a batch size of one.
    pub fn new(shard: Shard) -> Self {
        Self {
            shard: Arc::new(shard),
            batch_size: 1,
            shuffle: None,
            workers: 0,
            passes: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn batched(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Reshuffles on every pass starting from `seed`.
    pub fn shuffle(mut self, seed: u64) -> Self {
        self.shuffle = Some(seed);
        self
    }

    /// Assembles batches on a background thread when `workers > 0`; the value
    /// doubles as the prefetch depth.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Number of samples behind the loader.
    pub fn len(&self) -> usize {
        self.shard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shard.is_empty()
    }

    pub fn num_batches(&self) -> usize {
        self.len().div_ceil(self.batch_size)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn is_shuffled(&self) -> bool {
        self.shuffle.is_some()
    }

    pub fn shard(&self) -> &Shard {
        &self.shard
    }

    pub fn targets(&self) -> &[usize] {
        self.shard.targets()
    }

    /// Starts a new pass over the shard.
    pub fn iter(&self) -> Batches {
        let pass = self.passes.fetch_add(1, Ordering::Relaxed);
        let order = pass_order(self.shard.len(), self.shuffle, pass);
        let shard = Arc::clone(&self.shard);
        let backend = if self.workers == 0 {
            Backend::Immediate(ImmediateBatches {
                shard,
                order,
                batch_size: self.batch_size,
                position: 0,
            })
        } else {
            Backend::Prefetch(PrefetchBatches::spawn(
                shard,
                order,
                self.batch_size,
                self.workers,
            ))
        };
        Batches { backend }
    }
}

impl<'a> IntoIterator for &'a DataLoader {
    type Item = Batch;
    type IntoIter = Batches;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
