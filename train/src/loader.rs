//! The parallel data loading worker pool.

use crate::{common::*, config::Batching};
use std::thread::JoinHandle;

/// The stream key of the per-epoch shuffling order.
const SHUFFLE_STREAM: u64 = 0x5348_5546;

/// A batch of model inputs.
#[derive(Debug)]
pub struct Batch {
    /// `[batch, channels, size, size]` normalized `Float` images.
    pub images: Tensor,
    /// `[batch, 1, size, size]` `Int64` labels.
    pub masks: Tensor,
    /// The sample indices the batch is made of.
    pub indices: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn to_device(&self, device: Device) -> Self {
        Self {
            images: self.images.to_device(device),
            masks: self.masks.to_device(device),
            indices: self.indices.clone(),
        }
    }
}

/// Produces the batches of one phase, epoch by epoch.
///
/// Batches are augmented by `num_workers` threads ahead of the consumer.
/// The `b`-th batch of an epoch is always produced by worker `b % num_workers`
/// with the worker's own generator, so the output only depends on the seed
/// and not on thread timing.
#[derive(Debug, Clone)]
pub struct DataLoader {
    source: Arc<dyn SampleSource>,
    augmentor: Arc<PairedAugmentor>,
    batching: Batching,
    phase: Phase,
    seeds: SeedSequence,
}

impl DataLoader {
    pub fn new(
        source: Arc<dyn SampleSource>,
        augmentor: PairedAugmentor,
        batching: Batching,
        phase: Phase,
        seeds: SeedSequence,
    ) -> Self {
        Self {
            source,
            augmentor: Arc::new(augmentor),
            batching,
            phase,
            seeds,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn num_samples(&self) -> usize {
        self.source.num_samples()
    }

    /// The number of batches per epoch. The last batch may be smaller.
    pub fn num_batches(&self) -> usize {
        let batch_size = self.batching.batch_size.get();
        (self.num_samples() + batch_size - 1) / batch_size
    }

    /// The sample order of an epoch.
    pub fn order(&self, epoch: usize) -> Vec<usize> {
        let mut order: Vec<_> = (0..self.num_samples()).collect();
        if self.phase.is_train() && self.batching.shuffle {
            let mut rng = self.seeds.rng(&[SHUFFLE_STREAM, epoch as u64]);
            order.shuffle(&mut rng);
        }
        order
    }

    /// Start the workers of an epoch.
    pub fn epoch(&self, epoch: usize) -> Result<BatchIter> {
        let batches: Vec<Vec<usize>> = self
            .order(epoch)
            .chunks(self.batching.batch_size.get())
            .map(|chunk| chunk.to_vec())
            .collect();
        let num_batches = batches.len();
        let num_workers = self.batching.num_workers.get().min(num_batches).max(1);

        let workers = (0..num_workers).map(|worker| -> Result<_> {
            let (tx, rx) = flume::bounded(self.batching.prefetch.get());
            let jobs: Vec<_> = batches
                .iter()
                .skip(worker)
                .step_by(num_workers)
                .cloned()
                .collect();
            let source = self.source.clone();
            let augmentor = self.augmentor.clone();
            let phase = self.phase;
            let mut rng = self.seeds.rng(&[phase.key(), epoch as u64, worker as u64]);

            let handle = thread::Builder::new()
                .name(format!("loader-{}-{}", phase, worker))
                .spawn(move || {
                    for indices in jobs {
                        let result =
                            load_batch(&*source, &augmentor, phase, &mut rng, indices);
                        let failed = result.is_err();
                        if tx.send(result).is_err() || failed {
                            break;
                        }
                    }
                })?;

            Ok((rx, handle))
        });
        let (receivers, handles): (Vec<_>, Vec<_>) =
            itertools::process_results(workers, |iter| iter.unzip())?;

        Ok(BatchIter {
            receivers,
            handles,
            next_batch: 0,
            num_batches,
        })
    }
}

fn load_batch<R>(
    source: &dyn SampleSource,
    augmentor: &PairedAugmentor,
    phase: Phase,
    rng: &mut R,
    indices: Vec<usize>,
) -> Result<Batch>
where
    R: Rng,
{
    let pairs = indices.iter().map(|&index| -> Result<_> {
        let sample = source.sample(index)?;
        augmentor
            .augment(&sample, phase, rng)
            .with_context(|| format!("failed to process sample {}", index))
    });
    let (images, masks): (Vec<_>, Vec<_>) =
        itertools::process_results(pairs, |iter| iter.unzip())?;

    Ok(Batch {
        images: Tensor::stack(&images, 0),
        masks: Tensor::stack(&masks, 0),
        indices,
    })
}

/// The in-order batch iterator of one epoch.
///
/// Dropping it stops the workers and discards the batches in flight.
#[derive(Debug)]
pub struct BatchIter {
    receivers: Vec<flume::Receiver<Result<Batch>>>,
    handles: Vec<JoinHandle<()>>,
    next_batch: usize,
    num_batches: usize,
}

impl BatchIter {
    pub fn num_batches(&self) -> usize {
        self.num_batches
    }
}

impl Iterator for BatchIter {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_batch >= self.num_batches {
            return None;
        }

        let worker = self.next_batch % self.receivers.len();
        let result = match self.receivers[worker].recv() {
            Ok(result) => result,
            Err(_) => Err(format_err!("data loading worker {} stopped", worker)),
        };

        // stop after the first failure
        self.next_batch = if result.is_ok() {
            self.next_batch + 1
        } else {
            self.num_batches
        };
        Some(result)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.num_batches - self.next_batch;
        (0, Some(remaining))
    }
}

impl Drop for BatchIter {
    fn drop(&mut self) {
        // disconnect first so that blocked workers return
        self.receivers.clear();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("a data loading worker panicked");
            }
        }
    }
}
