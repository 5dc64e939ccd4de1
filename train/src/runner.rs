//! One pass over a data split.

use crate::{common::*, loader::Batch, utils::RateCounter};
use segnet::{metrics::THRESHOLD, Error as SegError};

/// The optimizer as seen by the training loop.
pub trait Optimize {
    fn zero_grad(&mut self);

    /// Back-propagate the loss and update the parameters.
    fn backward_step(&mut self, loss: &Tensor) -> Result<()>;
}

impl Optimize for nn::Optimizer {
    fn zero_grad(&mut self) {
        nn::Optimizer::zero_grad(self);
    }

    fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        ensure!(
            loss.requires_grad(),
            "the loss is not connected to any trainable parameter"
        );
        loss.backward();
        self.step();
        Ok(())
    }
}

/// Qualitative outputs of an evaluation batch.
///
/// All tensors are on CPU and have shape `[batch, channels, height, width]`.
#[derive(Debug)]
pub struct EvalArtifacts {
    pub epoch: usize,
    /// The normalized input images.
    pub images: Tensor,
    pub ground_truth: Tensor,
    /// Sigmoid of the model output.
    pub probability: Tensor,
    /// The thresholded prediction.
    pub prediction: Tensor,
}

/// The storage collaborator that persists evaluation outputs.
pub trait ArtifactSink {
    fn save_artifacts(&mut self, artifacts: EvalArtifacts) -> Result<()>;
}

/// Discards all artifacts.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ArtifactSink for NullSink {
    fn save_artifacts(&mut self, _artifacts: EvalArtifacts) -> Result<()> {
        Ok(())
    }
}

/// Runs one epoch of one phase and produces its [EpochReport].
#[derive(Debug, Clone, Copy)]
pub struct EpochRunner {
    pub phase: Phase,
    pub epoch: usize,
    pub device: Device,
}

impl EpochRunner {
    /// Iterate over the batches, update the model in training phase and
    /// average the scores.
    ///
    /// A failing batch aborts the epoch. Model, loss and optimizer errors
    /// carry [segnet::Error::BatchFailure] with the epoch and the batch
    /// index. Errors from the batch source are returned as they are.
    pub fn run<M, B>(
        &self,
        model: &M,
        batches: B,
        optimizer: Option<&mut dyn Optimize>,
        sink: &mut dyn ArtifactSink,
    ) -> Result<EpochReport>
    where
        M: SegmentationModel + ?Sized,
        B: IntoIterator<Item = Result<Batch>>,
    {
        let _span = info_span!("epoch", phase = %self.phase, epoch = self.epoch).entered();

        match (self.phase, optimizer) {
            (Phase::Train, Some(optimizer)) => self.train(model, batches, optimizer),
            (Phase::Train, None) => {
                Err(SegError::configuration("training phase requires an optimizer").into())
            }
            (Phase::Eval, _) => tch::no_grad(|| self.eval(model, batches, sink)),
        }
    }

    fn train<M, B>(
        &self,
        model: &M,
        batches: B,
        optimizer: &mut dyn Optimize,
    ) -> Result<EpochReport>
    where
        M: SegmentationModel + ?Sized,
        B: IntoIterator<Item = Result<Batch>>,
    {
        let mut accumulator = EpochAccumulator::new();
        let mut rate_counter = RateCounter::with_second_interval();

        for (index, batch) in batches.into_iter().enumerate() {
            let Batch { images, masks, .. } = batch?.to_device(self.device);
            let (metrics, loss) = (|| -> Result<_> {
                optimizer.zero_grad();
                let output = model.forward_t(&images, true)?;
                let loss = segmentation_loss(&output, &masks)?;
                optimizer.backward_step(&loss)?;

                let metrics = tch::no_grad(|| BatchMetrics::score(&output.sigmoid(), &masks))?;
                Ok((metrics, f64::from(&loss)))
            })()
            .with_context(|| self.batch_failure(index))?;

            accumulator.add_batch(metrics, loss);
            self.report_progress(&mut rate_counter, index, metrics.num_samples);
        }

        accumulator.finish()
    }

    fn eval<M, B>(&self, model: &M, batches: B, sink: &mut dyn ArtifactSink) -> Result<EpochReport>
    where
        M: SegmentationModel + ?Sized,
        B: IntoIterator<Item = Result<Batch>>,
    {
        let mut accumulator = EpochAccumulator::new();
        let mut rate_counter = RateCounter::with_second_interval();
        let mut last_artifacts = None;

        for (index, batch) in batches.into_iter().enumerate() {
            let Batch { images, masks, .. } = batch?.to_device(self.device);
            let (metrics, loss, artifacts) = (|| -> Result<_> {
                let output = model.forward_t(&images, false)?;
                let loss = segmentation_loss(&output, &masks)?;
                let probability = output.sigmoid();
                let metrics = BatchMetrics::score(&probability, &masks)?;
                let prediction = probability.gt(THRESHOLD).to_kind(Kind::Float);

                let artifacts = EvalArtifacts {
                    epoch: self.epoch,
                    images: images.to_device(Device::Cpu),
                    ground_truth: masks.to_kind(Kind::Float).to_device(Device::Cpu),
                    probability: probability.to_device(Device::Cpu),
                    prediction: prediction.to_device(Device::Cpu),
                };
                Ok((metrics, f64::from(&loss), artifacts))
            })()
            .with_context(|| self.batch_failure(index))?;

            accumulator.add_batch(metrics, loss);
            last_artifacts = Some(artifacts);
            self.report_progress(&mut rate_counter, index, metrics.num_samples);
        }

        let report = accumulator.finish()?;
        if let Some(artifacts) = last_artifacts {
            sink.save_artifacts(artifacts)?;
        }
        Ok(report)
    }

    fn batch_failure(&self, batch: usize) -> SegError {
        SegError::BatchFailure {
            epoch: self.epoch,
            batch,
        }
    }

    fn report_progress(&self, rate_counter: &mut RateCounter, index: usize, num_samples: usize) {
        rate_counter.add(1.0);
        if let Some(batch_rate) = rate_counter.rate() {
            info!(
                "{}\tepoch: {}\tbatch: {}\t{:.2} batches/s\t{:.2} samples/s",
                self.phase,
                self.epoch,
                index,
                batch_rate,
                batch_rate * num_samples as f64
            );
        }
    }
}

/// Binary cross entropy with logits between the raw output and the mask,
/// flattened per sample.
pub fn segmentation_loss(output: &Tensor, masks: &Tensor) -> Result<Tensor> {
    ensure!(
        output.size() == masks.size(),
        "model output shape {:?} does not match mask shape {:?}",
        output.size(),
        masks.size()
    );
    let batch_size = output.size()[0];
    let logits = output.reshape(&[batch_size, -1]);
    let target = masks.to_kind(Kind::Float).reshape(&[batch_size, -1]);
    Ok(logits.binary_cross_entropy_with_logits::<Tensor>(&target, None, None, Reduction::Mean))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Batching, loader::DataLoader};
    use std::cell::Cell;

    const SIZE: i64 = 512;

    /// Outputs the foreground indicator encoded in the first image channel.
    #[derive(Debug)]
    struct GroundTruthModel {
        offset: Tensor,
        train_flags: Cell<(usize, usize)>,
        fail_at: Option<usize>,
        calls: Cell<usize>,
    }

    impl GroundTruthModel {
        fn new() -> Self {
            Self {
                offset: Tensor::zeros(&[1], (Kind::Float, Device::Cpu)).set_requires_grad(true),
                train_flags: Cell::new((0, 0)),
                fail_at: None,
                calls: Cell::new(0),
            }
        }
    }

    impl SegmentationModel for GroundTruthModel {
        fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
            let call = self.calls.get();
            self.calls.set(call + 1);
            ensure!(self.fail_at != Some(call), "device lost");

            let (train_calls, eval_calls) = self.train_flags.get();
            self.train_flags.set(if train {
                (train_calls + 1, eval_calls)
            } else {
                (train_calls, eval_calls + 1)
            });

            // normalized pixels are 1 for foreground and -1 for background
            let ground_truth = (input.i((.., 0..1)) + 1.0) / 2.0;
            Ok(ground_truth + &self.offset)
        }
    }

    #[derive(Debug, Default)]
    struct CountingOptimizer {
        zero_grads: usize,
        steps: usize,
    }

    impl Optimize for CountingOptimizer {
        fn zero_grad(&mut self) {
            self.zero_grads += 1;
        }

        fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
            ensure!(loss.requires_grad(), "no gradient");
            loss.backward();
            self.steps += 1;
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct CollectingSink {
        artifacts: Vec<EvalArtifacts>,
    }

    impl ArtifactSink for CollectingSink {
        fn save_artifacts(&mut self, artifacts: EvalArtifacts) -> Result<()> {
            self.artifacts.push(artifacts);
            Ok(())
        }
    }

    /// Samples whose image replicates a striped binary mask on every channel.
    fn striped_source(num_samples: usize) -> Arc<dyn SampleSource> {
        let samples = (0..num_samples).map(|index| {
            let period = index as i64 + 2;
            let rows = Tensor::arange(SIZE, (Kind::Int64, Device::Cpu))
                .remainder(period)
                .eq(0)
                .to_kind(Kind::Uint8)
                * 255;
            let mask = rows.view([1, SIZE, 1]).expand(&[1, SIZE, SIZE], false).contiguous();
            let image = mask.expand(&[3, SIZE, SIZE], false).contiguous();
            Sample::new(image, mask).unwrap()
        });
        Arc::new(InMemoryDataset::new(samples))
    }

    fn loader(source: Arc<dyn SampleSource>, phase: Phase, batch_size: usize) -> DataLoader {
        let augmentor = PairedAugmentorInit {
            image_size: SIZE as usize,
            augmentation_prob: r64(0.0),
            ..Default::default()
        }
        .build()
        .unwrap();
        let batching = Batching {
            batch_size: NonZeroUsize::new(batch_size).unwrap(),
            num_workers: NonZeroUsize::new(2).unwrap(),
            prefetch: NonZeroUsize::new(2).unwrap(),
            shuffle: true,
        };
        DataLoader::new(source, augmentor, batching, phase, SeedSequence::new(0))
    }

    fn runner(phase: Phase, epoch: usize) -> EpochRunner {
        EpochRunner {
            phase,
            epoch,
            device: Device::Cpu,
        }
    }

    #[test]
    fn ground_truth_model_scores_perfectly() -> Result<()> {
        let model = GroundTruthModel::new();
        let mut optimizer = CountingOptimizer::default();
        let loader = loader(striped_source(4), Phase::Train, 2);

        let report = runner(Phase::Train, 0).run(
            &model,
            loader.epoch(0)?,
            Some(&mut optimizer),
            &mut NullSink,
        )?;

        assert_eq!(report.num_samples, 4);
        assert_eq!(report.num_batches, 2);
        assert_abs_diff_eq!(report.accuracy, 1.0);
        assert_abs_diff_eq!(report.combined_score(), 2.0, epsilon = 1e-4);
        assert_eq!(optimizer.zero_grads, 2);
        assert_eq!(optimizer.steps, 2);
        assert_eq!(model.train_flags.get(), (2, 0));
        Ok(())
    }

    #[test]
    fn eval_emits_last_batch_artifacts() -> Result<()> {
        let model = GroundTruthModel::new();
        let loader = loader(striped_source(5), Phase::Eval, 2);
        let mut sink = CollectingSink::default();

        let report = runner(Phase::Eval, 3).run(&model, loader.epoch(3)?, None, &mut sink)?;

        assert_eq!(report.num_samples, 5);
        assert_eq!(report.num_batches, 3);
        assert_abs_diff_eq!(report.accuracy, 1.0);
        assert_eq!(model.train_flags.get(), (0, 3));

        assert_eq!(sink.artifacts.len(), 1);
        let artifacts = &sink.artifacts[0];
        assert_eq!(artifacts.epoch, 3);
        assert_eq!(artifacts.images.size(), vec![1, 3, SIZE, SIZE]);
        assert_eq!(artifacts.prediction.size(), vec![1, 1, SIZE, SIZE]);
        assert!(artifacts.prediction.equal(&artifacts.ground_truth));
        assert!(!artifacts.probability.requires_grad());
        Ok(())
    }

    #[test]
    fn failing_batch_aborts_epoch() -> Result<()> {
        let model = GroundTruthModel {
            fail_at: Some(1),
            ..GroundTruthModel::new()
        };
        let mut optimizer = CountingOptimizer::default();
        let loader = loader(striped_source(6), Phase::Train, 2);

        let err = runner(Phase::Train, 4)
            .run(&model, loader.epoch(4)?, Some(&mut optimizer), &mut NullSink)
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<SegError>(),
            Some(SegError::BatchFailure { epoch: 4, batch: 1 })
        ));
        assert_eq!(optimizer.steps, 1);
        Ok(())
    }

    #[test]
    fn augmentation_failure_keeps_its_class() -> Result<()> {
        let model = GroundTruthModel::new();
        let mut optimizer = CountingOptimizer::default();
        let augmentor = PairedAugmentorInit {
            image_size: SIZE as usize,
            augmentation_prob: r64(1.0),
            crop_size_min: 600,
            crop_size_max: 600,
            ..Default::default()
        }
        .build()?;
        let batching = Batching {
            batch_size: NonZeroUsize::new(2).unwrap(),
            num_workers: NonZeroUsize::new(1).unwrap(),
            prefetch: NonZeroUsize::new(1).unwrap(),
            shuffle: true,
        };
        let loader = DataLoader::new(
            striped_source(2),
            augmentor,
            batching,
            Phase::Train,
            SeedSequence::new(0),
        );

        let err = runner(Phase::Train, 2)
            .run(&model, loader.epoch(2)?, Some(&mut optimizer), &mut NullSink)
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<SegError>(),
            Some(SegError::Augmentation(_))
        ));
        assert_eq!(model.calls.get(), 0);
        assert_eq!(optimizer.steps, 0);
        Ok(())
    }

    #[test]
    fn train_without_optimizer_is_rejected() -> Result<()> {
        let model = GroundTruthModel::new();
        let loader = loader(striped_source(2), Phase::Train, 2);

        let err = runner(Phase::Train, 0)
            .run(&model, loader.epoch(0)?, None, &mut NullSink)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SegError>(),
            Some(SegError::Configuration(_))
        ));
        assert_eq!(model.calls.get(), 0);
        Ok(())
    }

    #[test]
    fn empty_epoch_is_rejected() {
        let model = GroundTruthModel::new();
        let source: Arc<dyn SampleSource> = Arc::new(InMemoryDataset::new(vec![]));
        let batches = loader(source, Phase::Eval, 2).epoch(0).unwrap();

        let err = runner(Phase::Eval, 0)
            .run(&model, batches, None, &mut NullSink)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SegError>(),
            Some(SegError::Configuration(_))
        ));
    }

    #[test]
    fn loss_requires_matching_shapes() {
        let output = Tensor::zeros(&[2, 1, 4, 4], (Kind::Float, Device::Cpu));
        let masks = Tensor::zeros(&[2, 1, 4, 5], (Kind::Int64, Device::Cpu));
        assert!(segmentation_loss(&output, &masks).is_err());
    }
}
