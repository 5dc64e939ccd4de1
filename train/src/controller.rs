//! Alternation of training and evaluation epochs.

use crate::{
    common::*,
    loader::DataLoader,
    runner::{ArtifactSink, EpochRunner, NullSink, Optimize},
};
use segnet::ensure_config;

/// Receives every epoch report as soon as it is produced.
pub trait EpochObserver {
    fn on_epoch_end(&mut self, phase: Phase, epoch: usize, report: &EpochReport) -> Result<()>;
}

impl<F> EpochObserver for F
where
    F: FnMut(Phase, usize, &EpochReport) -> Result<()>,
{
    fn on_epoch_end(&mut self, phase: Phase, epoch: usize, report: &EpochReport) -> Result<()> {
        self(phase, epoch, report)
    }
}

/// Runs a training epoch followed by an evaluation epoch, `epochs` times.
#[derive(Debug, Clone)]
pub struct TrainingController {
    pub epochs: usize,
    pub device: Device,
}

impl TrainingController {
    /// Train and evaluate the model, and return the last evaluation report.
    pub fn run<M>(
        &self,
        model: &M,
        train_loader: &DataLoader,
        eval_loader: &DataLoader,
        optimizer: &mut dyn Optimize,
        sink: &mut dyn ArtifactSink,
        observer: &mut dyn EpochObserver,
    ) -> Result<EpochReport>
    where
        M: SegmentationModel + ?Sized,
    {
        let Self { epochs, device } = *self;
        ensure_config!(epochs > 0, "epochs must be positive");
        ensure_config!(
            train_loader.phase() == Phase::Train && eval_loader.phase() == Phase::Eval,
            "the loaders are assigned to wrong phases"
        );

        let mut last_report = None;

        for epoch in 0..epochs {
            let report = EpochRunner {
                phase: Phase::Train,
                epoch,
                device,
            }
            .run(
                model,
                train_loader.epoch(epoch)?,
                Some(&mut *optimizer),
                &mut NullSink,
            )?;
            info!(
                "[Train] Epoch: [{}/{}] {} Loss: {:.3}",
                epoch,
                epochs,
                format_metrics(&report),
                report.loss
            );
            observer.on_epoch_end(Phase::Train, epoch, &report)?;

            let report = EpochRunner {
                phase: Phase::Eval,
                epoch,
                device,
            }
            .run(model, eval_loader.epoch(epoch)?, None, sink)?;
            info!(
                "[Test] Epoch: [{}/{}] {} Unet_score: {:.3}",
                epoch,
                epochs,
                format_metrics(&report),
                report.combined_score()
            );
            observer.on_epoch_end(Phase::Eval, epoch, &report)?;

            last_report = Some(report);
        }

        last_report.ok_or_else(|| format_err!("no epoch was run"))
    }
}

fn format_metrics(report: &EpochReport) -> String {
    let EpochReport {
        accuracy,
        sensitivity,
        specificity,
        precision,
        f1,
        jaccard,
        dice,
        ..
    } = *report;
    format!(
        "Acc: {:.3} SE: {:.3} SP: {:.3} PC: {:.3} F1: {:.3} JS: {:.3} DC: {:.3}",
        accuracy, sensitivity, specificity, precision, f1, jaccard, dice
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Batching;

    #[derive(Debug)]
    struct ThresholdModel {
        bias: Tensor,
    }

    impl SegmentationModel for ThresholdModel {
        fn forward_t(&self, input: &Tensor, _train: bool) -> Result<Tensor> {
            Ok(input.i((.., 0..1)) * 10.0 + &self.bias)
        }
    }

    fn loader(phase: Phase) -> DataLoader {
        let samples = (0..3).map(|index| {
            let mask = Tensor::zeros(&[1, 16, 16], (Kind::Uint8, Device::Cpu));
            let _ = mask.i((.., 0..(index + 1) * 3, ..)).fill_(255);
            let image = mask.expand(&[3, 16, 16], false).contiguous();
            Sample::new(image, mask).unwrap()
        });
        let augmentor = PairedAugmentorInit {
            image_size: 16,
            augmentation_prob: r64(0.5),
            crop_size_min: 8,
            crop_size_max: 12,
            ..Default::default()
        }
        .build()
        .unwrap();
        let batching = Batching {
            batch_size: NonZeroUsize::new(2).unwrap(),
            num_workers: NonZeroUsize::new(2).unwrap(),
            prefetch: NonZeroUsize::new(1).unwrap(),
            shuffle: true,
        };
        DataLoader::new(
            Arc::new(InMemoryDataset::new(samples)),
            augmentor,
            batching,
            phase,
            SeedSequence::new(11),
        )
    }

    #[test]
    fn epochs_alternate_train_and_eval() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = ThresholdModel {
            bias: vs.root().zeros("bias", &[1]),
        };
        let mut optimizer = nn::Adam::default().build(&vs, 1e-3)?;
        let controller = TrainingController {
            epochs: 3,
            device: Device::Cpu,
        };

        let mut events = vec![];
        let mut observer = |phase: Phase, epoch: usize, report: &EpochReport| -> Result<()> {
            events.push((phase, epoch, report.num_samples));
            Ok(())
        };

        let report = controller.run(
            &model,
            &loader(Phase::Train),
            &loader(Phase::Eval),
            &mut optimizer,
            &mut NullSink,
            &mut observer,
        )?;

        assert_eq!(
            events,
            vec![
                (Phase::Train, 0, 3),
                (Phase::Eval, 0, 3),
                (Phase::Train, 1, 3),
                (Phase::Eval, 1, 3),
                (Phase::Train, 2, 3),
                (Phase::Eval, 2, 3),
            ]
        );
        assert_eq!(report.num_batches, 2);
        assert!(report.accuracy > 0.9);

        // the optimizer updated the shared parameter
        let bias = f64::from(&model.bias);
        assert!(bias != 0.0);
        Ok(())
    }

    #[test]
    fn zero_epochs_is_rejected() {
        let controller = TrainingController {
            epochs: 0,
            device: Device::Cpu,
        };
        let model = ThresholdModel {
            bias: Tensor::zeros(&[1], (Kind::Float, Device::Cpu)),
        };
        let mut optimizer = NoopOptimizer;
        let mut observer = |_: Phase, _: usize, _: &EpochReport| -> Result<()> { Ok(()) };

        let err = controller
            .run(
                &model,
                &loader(Phase::Train),
                &loader(Phase::Eval),
                &mut optimizer,
                &mut NullSink,
                &mut observer,
            )
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<segnet::Error>(),
            Some(segnet::Error::Configuration(_))
        ));
    }

    struct NoopOptimizer;

    impl Optimize for NoopOptimizer {
        fn zero_grad(&mut self) {}

        fn backward_step(&mut self, _loss: &Tensor) -> Result<()> {
            Ok(())
        }
    }
}
