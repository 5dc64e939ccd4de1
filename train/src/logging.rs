//! Data logging toolkit.

use crate::{
    common::*,
    config::LoggingConfig,
    controller::EpochObserver,
    runner::{ArtifactSink, EvalArtifacts},
};
use async_std::{fs::File, io::BufWriter};

pub use logging_message::*;
pub use logging_worker::*;

mod logging_message {
    use super::*;

    /// The message consumed by [LoggingWorker].
    #[derive(Debug)]
    pub enum LoggingMessage {
        EpochReport {
            phase: Phase,
            epoch: usize,
            report: EpochReport,
        },
        EvalImages(EvalArtifacts),
    }

    /// The sending half of the logging channel, used from the blocking
    /// training thread.
    #[derive(Debug, Clone)]
    pub struct LoggingSender {
        tx: mpsc::Sender<LoggingMessage>,
    }

    impl LoggingSender {
        pub fn new(tx: mpsc::Sender<LoggingMessage>) -> Self {
            Self { tx }
        }

        /// Send a message, blocking while the channel is full.
        ///
        /// It must not be called within an async context.
        pub fn send(&self, msg: LoggingMessage) -> Result<()> {
            self.tx
                .blocking_send(msg)
                .map_err(|_| format_err!("cannot send message to logger"))
        }
    }

    impl ArtifactSink for LoggingSender {
        fn save_artifacts(&mut self, artifacts: EvalArtifacts) -> Result<()> {
            self.send(LoggingMessage::EvalImages(artifacts))
        }
    }

    impl EpochObserver for LoggingSender {
        fn on_epoch_end(
            &mut self,
            phase: Phase,
            epoch: usize,
            report: &EpochReport,
        ) -> Result<()> {
            self.send(LoggingMessage::EpochReport {
                phase,
                epoch,
                report: *report,
            })
        }
    }
}

mod logging_worker {
    use super::*;

    /// Start the data logging worker and run until all senders are dropped.
    pub async fn logging_worker(
        config: Arc<LoggingConfig>,
        logging_dir: Arc<Path>,
        rx: mpsc::Receiver<LoggingMessage>,
    ) -> Result<()> {
        LoggingWorker::new(config, logging_dir, rx)
            .await?
            .start()
            .await
    }

    /// The data logging worker.
    ///
    /// Epoch reports go to a TensorBoard event file under `events/` and
    /// evaluation images to PNG files under `result/`.
    #[derive(Debug)]
    pub struct LoggingWorker {
        config: Arc<LoggingConfig>,
        result_dir: PathBuf,
        event_writer: EventWriter<BufWriter<File>>,
        rx: mpsc::Receiver<LoggingMessage>,
    }

    impl LoggingWorker {
        /// Create a data logging worker.
        pub async fn new(
            config: Arc<LoggingConfig>,
            logging_dir: Arc<Path>,
            rx: mpsc::Receiver<LoggingMessage>,
        ) -> Result<Self> {
            // prepare dirs
            let event_dir = logging_dir.join("events");
            let result_dir = logging_dir.join("result");
            let event_path_prefix = event_dir
                .join("segnet")
                .into_os_string()
                .into_string()
                .map_err(|path| format_err!("non-unicode path {:?}", path))?;

            tokio::fs::create_dir_all(&event_dir).await?;
            tokio::fs::create_dir_all(&result_dir).await?;

            let event_writer = EventWriterInit::default()
                .from_prefix_async(event_path_prefix, None)
                .await?;

            Ok(Self {
                config,
                result_dir,
                event_writer,
                rx,
            })
        }

        /// Start the data logging worker.
        pub async fn start(mut self) -> Result<()> {
            while let Some(msg) = self.rx.recv().await {
                match msg {
                    LoggingMessage::EpochReport {
                        phase,
                        epoch,
                        report,
                    } => {
                        self.log_epoch_report(phase, epoch, &report).await?;
                    }
                    LoggingMessage::EvalImages(artifacts) => {
                        self.log_eval_images(artifacts).await?;
                    }
                }
            }

            self.event_writer.flush_async().await?;
            Ok(())
        }

        async fn log_epoch_report(
            &mut self,
            phase: Phase,
            epoch: usize,
            report: &EpochReport,
        ) -> Result<()> {
            let step = epoch as i64;
            let EpochReport {
                accuracy,
                sensitivity,
                specificity,
                precision,
                f1,
                jaccard,
                dice,
                loss,
                ..
            } = *report;

            let scalars = [
                ("accuracy", accuracy),
                ("sensitivity", sensitivity),
                ("specificity", specificity),
                ("precision", precision),
                ("f1", f1),
                ("jaccard", jaccard),
                ("dice", dice),
            ];
            for (name, value) in scalars {
                self.event_writer
                    .write_scalar_async(format!("{}/metrics/{}", phase, name), step, value as f32)
                    .await?;
            }

            self.event_writer
                .write_scalar_async(format!("{}/loss", phase), step, loss as f32)
                .await?;

            if phase == Phase::Eval {
                self.event_writer
                    .write_scalar_async(
                        format!("{}/unet_score", phase),
                        step,
                        report.combined_score() as f32,
                    )
                    .await?;
            }

            Ok(())
        }

        async fn log_eval_images(&mut self, artifacts: EvalArtifacts) -> Result<()> {
            let EvalArtifacts {
                epoch,
                images,
                ground_truth,
                probability,
                prediction,
            } = artifacts;
            let step = epoch as i64;

            // the input images are normalized to [-1, 1]
            let images = images * 0.5 + 0.5;
            let named_images = vec![
                ("image", images),
                ("GT", ground_truth),
                ("SR", probability),
                ("PRE", prediction),
            ];

            // write png files
            let named_images = {
                let result_dir = self.result_dir.clone();
                tokio::task::spawn_blocking(move || -> Result<_> {
                    for (kind, batch) in &named_images {
                        let path = result_dir.join(format!("epoch-{}-{}.png", epoch, kind));
                        tch::vision::image::save(&image_grid(batch)?, &path).with_context(|| {
                            format!("failed to save image file '{}'", path.display())
                        })?;
                    }
                    Ok(named_images)
                })
                .await??
            };

            if self.config.enable_images {
                for (kind, batch) in named_images {
                    self.event_writer
                        .write_image_list_async(
                            format!("test/image/{}", kind),
                            step,
                            batch.clamp(0.0, 1.0),
                        )
                        .await?;
                }
            }

            Ok(())
        }
    }

    /// Tile a `[batch, channels, height, width]` tensor of values in `[0, 1]`
    /// from left to right into a `[3, height, batch * width]` `Uint8` image.
    pub fn image_grid(batch: &Tensor) -> Result<Tensor> {
        let (batch_size, channels, height, width) = batch.size4()?;
        ensure!(
            channels == 1 || channels == 3,
            "expect 1 or 3 channels, but get {}",
            channels
        );

        let grid = batch
            .permute(&[1, 2, 0, 3])
            .reshape(&[channels, height, batch_size * width])
            .expand(&[3, height, batch_size * width], false)
            .clamp(0.0, 1.0);
        let grid = (grid * 255.0).round().to_kind(Kind::Uint8).contiguous();
        Ok(grid)
    }
}
