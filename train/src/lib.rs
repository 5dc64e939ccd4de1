//! The training program for segnet project.

pub mod common;
pub mod config;
pub mod controller;
pub mod loader;
pub mod logging;
pub mod runner;
pub mod utils;

use crate::{
    common::*,
    config::{Config, TrainingConfig},
    controller::{EpochObserver, TrainingController},
    loader::DataLoader,
    logging::LoggingSender,
};
use segnet::ensure_config;

/// Create the timestamped logging directory and save the config into it.
///
/// The directory is `<logging.dir>/<start time>/` and holds the
/// `checkpoints/` directory and a copy of the config.
pub fn create_logging_dir(config: &Config, start_time: DateTime<Local>) -> Result<Arc<Path>> {
    let logging_dir = config
        .logging
        .dir
        .join(format!("{}", start_time.format(utils::FILE_STRFTIME)));
    std::fs::create_dir_all(logging_dir.join("checkpoints"))?;

    let text = serde_json::to_string_pretty(config)?;
    std::fs::write(logging_dir.join("config.json5"), text)?;

    Ok(logging_dir.into_boxed_path().into())
}

/// The entry of training program.
pub async fn start(config: Arc<Config>, logging_dir: Arc<Path>) -> Result<()> {
    let checkpoint_dir: Arc<Path> = logging_dir.join("checkpoints").into_boxed_path().into();
    info!("logging to {}", logging_dir.display());

    // start logger
    let (logging_tx, logging_rx) = mpsc::channel(2);
    let logging_future = logging::logging_worker(
        Arc::new(config.logging.clone()),
        logging_dir.clone(),
        logging_rx,
    );

    // training worker
    let training_future = {
        let logging_tx = LoggingSender::new(logging_tx);
        let span = info_span!("training_worker");

        tokio::task::spawn_blocking(move || {
            let _guard = span.enter();
            training_worker(config, checkpoint_dir, logging_tx)
        })
        .map(|result| Fallible::Ok(result??))
    };

    let (report, ()) = futures::try_join!(training_future, logging_future)?;
    info!(
        "training finished with accuracy {:.3} and unet score {:.3}",
        report.accuracy,
        report.combined_score()
    );

    Ok(())
}

/// Load the data, build the model and run all epochs.
///
/// It blocks the calling thread.
pub fn training_worker(
    config: Arc<Config>,
    checkpoint_dir: Arc<Path>,
    mut logging_tx: LoggingSender,
) -> Result<EpochReport> {
    let Config {
        model: ref model_config,
        ref dataset,
        ref preprocessor,
        loader: ref loader_config,
        training:
            TrainingConfig {
                epochs,
                seed,
                lr,
                beta1,
                beta2,
                device,
                ref load_checkpoint,
                save_checkpoint,
            },
        ..
    } = *config;

    info!("use device {:?}", device);
    tch::manual_seed(seed as i64);

    // init model
    info!("initializing model {}", model_config.model_type);
    let mut vs = nn::VarStore::new(device);
    let model = build_model(
        &model_config.model_type,
        &vs.root() / "model",
        &model_config.model_init(),
    )?;
    utils::try_load_checkpoint(&mut vs, &config.logging.dir, load_checkpoint)?;
    let mut optimizer = nn::Adam {
        beta1: beta1.raw(),
        beta2: beta2.raw(),
        wd: 0.0,
        ..Default::default()
    }
    .build(&vs, lr.raw())?;

    // load dataset
    info!("loading dataset from {}", dataset.root.display());
    let train_set = FolderDataset::load(&dataset.root, Split::Train)?;
    let test_set = FolderDataset::load(&dataset.root, Split::Test)?;
    info!(
        "loaded {} training and {} test samples",
        train_set.paths().len(),
        test_set.paths().len()
    );

    let augmentor = preprocessor.augmentor_init(dataset.image_size).build()?;
    for index in 0..train_set.paths().len() {
        let sample = train_set.sample(index)?;
        let (height, width) = sample.hw();
        augmentor.check_input_size(height, width)?;
    }
    for set in [&train_set, &test_set] {
        let channels = set.sample(0)?.channels();
        ensure_config!(
            channels == model_config.input_channels as i64,
            "the {} images have {} channels, but the model expects {}",
            set.split(),
            channels,
            model_config.input_channels
        );
    }

    let seeds = SeedSequence::new(seed);
    let train_loader = DataLoader::new(
        Arc::new(train_set.with_num_samples(dataset.data_num)),
        augmentor.clone(),
        loader_config.batching(Phase::Train),
        Phase::Train,
        seeds,
    );
    let eval_loader = DataLoader::new(
        Arc::new(test_set),
        augmentor,
        loader_config.batching(Phase::Eval),
        Phase::Eval,
        seeds,
    );

    // train
    info!("start training");
    let mut sink = logging_tx.clone();
    let mut observer = |phase: Phase, epoch: usize, report: &EpochReport| -> Result<()> {
        logging_tx.on_epoch_end(phase, epoch, report)?;

        if save_checkpoint && phase == Phase::Eval {
            let path =
                utils::save_checkpoint(&vs, &checkpoint_dir, epoch, report.combined_score())?;
            info!("saved checkpoint {}", path.display());
        }
        Ok(())
    };

    TrainingController { epochs, device }.run(
        &*model,
        &train_loader,
        &eval_loader,
        &mut optimizer,
        &mut sink,
        &mut observer,
    )
}
