//! Training program configuration format.

use crate::common::*;
use segnet::{ensure_config, model::model_names};

pub use dataset::*;
pub use loader::*;
pub use model::*;
pub use training::*;

/// The main training configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub model: ModelConfig,
    pub dataset: DatasetConfig,
    pub logging: LoggingConfig,
    pub preprocessor: PreprocessorConfig,
    pub loader: LoaderConfig,
    pub training: TrainingConfig,
}

impl Config {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let text = std::fs::read_to_string(path)?;
        let config: Self = json5::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent settings before anything is loaded.
    pub fn validate(&self) -> Result<()> {
        let Self {
            model,
            dataset,
            preprocessor,
            training,
            ..
        } = self;

        ensure_config!(
            model_names().any(|name| name == model.model_type),
            "unknown model type '{}', expect one of {}",
            model.model_type,
            model_names().join(", ")
        );
        ensure_config!(
            model.input_channels > 0 && model.output_channels > 0 && model.base_channels > 0,
            "model channels must be positive"
        );
        ensure_config!(
            dataset.image_size.get() % 16 == 0,
            "image_size must be a multiple of 16, but get {}",
            dataset.image_size
        );
        ensure_config!(training.lr.raw() > 0.0, "lr must be positive");

        // the augmentor checks probabilities and crop bounds
        preprocessor.augmentor_init(dataset.image_size).build()?;
        Ok(())
    }
}

mod model {
    use super::*;

    /// The model configuration.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ModelConfig {
        /// The registered model name, `U_Net` or `AttU_Net`.
        pub model_type: String,
        #[serde(default = "default_input_channels")]
        pub input_channels: usize,
        #[serde(default = "default_output_channels")]
        pub output_channels: usize,
        #[serde(default = "default_base_channels")]
        pub base_channels: usize,
    }

    impl ModelConfig {
        pub fn model_init(&self) -> ModelInit {
            ModelInit {
                input_channels: self.input_channels,
                output_channels: self.output_channels,
                base_channels: self.base_channels,
            }
        }
    }

    fn default_input_channels() -> usize {
        3
    }

    fn default_output_channels() -> usize {
        1
    }

    fn default_base_channels() -> usize {
        64
    }
}

/// Data logging options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub dir: PathBuf,
    /// Also write evaluation images to the event file.
    #[serde(default)]
    pub enable_images: bool,
}

mod dataset {
    use super::*;

    /// Dataset options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct DatasetConfig {
        /// The directory containing `new_train_set` and `new_test_set`.
        pub root: PathBuf,
        /// The height and width of model inputs.
        #[serde(default = "default_image_size")]
        pub image_size: NonZeroUsize,
        /// If set, it overrides the number of training samples per epoch.
        #[serde(default)]
        pub data_num: Option<NonZeroUsize>,
    }

    fn default_image_size() -> NonZeroUsize {
        NonZeroUsize::new(512).unwrap()
    }
}

/// Data preprocessing options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessorConfig {
    /// The probability to apply the random transforms on a training sample.
    pub augmentation_prob: R64,
    #[serde(default = "default_crop_size_min")]
    pub crop_size_min: usize,
    #[serde(default = "default_crop_size_max")]
    pub crop_size_max: usize,
    /// Candidates of the base rotation in degrees.
    #[serde(default = "default_rotation_degrees")]
    pub rotation_degrees: Vec<i64>,
    /// The maximum absolute degrees of the fine rotation.
    #[serde(default = "default_fine_rotation_range")]
    pub fine_rotation_range: i64,
    /// The probability of each of horizontal and vertical flip.
    #[serde(default = "default_flip_prob")]
    pub flip_prob: R64,
}

impl PreprocessorConfig {
    pub fn augmentor_init(&self, image_size: NonZeroUsize) -> PairedAugmentorInit {
        let Self {
            augmentation_prob,
            crop_size_min,
            crop_size_max,
            ref rotation_degrees,
            fine_rotation_range,
            flip_prob,
        } = *self;

        PairedAugmentorInit {
            image_size: image_size.get(),
            augmentation_prob,
            crop_size_min,
            crop_size_max,
            rotation_degrees: rotation_degrees.clone(),
            fine_rotation_range,
            flip_prob,
        }
    }
}

fn default_crop_size_min() -> usize {
    300
}

fn default_crop_size_max() -> usize {
    500
}

fn default_rotation_degrees() -> Vec<i64> {
    vec![0, 90, 180, 270]
}

fn default_fine_rotation_range() -> i64 {
    10
}

fn default_flip_prob() -> R64 {
    r64(0.5)
}

mod loader {
    use super::*;

    /// Data loading options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct LoaderConfig {
        pub batch_size: NonZeroUsize,
        pub num_workers: NonZeroUsize,
        /// The number of batches each worker may produce ahead.
        #[serde(default = "default_prefetch")]
        pub prefetch: NonZeroUsize,
        /// Reshuffle training samples every epoch.
        #[serde(default = "default_shuffle")]
        pub shuffle: bool,
        #[serde(default = "default_eval_batch_size")]
        pub eval_batch_size: NonZeroUsize,
        #[serde(default = "default_eval_num_workers")]
        pub eval_num_workers: NonZeroUsize,
    }

    impl LoaderConfig {
        /// The batching options of the given phase.
        pub fn batching(&self, phase: Phase) -> Batching {
            match phase {
                Phase::Train => Batching {
                    batch_size: self.batch_size,
                    num_workers: self.num_workers,
                    prefetch: self.prefetch,
                    shuffle: self.shuffle,
                },
                Phase::Eval => Batching {
                    batch_size: self.eval_batch_size,
                    num_workers: self.eval_num_workers,
                    prefetch: self.prefetch,
                    shuffle: false,
                },
            }
        }
    }

    /// The batching options of one phase.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Batching {
        pub batch_size: NonZeroUsize,
        pub num_workers: NonZeroUsize,
        pub prefetch: NonZeroUsize,
        pub shuffle: bool,
    }

    fn default_prefetch() -> NonZeroUsize {
        NonZeroUsize::new(2).unwrap()
    }

    fn default_shuffle() -> bool {
        true
    }

    fn default_eval_batch_size() -> NonZeroUsize {
        NonZeroUsize::new(5).unwrap()
    }

    fn default_eval_num_workers() -> NonZeroUsize {
        NonZeroUsize::new(1).unwrap()
    }
}

mod training {
    use super::*;

    /// The training options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct TrainingConfig {
        pub epochs: usize,
        /// The global seed of augmentation, shuffling and parameter initialization.
        pub seed: u64,
        pub lr: R64,
        #[serde(default = "default_beta1")]
        pub beta1: R64,
        #[serde(default = "default_beta2")]
        pub beta2: R64,
        #[serde(with = "tch_serde::serde_device")]
        pub device: Device,
        /// Checkpoint file loading method.
        pub load_checkpoint: LoadCheckpoint,
        /// If set, it saves a checkpoint file after every epoch.
        #[serde(default)]
        pub save_checkpoint: bool,
    }

    /// Checkpoint file loading method.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum LoadCheckpoint {
        /// Disable checkpoint file loading.
        Disabled,
        /// Load the most recent checkpoint file.
        FromRecent,
        /// Load the checkpoint file at specified path.
        FromFile { file: PathBuf },
    }

    fn default_beta1() -> R64 {
        r64(0.5)
    }

    fn default_beta2() -> R64 {
        r64(0.999)
    }
}
