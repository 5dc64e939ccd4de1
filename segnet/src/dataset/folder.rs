use super::*;
use crate::{common::*, Error};

/// The dataset stored in the `new_<split>_set/<split>_img` and
/// `new_<split>_set/<split>_label` directory layout.
///
/// Each image file has a label file of the same name in the sibling label
/// directory. All pairs are decoded when the dataset is loaded.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct FolderDataset {
    split: Split,
    paths: Vec<(PathBuf, PathBuf)>,
    #[derivative(Debug = "ignore")]
    samples: Vec<Arc<Sample>>,
    num_samples: Option<NonZeroUsize>,
}

impl FolderDataset {
    pub fn load(root: impl AsRef<Path>, split: Split) -> Result<Self> {
        let root = root.as_ref();
        let set_dir = root.join(format!("new_{}_set", split));
        let image_dir = set_dir.join(format!("{}_img", split));
        let label_dir = set_dir.join(format!("{}_label", split));

        let pattern = format!("{}/*.png", image_dir.display());
        let mut image_paths: Vec<PathBuf> = glob::glob(&pattern)
            .with_context(|| format!("invalid glob pattern '{}'", pattern))?
            .try_collect()?;
        image_paths.sort();

        crate::ensure_config!(
            !image_paths.is_empty(),
            "no images found in '{}'",
            image_dir.display()
        );

        let paths: Vec<_> = image_paths
            .into_iter()
            .map(|image_path| -> Result<_> {
                let file_name = image_path
                    .file_name()
                    .ok_or_else(|| format_err!("invalid path {}", image_path.display()))?;
                let label_path = label_dir.join(file_name);
                crate::ensure_config!(
                    label_path.is_file(),
                    "label file '{}' for image '{}' does not exist",
                    label_path.display(),
                    image_path.display()
                );
                Ok((image_path, label_path))
            })
            .try_collect()?;

        let samples: Vec<_> = paths
            .iter()
            .map(|(image_path, label_path)| load_sample(image_path, label_path).map(Arc::new))
            .try_collect()?;

        info!(
            "loaded {} samples from '{}' split",
            samples.len(),
            split.as_str()
        );

        Ok(Self {
            split,
            paths,
            samples,
            num_samples: None,
        })
    }

    /// Override the dataset length. Indexes beyond the number of loaded
    /// samples wrap around.
    pub fn with_num_samples(self, num_samples: Option<NonZeroUsize>) -> Self {
        Self {
            num_samples,
            ..self
        }
    }

    pub fn split(&self) -> Split {
        self.split
    }

    /// The (image, label) file pairs in enumeration order.
    pub fn paths(&self) -> &[(PathBuf, PathBuf)] {
        &self.paths
    }
}

impl SampleSource for FolderDataset {
    fn num_samples(&self) -> usize {
        match self.num_samples {
            Some(num) => num.get(),
            None => self.samples.len(),
        }
    }

    fn sample(&self, index: usize) -> Result<Arc<Sample>> {
        wrap_index(&self.samples, index)
    }
}

fn load_sample(image_path: &Path, label_path: &Path) -> Result<Sample> {
    let image = tch::vision::image::load(image_path)
        .with_context(|| format!("failed to load image file {}", image_path.display()))?;
    let mask = tch::vision::image::load(label_path)
        .with_context(|| format!("failed to load label file {}", label_path.display()))?;

    // labels are single-channel; the decoder always yields three channels
    let mask = mask.i(0..1).contiguous();

    Sample::new(image, mask).map_err(|err| match err.downcast::<Error>() {
        Ok(Error::Configuration(msg)) => {
            Error::configuration(format!("{}: {}", image_path.display(), msg)).into()
        }
        Ok(other) => other.into(),
        Err(err) => err,
    })
}
