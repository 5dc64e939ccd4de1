use super::*;
use crate::common::*;

/// The dataset split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    Train,
    Test,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The random-access source of decoded (image, mask) pairs.
pub trait SampleSource
where
    Self: Debug + Send + Sync,
{
    /// Get number of samples in the dataset.
    fn num_samples(&self) -> usize;

    /// Get the nth sample. The index wraps around the number of samples.
    fn sample(&self, index: usize) -> Result<Arc<Sample>>;
}

impl<T> SampleSource for Arc<T>
where
    T: SampleSource + ?Sized,
{
    fn num_samples(&self) -> usize {
        (**self).num_samples()
    }

    fn sample(&self, index: usize) -> Result<Arc<Sample>> {
        (**self).sample(index)
    }
}

pub(crate) fn wrap_index(samples: &[Arc<Sample>], index: usize) -> Result<Arc<Sample>> {
    ensure!(!samples.is_empty(), "the dataset is empty");
    Ok(samples[index % samples.len()].clone())
}
