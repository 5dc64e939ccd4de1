use super::*;
use crate::common::*;

/// The dataset that keeps a list of samples built in memory.
#[derive(Derivative, Clone, Default)]
#[derivative(Debug)]
pub struct InMemoryDataset {
    #[derivative(Debug = "ignore")]
    samples: Vec<Arc<Sample>>,
}

impl InMemoryDataset {
    pub fn new(samples: impl IntoIterator<Item = Sample>) -> Self {
        Self {
            samples: samples.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn samples(&self) -> &[Arc<Sample>] {
        &self.samples
    }
}

impl SampleSource for InMemoryDataset {
    fn num_samples(&self) -> usize {
        self.samples.len()
    }

    fn sample(&self, index: usize) -> Result<Arc<Sample>> {
        wrap_index(&self.samples, index)
    }
}
