//! Common imports from external crates.

pub use anyhow::{bail, ensure, format_err, Context, Error, Result};
pub use approx::assert_abs_diff_eq;
pub use chrono::{DateTime, Local};
pub use futures::future::FutureExt;
pub use itertools::{izip, Itertools};
pub use noisy_float::prelude::*;
pub use once_cell::sync::Lazy;
pub use rand::{prelude::*, rngs::StdRng, seq::SliceRandom};
pub use regex::Regex;
pub use segnet::{
    dataset::{FolderDataset, InMemoryDataset, Sample, SampleSource, Split},
    metrics::{BatchMetrics, EpochAccumulator, EpochReport},
    model::{build_model, ModelInit, SegmentationModel},
    processor::{PairedAugmentor, PairedAugmentorInit},
    utils::SeedSequence,
    Phase,
};
pub use serde::{Deserialize, Serialize};
pub use std::{
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
pub use tch::{
    nn::{self, OptimizerConfig as _},
    Device, IndexOp, Kind, Reduction, Tensor,
};
pub use tfrecord::{EventWriter, EventWriterInit};
pub use tokio::sync::mpsc;
pub use tracing::{error, info, info_span, warn};

pub type Fallible<T> = Result<T, Error>;
