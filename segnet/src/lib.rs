//! The building blocks of binary image segmentation training.

mod common;
pub mod dataset;
pub mod error;
pub mod metrics;
pub mod model;
mod phase;
pub mod processor;
pub mod utils;

pub use error::Error;
pub use phase::Phase;
