//! The failure taxonomy of the training pipeline.
//!
//! Every variant travels inside [anyhow::Error]. Callers that need to tell
//! failures apart use `error.downcast_ref::<segnet::Error>()`.

use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum Error {
    /// Invalid settings or inconsistent input data, detected before training.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A sample cannot be augmented with the drawn plan.
    #[error("augmentation error: {0}")]
    Augmentation(String),
    /// A batch failed inside the model, loss or optimizer step.
    #[error("batch {batch} of epoch {epoch} failed")]
    BatchFailure { epoch: usize, batch: usize },
}

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn augmentation(msg: impl Into<String>) -> Self {
        Self::Augmentation(msg.into())
    }
}

/// Returns `Err(Error::Configuration)` when the condition is false.
#[macro_export]
macro_rules! ensure_config {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::Error::configuration(format!($($arg)+)).into());
        }
    };
}
