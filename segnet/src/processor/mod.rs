//! Data preprocessing building blocks.

pub mod paired_augment;

pub use paired_augment::*;
