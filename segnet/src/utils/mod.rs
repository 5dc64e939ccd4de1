//! Misc utilities.

mod seed;

pub use seed::*;
