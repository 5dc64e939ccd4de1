//! Misc utilities.

mod checkpoint;
mod rate_counter;

pub use checkpoint::*;
pub use rate_counter::*;
