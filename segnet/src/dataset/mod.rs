//! Dataset loading toolkit.

mod dataset_;
mod folder;
mod in_memory;
mod sample;

pub use dataset_::*;
pub use folder::*;
pub use in_memory::*;
pub use sample::*;
