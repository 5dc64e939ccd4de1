//! The segmentation model interface and its registered variants.

mod registry;
mod unet;

pub use registry::*;
pub use unet::*;

use crate::common::*;

/// A network mapping a `[batch, channels, height, width]` image batch to raw
/// per-pixel scores of the same height and width.
pub trait SegmentationModel
where
    Self: Debug + Send,
{
    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor>;
}

impl<M> SegmentationModel for Box<M>
where
    M: SegmentationModel + ?Sized,
{
    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        (**self).forward_t(input, train)
    }
}
