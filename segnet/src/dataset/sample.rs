use crate::common::*;

/// A decoded (image, mask) pair.
///
/// The image is a `[channels, height, width]` tensor and the mask is a
/// `[1, height, width]` tensor, both of `Uint8` kind. The pair is never
/// mutated after construction.
#[derive(Debug)]
pub struct Sample {
    image: Tensor,
    mask: Tensor,
}

impl Sample {
    pub fn new(image: Tensor, mask: Tensor) -> Result<Self> {
        let (_c, image_h, image_w) = image.size3()?;
        let (mask_c, mask_h, mask_w) = mask.size3()?;
        crate::ensure_config!(
            mask_c == 1,
            "the mask must have exactly one channel, but get {}",
            mask_c
        );
        crate::ensure_config!(
            (image_h, image_w) == (mask_h, mask_w),
            "image size {}x{} does not match mask size {}x{}",
            image_h,
            image_w,
            mask_h,
            mask_w
        );
        crate::ensure_config!(
            image.kind() == Kind::Uint8 && mask.kind() == Kind::Uint8,
            "expect Uint8 image and mask, but get {:?} and {:?}",
            image.kind(),
            mask.kind()
        );

        Ok(Self {
            image: image.set_requires_grad(false),
            mask: mask.set_requires_grad(false),
        })
    }

    pub fn image(&self) -> &Tensor {
        &self.image
    }

    pub fn mask(&self) -> &Tensor {
        &self.mask
    }

    /// The `(height, width)` shared by the image and the mask.
    pub fn hw(&self) -> (i64, i64) {
        let size = self.image.size();
        (size[1], size[2])
    }

    pub fn channels(&self) -> i64 {
        self.image.size()[0]
    }
}

// tensors are only read through shared references
unsafe impl Sync for Sample {}
