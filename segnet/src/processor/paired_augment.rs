use crate::{common::*, dataset::Sample, Error, Phase};

/// Builder of [PairedAugmentor].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairedAugmentorInit {
    /// The side length of the output image and mask.
    pub image_size: usize,
    /// The probability to apply the random transforms in training phase.
    pub augmentation_prob: R64,
    pub crop_size_min: usize,
    pub crop_size_max: usize,
    /// The candidate base rotations in degrees.
    pub rotation_degrees: Vec<i64>,
    /// The fine rotation is drawn from `-fine_rotation_range..=fine_rotation_range` degrees.
    pub fine_rotation_range: i64,
    pub flip_prob: R64,
}

impl Default for PairedAugmentorInit {
    fn default() -> Self {
        Self {
            image_size: 512,
            augmentation_prob: r64(0.4),
            crop_size_min: 300,
            crop_size_max: 500,
            rotation_degrees: vec![0, 90, 180, 270],
            fine_rotation_range: 10,
            flip_prob: r64(0.5),
        }
    }
}

impl PairedAugmentorInit {
    pub fn build(self) -> Result<PairedAugmentor> {
        let Self {
            image_size,
            augmentation_prob,
            crop_size_min,
            crop_size_max,
            rotation_degrees,
            fine_rotation_range,
            flip_prob,
        } = self;

        crate::ensure_config!(image_size > 0, "image_size must be positive");
        crate::ensure_config!(
            (0.0..=1.0).contains(&augmentation_prob.raw()),
            "augmentation_prob must be in range [0, 1], but get {}",
            augmentation_prob
        );
        crate::ensure_config!(crop_size_min > 0, "crop_size_min must be positive");
        crate::ensure_config!(
            crop_size_min <= crop_size_max,
            "crop_size_min ({}) must not exceed crop_size_max ({})",
            crop_size_min,
            crop_size_max
        );
        crate::ensure_config!(
            !rotation_degrees.is_empty(),
            "rotation_degrees must not be empty"
        );
        crate::ensure_config!(
            fine_rotation_range >= 0,
            "fine_rotation_range must be non-negative"
        );
        crate::ensure_config!(
            (0.0..=1.0).contains(&flip_prob.raw()),
            "flip_prob must be in range [0, 1], but get {}",
            flip_prob
        );

        Ok(PairedAugmentor {
            image_size: image_size as i64,
            augmentation_prob: augmentation_prob.raw(),
            crop_size_min: crop_size_min as i64,
            crop_size_max: crop_size_max as i64,
            rotation_degrees,
            fine_rotation_range,
            flip_prob: flip_prob.raw(),
        })
    }
}

/// Applies identical random geometric transforms to an image and its mask.
#[derive(Debug, Clone)]
pub struct PairedAugmentor {
    image_size: i64,
    augmentation_prob: f64,
    crop_size_min: i64,
    crop_size_max: i64,
    rotation_degrees: Vec<i64>,
    fine_rotation_range: i64,
    flip_prob: f64,
}

/// The randomly drawn parameters for one sample fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AugmentationPlan {
    /// Counter-clockwise base rotation in degrees.
    pub base_rotation: i64,
    /// Counter-clockwise fine rotation in degrees, applied after the base rotation.
    pub fine_rotation: i64,
    pub crop_size: i64,
    pub crop_top: i64,
    pub crop_left: i64,
    pub horizontal_flip: bool,
    pub vertical_flip: bool,
}

impl PairedAugmentor {
    pub fn image_size(&self) -> i64 {
        self.image_size
    }

    /// Check that every random crop fits into an image of the given size.
    ///
    /// Rotations keep the canvas size, so the crop window must fit into the
    /// original height and width.
    pub fn check_input_size(&self, height: i64, width: i64) -> Result<()> {
        crate::ensure_config!(
            self.crop_size_max <= height && self.crop_size_max <= width,
            "crop_size_max ({}) exceeds the image size {}x{}",
            self.crop_size_max,
            height,
            width
        );
        Ok(())
    }

    /// Draw the plan for one fetch.
    ///
    /// It returns `None` if the random transforms are skipped, either in
    /// evaluation phase or by chance.
    pub fn draw_plan<R>(
        &self,
        phase: Phase,
        height: i64,
        width: i64,
        rng: &mut R,
    ) -> Result<Option<AugmentationPlan>>
    where
        R: Rng,
    {
        let p: f64 = rng.gen();
        if !(phase.is_train() && p <= self.augmentation_prob) {
            return Ok(None);
        }

        let base_rotation = self.rotation_degrees[rng.gen_range(0..self.rotation_degrees.len())];
        let fine_rotation = rng.gen_range(-self.fine_rotation_range..=self.fine_rotation_range);

        let crop_size = rng.gen_range(self.crop_size_min..=self.crop_size_max);
        if crop_size > height || crop_size > width {
            return Err(Error::augmentation(format!(
                "crop size {} does not fit into the rotated image of size {}x{}",
                crop_size, height, width
            ))
            .into());
        }
        let crop_top = rng.gen_range(0..=(height - crop_size));
        let crop_left = rng.gen_range(0..=(width - crop_size));

        let horizontal_flip = rng.gen::<f64>() < self.flip_prob;
        let vertical_flip = rng.gen::<f64>() < self.flip_prob;

        Ok(Some(AugmentationPlan {
            base_rotation,
            fine_rotation,
            crop_size,
            crop_top,
            crop_left,
            horizontal_flip,
            vertical_flip,
        }))
    }

    /// Apply the geometric stage and resize the pair to the output size.
    ///
    /// Inputs and outputs are `Uint8` tensors in `[channels, height, width]` shape.
    pub fn transform<R>(
        &self,
        image: &Tensor,
        mask: &Tensor,
        phase: Phase,
        rng: &mut R,
    ) -> Result<(Tensor, Tensor)>
    where
        R: Rng,
    {
        let (height, width) = check_pair(image, mask)?;
        let plan = self.draw_plan(phase, height, width, rng)?;

        let (image, mask) = match plan {
            Some(plan) => plan.apply(image, mask)?,
            None => (image.shallow_clone(), mask.shallow_clone()),
        };

        self.resize_pair(&image, &mask)
    }

    /// Resize the image with bilinear interpolation and the mask with
    /// nearest-neighbor interpolation.
    pub fn resize_pair(&self, image: &Tensor, mask: &Tensor) -> Result<(Tensor, Tensor)> {
        check_pair(image, mask)?;
        let size = [self.image_size, self.image_size];

        let (image, mask) = tch::no_grad(|| {
            let image = image
                .to_kind(Kind::Float)
                .unsqueeze(0)
                .upsample_bilinear2d(&size, false, None, None)
                .squeeze_dim(0)
                .round()
                .clamp(0.0, 255.0)
                .to_kind(Kind::Uint8);
            let mask = mask
                .to_kind(Kind::Float)
                .unsqueeze(0)
                .upsample_nearest2d(&size, None, None)
                .squeeze_dim(0)
                .to_kind(Kind::Uint8);
            (image, mask)
        });

        Ok((image, mask))
    }

    /// Produce the model input from a sample.
    ///
    /// The image becomes a `Float` tensor normalized to `[-1, 1]` and the mask
    /// becomes an `Int64` label tensor, both of `image_size` height and width.
    pub fn augment<R>(&self, sample: &Sample, phase: Phase, rng: &mut R) -> Result<(Tensor, Tensor)>
    where
        R: Rng,
    {
        let (image, mask) = self.transform(sample.image(), sample.mask(), phase, rng)?;
        Ok(to_model_input(&image, &mask))
    }
}

impl AugmentationPlan {
    /// Apply rotations, crop and flips identically to the image and the mask.
    pub fn apply(&self, image: &Tensor, mask: &Tensor) -> Result<(Tensor, Tensor)> {
        let (height, width) = check_pair(image, mask)?;
        let Self {
            base_rotation,
            fine_rotation,
            crop_size,
            crop_top,
            crop_left,
            horizontal_flip,
            vertical_flip,
        } = *self;

        if crop_size <= 0
            || crop_top < 0
            || crop_left < 0
            || crop_top + crop_size > height
            || crop_left + crop_size > width
        {
            return Err(Error::augmentation(format!(
                "crop window {}x{} at ({}, {}) lies outside the image of size {}x{}",
                crop_size, crop_size, crop_top, crop_left, height, width
            ))
            .into());
        }

        let pair = tch::no_grad(|| {
            [image, mask].map(|tensor| {
                let tensor = rotate_nearest(tensor, base_rotation);
                let tensor = rotate_nearest(&tensor, fine_rotation);
                let tensor = tensor.i((
                    ..,
                    crop_top..(crop_top + crop_size),
                    crop_left..(crop_left + crop_size),
                ));
                let tensor = if horizontal_flip {
                    tensor.flip(&[2])
                } else {
                    tensor
                };
                if vertical_flip {
                    tensor.flip(&[1])
                } else {
                    tensor
                }
            })
        });
        let [image, mask] = pair;

        Ok((image, mask))
    }
}

/// Convert resized `Uint8` tensors to the model input.
pub fn to_model_input(image: &Tensor, mask: &Tensor) -> (Tensor, Tensor) {
    tch::no_grad(|| {
        let image = image.to_kind(Kind::Float) / 255.0;
        let image = (image - 0.5) / 0.5;
        let mask = (mask.to_kind(Kind::Float) / 255.0)
            .floor()
            .to_kind(Kind::Int64);
        (
            image.set_requires_grad(false),
            mask.set_requires_grad(false),
        )
    })
}

/// Rotate a `[channels, height, width]` tensor counter-clockwise around its
/// center. The canvas size is kept and uncovered pixels are filled with zeros.
fn rotate_nearest(tensor: &Tensor, degrees: i64) -> Tensor {
    if degrees.rem_euclid(360) == 0 {
        return tensor.shallow_clone();
    }

    let size = tensor.size();
    let (channels, height, width) = (size[0], size[1], size[2]);
    let kind = tensor.kind();
    let device = tensor.device();

    let radians = (degrees as f64).to_radians();
    let cos = radians.cos();
    let sin = radians.sin();
    let aspect = height as f64 / width as f64;

    // maps output coordinates to input coordinates in normalized units
    let theta = Tensor::of_slice(&[
        cos as f32,
        (-sin * aspect) as f32,
        0.0,
        (sin / aspect) as f32,
        cos as f32,
        0.0,
    ])
    .view([1, 2, 3])
    .to_device(device);

    let grid = Tensor::affine_grid_generator(&theta, &[1, channels, height, width], false);
    tensor
        .to_kind(Kind::Float)
        .unsqueeze(0)
        .grid_sampler(
            &grid, // nearest interpolation, zero padding
            1, 0, false,
        )
        .squeeze_dim(0)
        .to_kind(kind)
}

fn check_pair(image: &Tensor, mask: &Tensor) -> Result<(i64, i64)> {
    let (_, image_h, image_w) = image.size3()?;
    let (_, mask_h, mask_w) = mask.size3()?;
    ensure!(
        (image_h, image_w) == (mask_h, mask_w),
        "image size {}x{} does not match mask size {}x{}",
        image_h,
        image_w,
        mask_h,
        mask_w
    );
    Ok((image_h, image_w))
}
