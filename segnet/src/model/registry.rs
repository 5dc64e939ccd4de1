use super::*;
use crate::Error;

/// The constructor of a registered model variant.
pub type ModelFactory = fn(&nn::Path, &ModelInit) -> Box<dyn SegmentationModel>;

/// Model variants addressable by name in configuration files.
pub static MODEL_REGISTRY: Lazy<IndexMap<&'static str, ModelFactory>> = Lazy::new(|| {
    let mut registry: IndexMap<&'static str, ModelFactory> = IndexMap::new();
    registry.insert("U_Net", build_unet as ModelFactory);
    registry.insert("AttU_Net", build_att_unet as ModelFactory);
    registry
});

fn build_unet(path: &nn::Path, init: &ModelInit) -> Box<dyn SegmentationModel> {
    Box::new(UNetInit::from(init).build(path))
}

fn build_att_unet(path: &nn::Path, init: &ModelInit) -> Box<dyn SegmentationModel> {
    Box::new(
        UNetInit {
            attention: true,
            ..UNetInit::from(init)
        }
        .build(path),
    )
}

/// The shape options shared by all model variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelInit {
    pub input_channels: usize,
    pub output_channels: usize,
    /// The channels of the first encoder stage. Every deeper stage doubles it.
    pub base_channels: usize,
}

impl Default for ModelInit {
    fn default() -> Self {
        Self {
            input_channels: 3,
            output_channels: 1,
            base_channels: 64,
        }
    }
}

/// Names of the registered model variants.
pub fn model_names() -> impl Iterator<Item = &'static str> {
    MODEL_REGISTRY.keys().copied()
}

/// Look up a model variant.
pub fn model_factory(name: &str) -> Result<ModelFactory> {
    MODEL_REGISTRY.get(name).copied().ok_or_else(|| {
        Error::configuration(format!(
            "unknown model type '{}', expect one of {}",
            name,
            model_names().join(", ")
        ))
        .into()
    })
}

/// Build a model variant by name under the variable path.
pub fn build_model<'p>(
    name: &str,
    path: impl Borrow<nn::Path<'p>>,
    init: &ModelInit,
) -> Result<Box<dyn SegmentationModel>> {
    let factory = model_factory(name)?;
    crate::ensure_config!(
        init.input_channels > 0 && init.output_channels > 0 && init.base_channels > 0,
        "model channels must be positive"
    );
    Ok(factory(path.borrow(), init))
}
