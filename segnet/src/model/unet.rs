use super::*;

const DEPTH: usize = 5;

/// Two 3x3 convolutions, each followed by batch normalization and ReLU.
#[derive(Debug, Clone)]
pub struct ConvBlockInit {
    pub in_c: usize,
    pub out_c: usize,
}

impl ConvBlockInit {
    pub fn build<'p, P>(self, path: P) -> ConvBlock
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let Self { in_c, out_c } = self;
        let config = nn::ConvConfig {
            padding: 1,
            ..Default::default()
        };

        ConvBlock {
            conv1: nn::conv2d(path / "conv1", in_c as i64, out_c as i64, 3, config),
            bn1: nn::batch_norm2d(path / "bn1", out_c as i64, Default::default()),
            conv2: nn::conv2d(path / "conv2", out_c as i64, out_c as i64, 3, config),
            bn2: nn::batch_norm2d(path / "bn2", out_c as i64, Default::default()),
        }
    }
}

#[derive(Debug)]
pub struct ConvBlock {
    conv1: nn::Conv2D,
    bn1: nn::BatchNorm,
    conv2: nn::Conv2D,
    bn2: nn::BatchNorm,
}

impl nn::ModuleT for ConvBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        xs.apply(&self.conv1)
            .apply_t(&self.bn1, train)
            .relu()
            .apply(&self.conv2)
            .apply_t(&self.bn2, train)
            .relu()
    }
}

/// Nearest 2x up-sampling followed by a 3x3 convolution.
#[derive(Debug)]
pub struct UpConv {
    conv: nn::Conv2D,
    bn: nn::BatchNorm,
}

impl UpConv {
    pub fn new<'p>(path: impl Borrow<nn::Path<'p>>, in_c: usize, out_c: usize) -> Self {
        let path = path.borrow();
        let config = nn::ConvConfig {
            padding: 1,
            ..Default::default()
        };

        Self {
            conv: nn::conv2d(path / "conv", in_c as i64, out_c as i64, 3, config),
            bn: nn::batch_norm2d(path / "bn", out_c as i64, Default::default()),
        }
    }
}

impl nn::ModuleT for UpConv {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let size = xs.size();
        let (h, w) = (size[2], size[3]);
        xs.upsample_nearest2d(&[h * 2, w * 2], None, None)
            .apply(&self.conv)
            .apply_t(&self.bn, train)
            .relu()
    }
}

/// Additive attention gate that weights skip features by the decoder signal.
#[derive(Debug)]
pub struct AttentionGate {
    w_g: nn::Conv2D,
    bn_g: nn::BatchNorm,
    w_x: nn::Conv2D,
    bn_x: nn::BatchNorm,
    psi: nn::Conv2D,
    bn_psi: nn::BatchNorm,
}

impl AttentionGate {
    pub fn new<'p>(path: impl Borrow<nn::Path<'p>>, g_c: usize, x_c: usize, inter_c: usize) -> Self {
        let path = path.borrow();
        let config = Default::default();

        Self {
            w_g: nn::conv2d(path / "w_g", g_c as i64, inter_c as i64, 1, config),
            bn_g: nn::batch_norm2d(path / "bn_g", inter_c as i64, Default::default()),
            w_x: nn::conv2d(path / "w_x", x_c as i64, inter_c as i64, 1, config),
            bn_x: nn::batch_norm2d(path / "bn_x", inter_c as i64, Default::default()),
            psi: nn::conv2d(path / "psi", inter_c as i64, 1, 1, config),
            bn_psi: nn::batch_norm2d(path / "bn_psi", 1, Default::default()),
        }
    }

    pub fn forward_t(&self, gate: &Tensor, skip: &Tensor, train: bool) -> Tensor {
        let g1 = gate.apply(&self.w_g).apply_t(&self.bn_g, train);
        let x1 = skip.apply(&self.w_x).apply_t(&self.bn_x, train);
        let psi = (g1 + x1)
            .relu()
            .apply(&self.psi)
            .apply_t(&self.bn_psi, train)
            .sigmoid();
        skip * psi
    }
}

/// Builder of [UNet].
#[derive(Debug, Clone)]
pub struct UNetInit {
    pub input_channels: usize,
    pub output_channels: usize,
    pub base_channels: usize,
    /// Gate the skip connections with attention.
    pub attention: bool,
}

impl From<&ModelInit> for UNetInit {
    fn from(init: &ModelInit) -> Self {
        let ModelInit {
            input_channels,
            output_channels,
            base_channels,
        } = *init;

        Self {
            input_channels,
            output_channels,
            base_channels,
            attention: false,
        }
    }
}

impl UNetInit {
    pub fn build<'p, P>(self, path: P) -> UNet
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let Self {
            input_channels,
            output_channels,
            base_channels,
            attention,
        } = self;
        let channels: Vec<usize> = (0..DEPTH).map(|level| base_channels << level).collect();

        let encoders: Vec<_> = (0..DEPTH)
            .map(|level| {
                let in_c = if level == 0 {
                    input_channels
                } else {
                    channels[level - 1]
                };
                ConvBlockInit {
                    in_c,
                    out_c: channels[level],
                }
                .build(path / format!("encoder{}", level))
            })
            .collect();

        // decoders are ordered from the deepest level upwards
        let decoders: Vec<_> = (1..DEPTH)
            .rev()
            .map(|level| {
                let high_c = channels[level];
                let low_c = channels[level - 1];
                let up = UpConv::new(path / format!("up{}", level), high_c, low_c);
                let gate = attention.then(|| {
                    AttentionGate::new(path / format!("gate{}", level), low_c, low_c, low_c / 2)
                });
                let block = ConvBlockInit {
                    in_c: low_c * 2,
                    out_c: low_c,
                }
                .build(path / format!("decoder{}", level));
                Decoder { up, gate, block }
            })
            .collect();

        let head = nn::conv2d(
            path / "head",
            channels[0] as i64,
            output_channels as i64,
            1,
            Default::default(),
        );

        UNet {
            encoders,
            decoders,
            head,
        }
    }
}

#[derive(Debug)]
struct Decoder {
    up: UpConv,
    gate: Option<AttentionGate>,
    block: ConvBlock,
}

/// The U-Net encoder-decoder network, optionally with attention gates.
///
/// Height and width of the input must be multiples of 16.
#[derive(Debug)]
pub struct UNet {
    encoders: Vec<ConvBlock>,
    decoders: Vec<Decoder>,
    head: nn::Conv2D,
}

impl UNet {
    fn forward(&self, xs: &Tensor, train: bool) -> Tensor {
        let mut skips = Vec::with_capacity(DEPTH);
        let mut xs = xs.shallow_clone();

        for (level, encoder) in self.encoders.iter().enumerate() {
            if level > 0 {
                xs = xs.max_pool2d(&[2, 2], &[2, 2], &[0, 0], &[1, 1], false);
            }
            xs = xs.apply_t(encoder, train);
            skips.push(xs.shallow_clone());
        }
        // the deepest features are not used as a skip connection
        skips.pop();

        for (decoder, skip) in self.decoders.iter().zip(skips.into_iter().rev()) {
            let Decoder { up, gate, block } = decoder;
            let upsampled = xs.apply_t(up, train);
            let skip = match gate {
                Some(gate) => gate.forward_t(&upsampled, &skip, train),
                None => skip,
            };
            xs = Tensor::cat(&[skip, upsampled], 1).apply_t(block, train);
        }

        xs.apply(&self.head)
    }
}

impl SegmentationModel for UNet {
    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        let (_b, _c, height, width) = input.size4()?;
        let factor = 1 << (DEPTH - 1);
        ensure!(
            height % factor == 0 && width % factor == 0,
            "input height and width must be multiples of {}, but get {}x{}",
            factor,
            height,
            width
        );
        Ok(self.forward(input, train))
    }
}
