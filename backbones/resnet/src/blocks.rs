//! ResNet block implementations.
//!
//! This module contains the building blocks for ResNet: BasicBlock, Bottleneck and LayerBlock,
//! extended with dilation so later stages can keep their resolution.

use core::f64::consts::SQRT_2;

use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        Initializer, PaddingConfig2d, Relu,
    },
    prelude::*,
};
use burn_extra_ops::{
    BatchNorm2d, BatchNorm2dConfig, LoadStateDict, NormKind, StateDict, StateDictResult,
};

fn conv_initializer() -> Initializer {
    Initializer::KaimingNormal {
        gain: SQRT_2,
        fan_out_only: true,
    }
}

/// Shape of a single residual block.
#[derive(Debug, Clone)]
pub struct BlockSpec {
    pub in_channels: usize,
    pub out_channels: usize,
    pub stride: usize,
    pub dilation: usize,
}

#[derive(Module, Debug)]
pub enum ResidualBlock<B: Backend> {
    /// A bottleneck residual block.
    Bottleneck(Bottleneck<B>),
    /// A basic residual block.
    Basic(BasicBlock<B>),
}

impl<B: Backend> ResidualBlock<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Self::Basic(block) => block.forward(input),
            Self::Bottleneck(block) => block.forward(input),
        }
    }

    pub fn freeze_bn(self) -> Self {
        match self {
            Self::Basic(block) => Self::Basic(block.freeze_bn()),
            Self::Bottleneck(block) => Self::Bottleneck(block.freeze_bn()),
        }
    }
}

impl<B: Backend> LoadStateDict<B> for ResidualBlock<B> {
    fn load_state_dict(self, prefix: &str, state: &mut StateDict<B>) -> StateDictResult<Self> {
        Ok(match self {
            Self::Basic(block) => Self::Basic(block.load_state_dict(prefix, state)?),
            Self::Bottleneck(block) => Self::Bottleneck(block.load_state_dict(prefix, state)?),
        })
    }
}

/// ResNet basic residual block with dilated 3x3 convolutions.
#[derive(Module, Debug)]
pub struct BasicBlock<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm2d<B>,
    relu: Relu,
    conv2: Conv2d<B>,
    bn2: BatchNorm2d<B>,
    downsample: Option<Downsample<B>>,
}

impl<B: Backend> BasicBlock<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = input.clone();

        let out = self.conv1.forward(input);
        let out = self.bn1.forward(out);
        let out = self.relu.forward(out);
        let out = self.conv2.forward(out);
        let out = self.bn2.forward(out);

        let out = match &self.downsample {
            Some(downsample) => out + downsample.forward(identity),
            None => out + identity,
        };

        self.relu.forward(out)
    }

    /// Create a new BasicBlock.
    pub fn new(spec: &BlockSpec, norm: &NormKind, device: &Device<B>) -> Self {
        let dilation = spec.dilation;
        let conv1 = Conv2dConfig::new([spec.in_channels, spec.out_channels], [3, 3])
            .with_stride([spec.stride, spec.stride])
            .with_padding(PaddingConfig2d::Explicit(dilation, dilation))
            .with_dilation([dilation, dilation])
            .with_bias(false)
            .with_initializer(conv_initializer())
            .init(device);
        let bn1 = BatchNorm2dConfig::new(spec.out_channels)
            .with_kind(norm.clone())
            .init(device);

        let conv2 = Conv2dConfig::new([spec.out_channels, spec.out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(dilation, dilation))
            .with_dilation([dilation, dilation])
            .with_bias(false)
            .with_initializer(conv_initializer())
            .init(device);
        let bn2 = BatchNorm2dConfig::new(spec.out_channels)
            .with_kind(norm.clone())
            .init(device);

        Self {
            conv1,
            bn1,
            relu: Relu::new(),
            conv2,
            bn2,
            downsample: Downsample::needed(spec, norm, device),
        }
    }

    pub fn freeze_bn(self) -> Self {
        Self {
            bn1: self.bn1.freeze(),
            bn2: self.bn2.freeze(),
            downsample: self.downsample.map(Downsample::freeze_bn),
            ..self
        }
    }
}

impl<B: Backend> LoadStateDict<B> for BasicBlock<B> {
    fn load_state_dict(self, prefix: &str, state: &mut StateDict<B>) -> StateDictResult<Self> {
        Ok(Self {
            conv1: self.conv1.load_state_dict(&format!("{prefix}.conv1"), state)?,
            bn1: self.bn1.load_state_dict(&format!("{prefix}.bn1"), state)?,
            conv2: self.conv2.load_state_dict(&format!("{prefix}.conv2"), state)?,
            bn2: self.bn2.load_state_dict(&format!("{prefix}.bn2"), state)?,
            downsample: self
                .downsample
                .load_state_dict(&format!("{prefix}.downsample"), state)?,
            relu: self.relu,
        })
    }
}

/// ResNet bottleneck residual block implementation.
///
/// **NOTE:** the stride and the dilation sit on the 3x3 convolution (ResNet V1.5 layout).
#[derive(Module, Debug)]
pub struct Bottleneck<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm2d<B>,
    relu: Relu,
    conv2: Conv2d<B>,
    bn2: BatchNorm2d<B>,
    conv3: Conv2d<B>,
    bn3: BatchNorm2d<B>,
    downsample: Option<Downsample<B>>,
}

impl<B: Backend> Bottleneck<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = input.clone();

        let out = self.conv1.forward(input);
        let out = self.bn1.forward(out);
        let out = self.relu.forward(out);
        let out = self.conv2.forward(out);
        let out = self.bn2.forward(out);
        let out = self.relu.forward(out);
        let out = self.conv3.forward(out);
        let out = self.bn3.forward(out);

        let out = match &self.downsample {
            Some(downsample) => out + downsample.forward(identity),
            None => out + identity,
        };

        self.relu.forward(out)
    }

    /// Create a new Bottleneck.
    pub fn new(spec: &BlockSpec, norm: &NormKind, device: &Device<B>) -> Self {
        // Intermediate output channels w/ expansion = 4
        let int_out_channels = spec.out_channels / 4;
        let dilation = spec.dilation;

        // conv1x1
        let conv1 = Conv2dConfig::new([spec.in_channels, int_out_channels], [1, 1])
            .with_bias(false)
            .with_initializer(conv_initializer())
            .init(device);
        let bn1 = BatchNorm2dConfig::new(int_out_channels)
            .with_kind(norm.clone())
            .init(device);

        // conv3x3
        let conv2 = Conv2dConfig::new([int_out_channels, int_out_channels], [3, 3])
            .with_stride([spec.stride, spec.stride])
            .with_padding(PaddingConfig2d::Explicit(dilation, dilation))
            .with_dilation([dilation, dilation])
            .with_bias(false)
            .with_initializer(conv_initializer())
            .init(device);
        let bn2 = BatchNorm2dConfig::new(int_out_channels)
            .with_kind(norm.clone())
            .init(device);

        // conv1x1
        let conv3 = Conv2dConfig::new([int_out_channels, spec.out_channels], [1, 1])
            .with_bias(false)
            .with_initializer(conv_initializer())
            .init(device);
        let bn3 = BatchNorm2dConfig::new(spec.out_channels)
            .with_kind(norm.clone())
            .init(device);

        Self {
            conv1,
            bn1,
            relu: Relu::new(),
            conv2,
            bn2,
            conv3,
            bn3,
            downsample: Downsample::needed(spec, norm, device),
        }
    }

    pub fn freeze_bn(self) -> Self {
        Self {
            bn1: self.bn1.freeze(),
            bn2: self.bn2.freeze(),
            bn3: self.bn3.freeze(),
            downsample: self.downsample.map(Downsample::freeze_bn),
            ..self
        }
    }
}

impl<B: Backend> LoadStateDict<B> for Bottleneck<B> {
    fn load_state_dict(self, prefix: &str, state: &mut StateDict<B>) -> StateDictResult<Self> {
        Ok(Self {
            conv1: self.conv1.load_state_dict(&format!("{prefix}.conv1"), state)?,
            bn1: self.bn1.load_state_dict(&format!("{prefix}.bn1"), state)?,
            conv2: self.conv2.load_state_dict(&format!("{prefix}.conv2"), state)?,
            bn2: self.bn2.load_state_dict(&format!("{prefix}.bn2"), state)?,
            conv3: self.conv3.load_state_dict(&format!("{prefix}.conv3"), state)?,
            bn3: self.bn3.load_state_dict(&format!("{prefix}.bn3"), state)?,
            downsample: self
                .downsample
                .load_state_dict(&format!("{prefix}.downsample"), state)?,
            relu: self.relu,
        })
    }
}

/// Downsample layer applies a 1x1 conv to reduce the resolution (H, W) and adjust the number of channels.
#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm2d<B>,
}

impl<B: Backend> Downsample<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = self.conv.forward(input);
        self.bn.forward(out)
    }

    /// Create a new Downsample.
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        norm: &NormKind,
        device: &Device<B>,
    ) -> Self {
        let conv = Conv2dConfig::new([in_channels, out_channels], [1, 1])
            .with_stride([stride, stride])
            .with_bias(false)
            .with_initializer(conv_initializer())
            .init(device);
        let bn = BatchNorm2dConfig::new(out_channels)
            .with_kind(norm.clone())
            .init(device);

        Self { conv, bn }
    }

    fn needed(spec: &BlockSpec, norm: &NormKind, device: &Device<B>) -> Option<Self> {
        (spec.stride != 1 || spec.in_channels != spec.out_channels).then(|| {
            Self::new(
                spec.in_channels,
                spec.out_channels,
                spec.stride,
                norm,
                device,
            )
        })
    }

    pub fn freeze_bn(self) -> Self {
        Self {
            conv: self.conv,
            bn: self.bn.freeze(),
        }
    }
}

/// PyTorch stores the projection as `downsample.0` (conv) and `downsample.1` (norm).
impl<B: Backend> LoadStateDict<B> for Downsample<B> {
    fn load_state_dict(self, prefix: &str, state: &mut StateDict<B>) -> StateDictResult<Self> {
        Ok(Self {
            conv: self.conv.load_state_dict(&format!("{prefix}.0"), state)?,
            bn: self.bn.load_state_dict(&format!("{prefix}.1"), state)?,
        })
    }
}

/// Collection of sequential residual blocks.
#[derive(Module, Debug)]
pub struct LayerBlock<B: Backend> {
    blocks: Vec<ResidualBlock<B>>,
}

impl<B: Backend> LayerBlock<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut out = input;
        for block in &self.blocks {
            out = block.forward(out);
        }
        out
    }

    /// Create a new LayerBlock.
    ///
    /// The first block carries the stride (and the channel change); block `i`
    /// uses `dilation * grid[i]`, where a missing grid entry counts as 1.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        num_blocks: usize,
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        dilation: usize,
        grid: &[usize],
        bottleneck: bool,
        norm: &NormKind,
        device: &Device<B>,
    ) -> Self {
        let blocks = (0..num_blocks)
            .map(|b| {
                let spec = BlockSpec {
                    in_channels: if b == 0 { in_channels } else { out_channels },
                    out_channels,
                    stride: if b == 0 { stride } else { 1 },
                    dilation: dilation * grid.get(b).copied().unwrap_or(1),
                };
                if bottleneck {
                    ResidualBlock::Bottleneck(Bottleneck::new(&spec, norm, device))
                } else {
                    ResidualBlock::Basic(BasicBlock::new(&spec, norm, device))
                }
            })
            .collect();

        Self { blocks }
    }

    /// Number of residual blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn freeze_bn(self) -> Self {
        Self {
            blocks: self
                .blocks
                .into_iter()
                .map(ResidualBlock::freeze_bn)
                .collect(),
        }
    }
}

impl<B: Backend> LoadStateDict<B> for LayerBlock<B> {
    fn load_state_dict(self, prefix: &str, state: &mut StateDict<B>) -> StateDictResult<Self> {
        Ok(Self {
            blocks: self.blocks.load_state_dict(prefix, state)?,
        })
    }
}
