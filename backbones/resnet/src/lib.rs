//! Dilated ResNet backbone for DeepLab.
//!
//! This crate provides ResNet models whose last stages trade stride for
//! dilation, so the deepest feature map stays at 1/8 or 1/16 of the input
//! resolution. The layout follows torchvision's ResNet with the stride on the
//! 3x3 convolution of each bottleneck, and a multi-grid on the last stage.

use burn::nn::{
    conv::{Conv2d, Conv2dConfig},
    pool::{MaxPool2d, MaxPool2dConfig},
    Initializer, PaddingConfig2d, Relu,
};
use burn::prelude::*;
use burn_extra_ops::{
    BatchNorm2d, BatchNorm2dConfig, LoadStateDict, NormKind, StateDict, StateDictResult,
};
use core::f64::consts::SQRT_2;
use thiserror::Error;

mod blocks;
pub use blocks::*;

// ResNet residual layer block configs
const RESNET18_BLOCKS: [usize; 4] = [2, 2, 2, 2];
const RESNET34_BLOCKS: [usize; 4] = [3, 4, 6, 3];
const RESNET50_BLOCKS: [usize; 4] = [3, 4, 6, 3];
const RESNET101_BLOCKS: [usize; 4] = [3, 4, 23, 3];
const RESNET152_BLOCKS: [usize; 4] = [3, 8, 36, 3];

/// Error returned for an output stride the backbone cannot produce.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("Unsupported output stride: {0}. Only 8 and 16 are supported.")]
pub struct UnsupportedOutputStride(pub usize);

/// Ratio between the input resolution and the deepest feature map.
#[derive(Config, Debug, PartialEq, Eq)]
pub enum OutputStride {
    /// 1/8 resolution: the last two stages are dilated.
    Eight,
    /// 1/16 resolution: the last stage is dilated.
    Sixteen,
}

impl OutputStride {
    /// Numeric stride.
    pub const fn value(&self) -> usize {
        match self {
            Self::Eight => 8,
            Self::Sixteen => 16,
        }
    }

    /// Stride of each residual stage.
    pub const fn strides(&self) -> [usize; 4] {
        match self {
            Self::Eight => [1, 2, 1, 1],
            Self::Sixteen => [1, 2, 2, 1],
        }
    }

    /// Base dilation of each residual stage.
    pub const fn dilations(&self) -> [usize; 4] {
        match self {
            Self::Eight => [1, 1, 2, 4],
            Self::Sixteen => [1, 1, 1, 2],
        }
    }
}

impl TryFrom<usize> for OutputStride {
    type Error = UnsupportedOutputStride;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        match value {
            8 => Ok(Self::Eight),
            16 => Ok(Self::Sixteen),
            other => Err(UnsupportedOutputStride(other)),
        }
    }
}

/// ResNet depths.
#[derive(Config, Debug, PartialEq, Eq)]
pub enum ResNetDepth {
    /// ResNet-18
    ResNet18,
    /// ResNet-34
    ResNet34,
    /// ResNet-50
    ResNet50,
    /// ResNet-101
    ResNet101,
    /// ResNet-152
    ResNet152,
}

impl ResNetDepth {
    const fn blocks(&self) -> [usize; 4] {
        match self {
            Self::ResNet18 => RESNET18_BLOCKS,
            Self::ResNet34 => RESNET34_BLOCKS,
            Self::ResNet50 => RESNET50_BLOCKS,
            Self::ResNet101 => RESNET101_BLOCKS,
            Self::ResNet152 => RESNET152_BLOCKS,
        }
    }

    /// Channel expansion of the residual blocks (1 for basic, 4 for bottleneck).
    pub const fn expansion(&self) -> usize {
        match self {
            Self::ResNet18 | Self::ResNet34 => 1,
            Self::ResNet50 | Self::ResNet101 | Self::ResNet152 => 4,
        }
    }
}

/// ResNet configuration
#[derive(Config, Debug)]
pub struct ResNetConfig {
    /// Network depth.
    #[config(default = "ResNetDepth::ResNet101")]
    pub depth: ResNetDepth,
    /// Resolution of the deepest feature map.
    #[config(default = "OutputStride::Sixteen")]
    pub output_stride: OutputStride,
    /// Dilation multipliers of the blocks of the last stage.
    #[config(default = "[1, 2, 4]")]
    pub multi_grid: [usize; 3],
    /// Normalization used after every convolution.
    #[config(default = "NormKind::Batch")]
    pub norm: NormKind,
}

impl ResNetConfig {
    /// Initialize ResNet model
    pub fn init<B: Backend>(&self, device: &B::Device) -> ResNetBackbone<B> {
        let blocks = self.depth.blocks();
        let expansion = self.depth.expansion();
        let bottleneck = expansion > 1;
        let strides = self.output_stride.strides();
        let dilations = self.output_stride.dilations();
        let norm = &self.norm;

        // First conv block: 7x7 conv, 64, stride=2, padding=3
        let conv1_block = Conv1Block::new(3, 64, norm, device);

        let layer1 = LayerBlock::new(
            blocks[0],
            64,
            64 * expansion,
            strides[0],
            dilations[0],
            &[],
            bottleneck,
            norm,
            device,
        );
        let layer2 = LayerBlock::new(
            blocks[1],
            64 * expansion,
            128 * expansion,
            strides[1],
            dilations[1],
            &[],
            bottleneck,
            norm,
            device,
        );
        let layer3 = LayerBlock::new(
            blocks[2],
            128 * expansion,
            256 * expansion,
            strides[2],
            dilations[2],
            &[],
            bottleneck,
            norm,
            device,
        );
        let layer4 = LayerBlock::new(
            blocks[3],
            256 * expansion,
            512 * expansion,
            strides[3],
            dilations[3],
            &self.multi_grid,
            bottleneck,
            norm,
            device,
        );

        ResNetBackbone {
            conv1_block,
            layer1,
            layer2,
            layer3,
            layer4,
            expansion,
        }
    }
}

/// ResNet backbone implementation for DeepLab.
///
/// Produces the deep feature map (after `layer4`) and the low-level feature
/// map (after `layer1`, 1/4 of the input resolution).
#[derive(Module, Debug)]
pub struct ResNetBackbone<B: Backend> {
    // conv1 + bn1 + relu + maxpool
    pub conv1_block: Conv1Block<B>,
    pub layer1: LayerBlock<B>,
    pub layer2: LayerBlock<B>,
    pub layer3: LayerBlock<B>,
    pub layer4: LayerBlock<B>,
    expansion: usize,
}

impl<B: Backend> ResNetBackbone<B> {
    /// Forward pass returning `(deep_features, low_level_features)`.
    pub fn forward(&self, input: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let x = self.conv1_block.forward(input);
        let low_level = self.layer1.forward(x);

        let x = self.layer2.forward(low_level.clone());
        let x = self.layer3.forward(x);
        let x = self.layer4.forward(x);

        (x, low_level)
    }

    /// Channels of the deep feature map.
    pub const fn output_channels(&self) -> usize {
        512 * self.expansion
    }

    /// Channels of the low-level feature map.
    pub const fn low_level_channels(&self) -> usize {
        64 * self.expansion
    }

    /// Puts every normalization layer in inference mode.
    pub fn freeze_bn(self) -> Self {
        Self {
            conv1_block: self.conv1_block.freeze_bn(),
            layer1: self.layer1.freeze_bn(),
            layer2: self.layer2.freeze_bn(),
            layer3: self.layer3.freeze_bn(),
            layer4: self.layer4.freeze_bn(),
            expansion: self.expansion,
        }
    }
}

/// Parameter names follow torchvision: `conv1`, `bn1`, `layer{1-4}.{block}.*`.
impl<B: Backend> LoadStateDict<B> for ResNetBackbone<B> {
    fn load_state_dict(self, prefix: &str, state: &mut StateDict<B>) -> StateDictResult<Self> {
        Ok(Self {
            conv1_block: self.conv1_block.load_state_dict(prefix, state)?,
            layer1: self.layer1.load_state_dict(&format!("{prefix}.layer1"), state)?,
            layer2: self.layer2.load_state_dict(&format!("{prefix}.layer2"), state)?,
            layer3: self.layer3.load_state_dict(&format!("{prefix}.layer3"), state)?,
            layer4: self.layer4.load_state_dict(&format!("{prefix}.layer4"), state)?,
            expansion: self.expansion,
        })
    }
}

/// First conv block: conv1 + bn1 + relu + maxpool
#[derive(Module, Debug)]
pub struct Conv1Block<B: Backend> {
    pub conv1: Conv2d<B>,
    pub bn1: BatchNorm2d<B>,
    relu: Relu,
    maxpool: MaxPool2d,
}

impl<B: Backend> Conv1Block<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = self.conv1.forward(input);
        let out = self.bn1.forward(out);
        let out = self.relu.forward(out);
        self.maxpool.forward(out)
    }

    /// Create a new Conv1Block.
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        norm: &NormKind,
        device: &Device<B>,
    ) -> Self {
        let initializer = Initializer::KaimingNormal {
            gain: SQRT_2,
            fan_out_only: true,
        };

        // 7x7 conv, stride=2, padding=3
        let conv1 = Conv2dConfig::new([in_channels, out_channels], [7, 7])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(3, 3))
            .with_bias(false)
            .with_initializer(initializer)
            .init(device);

        let bn1 = BatchNorm2dConfig::new(out_channels)
            .with_kind(norm.clone())
            .init(device);

        // 3x3 maxpool, stride=2, padding=1
        let maxpool = MaxPool2dConfig::new([3, 3])
            .with_strides([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init();

        Self {
            conv1,
            bn1,
            relu: Relu::new(),
            maxpool,
        }
    }

    pub fn freeze_bn(self) -> Self {
        Self {
            bn1: self.bn1.freeze(),
            ..self
        }
    }
}

impl<B: Backend> LoadStateDict<B> for Conv1Block<B> {
    fn load_state_dict(self, prefix: &str, state: &mut StateDict<B>) -> StateDictResult<Self> {
        Ok(Self {
            conv1: self.conv1.load_state_dict(&format!("{prefix}.conv1"), state)?,
            bn1: self.bn1.load_state_dict(&format!("{prefix}.bn1"), state)?,
            ..self
        })
    }
}
