//! # Atrous Spatial Pyramid Pooling (ASPP)
//!
//! Four parallel convolution branches with growing dilation and an
//! image-level pooling branch look at the deep feature map at several scales.
//! Their outputs are concatenated and projected back to 256 channels.

use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        Dropout, DropoutConfig, Initializer, PaddingConfig2d, Relu,
    },
    prelude::*,
    tensor::{
        module::interpolate,
        ops::{InterpolateMode, InterpolateOptions},
    },
};
use burn_extra_ops::{
    BatchNorm2d, BatchNorm2dConfig, LoadStateDict, NormKind, StateDict, StateDictResult,
};
use core::f64::consts::SQRT_2;
use resnet::OutputStride;

/// Width of every ASPP branch and of the projected output.
pub const ASPP_CHANNELS: usize = 256;

pub(crate) const fn kaiming_normal() -> Initializer {
    Initializer::KaimingNormal {
        gain: SQRT_2,
        fan_out_only: false,
    }
}

/// Dilation rates of the four convolution branches.
pub const fn aspp_rates(output_stride: &OutputStride) -> [usize; 4] {
    match output_stride {
        OutputStride::Sixteen => [1, 6, 12, 18],
        OutputStride::Eight => [1, 12, 24, 36],
    }
}

/// Configuration for the `ASPPModule`.
#[derive(Debug)]
pub struct ASPPModuleConfig {
    in_channels: usize,
    planes: usize,
    kernel_size: usize,
    padding: usize,
    dilation: usize,
    norm: NormKind,
}

impl ASPPModuleConfig {
    /// Create a new instance of the ASPP module [config](ASPPModuleConfig).
    pub const fn new(
        in_channels: usize,
        planes: usize,
        kernel_size: usize,
        padding: usize,
        dilation: usize,
        norm: NormKind,
    ) -> Self {
        Self {
            in_channels,
            planes,
            kernel_size,
            padding,
            dilation,
            norm,
        }
    }

    /// Initializes a new `ASPPModule`.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> ASPPModule<B> {
        let atrous_conv = Conv2dConfig::new(
            [self.in_channels, self.planes],
            [self.kernel_size, self.kernel_size],
        )
        .with_stride([1, 1])
        .with_padding(PaddingConfig2d::Explicit(self.padding, self.padding))
        .with_dilation([self.dilation, self.dilation])
        .with_bias(false)
        .with_initializer(kaiming_normal())
        .init(device);

        let bn = BatchNorm2dConfig::new(self.planes)
            .with_kind(self.norm.clone())
            .init(device);

        ASPPModule {
            atrous_conv,
            bn,
            relu: Relu::new(),
        }
    }
}

/// A single branch of the ASPP module: atrous convolution, norm, relu.
#[derive(Module, Debug)]
pub struct ASPPModule<B: Backend> {
    atrous_conv: Conv2d<B>,
    bn: BatchNorm2d<B>,
    relu: Relu,
}

impl<B: Backend> ASPPModule<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.atrous_conv.forward(x);
        let x = self.bn.forward(x);

        self.relu.forward(x)
    }

    pub fn freeze_bn(self) -> Self {
        Self {
            bn: self.bn.freeze(),
            ..self
        }
    }
}

impl<B: Backend> LoadStateDict<B> for ASPPModule<B> {
    fn load_state_dict(self, prefix: &str, state: &mut StateDict<B>) -> StateDictResult<Self> {
        Ok(Self {
            atrous_conv: self
                .atrous_conv
                .load_state_dict(&format!("{prefix}.atrous_conv"), state)?,
            bn: self.bn.load_state_dict(&format!("{prefix}.bn"), state)?,
            ..self
        })
    }
}

/// Configuration for the `ASPP` module.
#[derive(Config, Debug)]
pub struct ASPPConfig {
    /// Number of input channels (deep feature channels of the backbone).
    in_channels: usize,
    /// The output stride of the backbone.
    output_stride: OutputStride,
    /// Normalize the image-level pooling branch.
    #[config(default = "true")]
    global_avg_pool_bn: bool,
    /// Normalization kind.
    #[config(default = "NormKind::Batch")]
    norm: NormKind,
}

impl ASPPConfig {
    /// Initializes a new `ASPP` module.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> ASPP<B> {
        let rates = aspp_rates(&self.output_stride);
        let branch = |kernel_size: usize, padding: usize, dilation: usize| {
            ASPPModuleConfig::new(
                self.in_channels,
                ASPP_CHANNELS,
                kernel_size,
                padding,
                dilation,
                self.norm.clone(),
            )
            .init(device)
        };

        let aspp1 = branch(1, 0, rates[0]);
        let aspp2 = branch(3, rates[1], rates[1]);
        let aspp3 = branch(3, rates[2], rates[2]);
        let aspp4 = branch(3, rates[3], rates[3]);

        // Global average pooling branch
        let global_avg_pool_0 = AdaptiveAvgPool2dConfig::new([1, 1]).init();
        let global_avg_pool_1 = Conv2dConfig::new([self.in_channels, ASPP_CHANNELS], [1, 1])
            .with_stride([1, 1])
            .with_bias(false)
            .with_initializer(kaiming_normal())
            .init(device);
        let global_avg_pool_2 = self.global_avg_pool_bn.then(|| {
            BatchNorm2dConfig::new(ASPP_CHANNELS)
                .with_kind(self.norm.clone())
                .init(device)
        });
        let global_avg_pool_3 = Relu::new();

        // Final convolution
        let conv1 = Conv2dConfig::new([ASPP_CHANNELS * 5, ASPP_CHANNELS], [1, 1])
            .with_bias(false)
            .with_initializer(kaiming_normal())
            .init(device);
        let bn1 = BatchNorm2dConfig::new(ASPP_CHANNELS)
            .with_kind(self.norm.clone())
            .init(device);
        let relu = Relu::new();
        let dropout = DropoutConfig::new(0.5).init();

        ASPP {
            aspp1,
            aspp2,
            aspp3,
            aspp4,
            global_avg_pool_0,
            global_avg_pool_1,
            global_avg_pool_2,
            global_avg_pool_3,
            conv1,
            bn1,
            relu,
            dropout,
        }
    }
}

/// Atrous Spatial Pyramid Pooling (ASPP) module.
#[derive(Module, Debug)]
pub struct ASPP<B: Backend> {
    aspp1: ASPPModule<B>,
    aspp2: ASPPModule<B>,
    aspp3: ASPPModule<B>,
    aspp4: ASPPModule<B>,
    // nn.Sequential
    global_avg_pool_0: AdaptiveAvgPool2d,
    global_avg_pool_1: Conv2d<B>,
    global_avg_pool_2: Option<BatchNorm2d<B>>,
    global_avg_pool_3: Relu,
    conv1: Conv2d<B>,
    bn1: BatchNorm2d<B>,
    relu: Relu,
    dropout: Dropout,
}

impl<B: Backend> ASPP<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x1 = self.aspp1.forward(x.clone());
        let x2 = self.aspp2.forward(x.clone());
        let x3 = self.aspp3.forward(x.clone());
        let x4 = self.aspp4.forward(x.clone());

        // Global average pooling branch
        let x5 = self.global_avg_pool_0.forward(x);
        let x5 = self.global_avg_pool_1.forward(x5);
        let x5 = match &self.global_avg_pool_2 {
            Some(bn) => bn.forward(x5),
            None => x5,
        };
        let x5 = self.global_avg_pool_3.forward(x5);

        let [_, _, height, width] = x1.dims();
        let x5 = interpolate(
            x5,
            [height, width],
            InterpolateOptions::new(InterpolateMode::Bilinear),
        );

        let x = Tensor::cat(vec![x1, x2, x3, x4, x5], 1);

        let x = self.conv1.forward(x);
        let x = self.bn1.forward(x);
        let x = self.relu.forward(x);

        self.dropout.forward(x)
    }

    /// Whether the image-level pooling branch carries a norm.
    pub const fn has_pool_norm(&self) -> bool {
        self.global_avg_pool_2.is_some()
    }

    pub fn freeze_bn(self) -> Self {
        Self {
            aspp1: self.aspp1.freeze_bn(),
            aspp2: self.aspp2.freeze_bn(),
            aspp3: self.aspp3.freeze_bn(),
            aspp4: self.aspp4.freeze_bn(),
            global_avg_pool_2: self.global_avg_pool_2.map(BatchNorm2d::freeze),
            bn1: self.bn1.freeze(),
            ..self
        }
    }
}

impl<B: Backend> LoadStateDict<B> for ASPP<B> {
    fn load_state_dict(self, prefix: &str, state: &mut StateDict<B>) -> StateDictResult<Self> {
        Ok(Self {
            aspp1: self.aspp1.load_state_dict(&format!("{prefix}.aspp1"), state)?,
            aspp2: self.aspp2.load_state_dict(&format!("{prefix}.aspp2"), state)?,
            aspp3: self.aspp3.load_state_dict(&format!("{prefix}.aspp3"), state)?,
            aspp4: self.aspp4.load_state_dict(&format!("{prefix}.aspp4"), state)?,
            global_avg_pool_1: self
                .global_avg_pool_1
                .load_state_dict(&format!("{prefix}.global_avg_pool.1"), state)?,
            global_avg_pool_2: self
                .global_avg_pool_2
                .load_state_dict(&format!("{prefix}.global_avg_pool.2"), state)?,
            conv1: self.conv1.load_state_dict(&format!("{prefix}.conv1"), state)?,
            bn1: self.bn1.load_state_dict(&format!("{prefix}.bn1"), state)?,
            ..self
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_aspp_output_shape() {
        let device = Default::default();
        let aspp = ASPPConfig::new(64, OutputStride::Sixteen).init::<TestBackend>(&device);

        let x = Tensor::<TestBackend, 4>::random([2, 64, 5, 7], Distribution::Default, &device);
        let output = aspp.forward(x);

        assert_eq!(output.dims(), [2, ASPP_CHANNELS, 5, 7]);
    }

    #[test]
    fn test_aspp_without_pool_norm() {
        let device = Default::default();
        let aspp = ASPPConfig::new(32, OutputStride::Eight)
            .with_global_avg_pool_bn(false)
            .init::<TestBackend>(&device);

        assert!(!aspp.has_pool_norm());

        let x = Tensor::<TestBackend, 4>::random([1, 32, 4, 4], Distribution::Default, &device);
        assert_eq!(aspp.forward(x).dims(), [1, ASPP_CHANNELS, 4, 4]);
    }

    #[test]
    fn test_aspp_rates() {
        assert_eq!(aspp_rates(&OutputStride::Sixteen), [1, 6, 12, 18]);
        assert_eq!(aspp_rates(&OutputStride::Eight), [1, 12, 24, 36]);
    }

    #[test]
    fn test_aspp_state_dict_names() {
        let device = Default::default();
        let aspp = ASPPConfig::new(8, OutputStride::Sixteen).init::<TestBackend>(&device);

        let mut state = StateDict::<TestBackend>::new(&device);
        state.insert(
            "aspp.global_avg_pool.1.weight",
            TensorData::new(vec![0.5f32; ASPP_CHANNELS * 8], [ASPP_CHANNELS, 8, 1, 1]),
        );
        state.insert(
            "aspp.aspp3.bn.running_mean",
            TensorData::new(vec![0.25f32; ASPP_CHANNELS], [ASPP_CHANNELS]),
        );

        let aspp = aspp.load_state_dict("aspp", &mut state).unwrap();
        assert!(state.is_empty());

        let weight = aspp
            .global_avg_pool_1
            .weight
            .val()
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        assert!(weight.iter().all(|&v| v == 0.5));
    }
}
