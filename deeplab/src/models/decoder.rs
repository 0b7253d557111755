//! DeepLabV3+ decoder.
//!
//! Fuses the ASPP output with the low-level backbone features and predicts
//! class logits at 1/4 of the input resolution. The refinement stack mirrors
//! a PyTorch `nn.Sequential` named `last_conv`; fields keep its indices so
//! checkpoint keys map one to one.

use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        Dropout, DropoutConfig, PaddingConfig2d, Relu,
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

use super::aspp::{kaiming_normal, ASPP_CHANNELS};

/// Channels of the projected low-level features.
pub const LOW_LEVEL_PROJECTION: usize = 48;

/// Configuration for the `Decoder` module.
#[derive(Config, Debug)]
pub struct DecoderConfig {
    /// Channels of the low-level backbone features.
    low_level_channels: usize,
    /// Number of segmentation classes.
    num_classes: usize,
    /// Normalization kind.
    #[config(default = "NormKind::Batch")]
    norm: NormKind,
}

impl DecoderConfig {
    /// Initializes a new `Decoder`.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> Decoder<B> {
        let bn = |channels: usize| {
            BatchNorm2dConfig::new(channels)
                .with_kind(self.norm.clone())
                .init(device)
        };
        let conv3x3 = |in_channels: usize| {
            Conv2dConfig::new([in_channels, ASPP_CHANNELS], [3, 3])
                .with_stride([1, 1])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(false)
                .with_initializer(kaiming_normal())
                .init(device)
        };

        let conv1 = Conv2dConfig::new([self.low_level_channels, LOW_LEVEL_PROJECTION], [1, 1])
            .with_bias(false)
            .with_initializer(kaiming_normal())
            .init(device);

        Decoder {
            conv1,
            bn1: bn(LOW_LEVEL_PROJECTION),
            relu: Relu::new(),
            last_conv_0: conv3x3(ASPP_CHANNELS + LOW_LEVEL_PROJECTION),
            last_conv_1: bn(ASPP_CHANNELS),
            last_conv_2: Relu::new(),
            last_conv_3: DropoutConfig::new(0.5).init(),
            last_conv_4: conv3x3(ASPP_CHANNELS),
            last_conv_5: bn(ASPP_CHANNELS),
            last_conv_6: Relu::new(),
            last_conv_7: DropoutConfig::new(0.1).init(),
            last_conv_8: Conv2dConfig::new([ASPP_CHANNELS, self.num_classes], [1, 1])
                .with_stride([1, 1])
                .with_initializer(kaiming_normal())
                .init(device),
        }
    }
}

/// Decoder head producing class logits at low-level feature resolution.
#[derive(Module, Debug)]
pub struct Decoder<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm2d<B>,
    relu: Relu,
    // nn.Sequential
    last_conv_0: Conv2d<B>,
    last_conv_1: BatchNorm2d<B>,
    last_conv_2: Relu,
    last_conv_3: Dropout,
    last_conv_4: Conv2d<B>,
    last_conv_5: BatchNorm2d<B>,
    last_conv_6: Relu,
    last_conv_7: Dropout,
    last_conv_8: Conv2d<B>,
}

impl<B: Backend> Decoder<B> {
    pub fn forward(&self, x: Tensor<B, 4>, low_level_feat: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.forward_before_class_prediction(x, low_level_feat);
        self.forward_class_prediction(x)
    }

    /// Features right before the 1x1 classifier.
    pub fn forward_before_class_prediction(
        &self,
        x: Tensor<B, 4>,
        low_level_feat: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let x = self.forward_before_last_conv_finetune(x, low_level_feat);
        self.second_stage(x)
    }

    /// Applies the 1x1 classifier.
    pub fn forward_class_prediction(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.last_conv_8.forward(x)
    }

    /// Features after the first 3x3 refinement stage.
    pub fn forward_before_last_conv_finetune(
        &self,
        x: Tensor<B, 4>,
        low_level_feat: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let x = self.fuse(x, low_level_feat);

        let x = self.last_conv_0.forward(x);
        let x = self.last_conv_1.forward(x);
        let x = self.last_conv_2.forward(x);
        self.last_conv_3.forward(x)
    }

    /// Second refinement stage followed by the classifier.
    pub fn forward_class_last_conv_finetune(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.second_stage(x);
        self.forward_class_prediction(x)
    }

    /// The 1x1 classifier producing one logit map per class.
    pub const fn classifier(&self) -> &Conv2d<B> {
        &self.last_conv_8
    }

    pub fn freeze_bn(self) -> Self {
        Self {
            bn1: self.bn1.freeze(),
            last_conv_1: self.last_conv_1.freeze(),
            last_conv_5: self.last_conv_5.freeze(),
            ..self
        }
    }

    fn fuse(&self, x: Tensor<B, 4>, low_level_feat: Tensor<B, 4>) -> Tensor<B, 4> {
        let low_level_feat = self.conv1.forward(low_level_feat);
        let low_level_feat = self.bn1.forward(low_level_feat);
        let low_level_feat = self.relu.forward(low_level_feat);

        let [_, _, height, width] = low_level_feat.dims();
        let x = interpolate(
            x,
            [height, width],
            InterpolateOptions::new(InterpolateMode::Bilinear),
        );

        Tensor::cat(vec![x, low_level_feat], 1)
    }

    fn second_stage(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.last_conv_4.forward(x);
        let x = self.last_conv_5.forward(x);
        let x = self.last_conv_6.forward(x);
        self.last_conv_7.forward(x)
    }
}

impl<B: Backend> LoadStateDict<B> for Decoder<B> {
    fn load_state_dict(self, prefix: &str, state: &mut StateDict<B>) -> StateDictResult<Self> {
        Ok(Self {
            conv1: self.conv1.load_state_dict(&format!("{prefix}.conv1"), state)?,
            bn1: self.bn1.load_state_dict(&format!("{prefix}.bn1"), state)?,
            last_conv_0: self
                .last_conv_0
                .load_state_dict(&format!("{prefix}.last_conv.0"), state)?,
            last_conv_1: self
                .last_conv_1
                .load_state_dict(&format!("{prefix}.last_conv.1"), state)?,
            last_conv_4: self
                .last_conv_4
                .load_state_dict(&format!("{prefix}.last_conv.4"), state)?,
            last_conv_5: self
                .last_conv_5
                .load_state_dict(&format!("{prefix}.last_conv.5"), state)?,
            last_conv_8: self
                .last_conv_8
                .load_state_dict(&format!("{prefix}.last_conv.8"), state)?,
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

    fn inputs(device: &Device<TestBackend>) -> (Tensor<TestBackend, 4>, Tensor<TestBackend, 4>) {
        let x = Tensor::random([2, ASPP_CHANNELS, 4, 4], Distribution::Default, device);
        let low_level = Tensor::random([2, 64, 16, 16], Distribution::Default, device);
        (x, low_level)
    }

    #[test]
    fn test_decoder_forward_shape() {
        let device = Default::default();
        let decoder = DecoderConfig::new(64, 5).init::<TestBackend>(&device);
        let (x, low_level) = inputs(&device);

        assert_eq!(decoder.forward(x, low_level).dims(), [2, 5, 16, 16]);
    }

    #[test]
    fn test_decoder_staged_entry_points() {
        let device = Default::default();
        let decoder = DecoderConfig::new(64, 3).init::<TestBackend>(&device);
        let (x, low_level) = inputs(&device);

        let features = decoder.forward_before_class_prediction(x.clone(), low_level.clone());
        assert_eq!(features.dims(), [2, ASPP_CHANNELS, 16, 16]);
        assert_eq!(
            decoder.forward_class_prediction(features).dims(),
            [2, 3, 16, 16]
        );

        let features = decoder.forward_before_last_conv_finetune(x, low_level);
        assert_eq!(features.dims(), [2, ASPP_CHANNELS, 16, 16]);
        assert_eq!(
            decoder.forward_class_last_conv_finetune(features).dims(),
            [2, 3, 16, 16]
        );
    }

    #[test]
    fn test_classifier_has_bias() {
        let device = Default::default();
        let decoder = DecoderConfig::new(64, 7).init::<TestBackend>(&device);

        let classifier = decoder.classifier();
        assert_eq!(classifier.weight.dims(), [7, ASPP_CHANNELS, 1, 1]);
        assert!(classifier.bias.is_some());
    }

    #[test]
    fn test_decoder_state_dict_names() {
        let device = Default::default();
        let decoder = DecoderConfig::new(64, 2).init::<TestBackend>(&device);

        let mut state = StateDict::<TestBackend>::new(&device);
        state.insert(
            "decoder.last_conv.8.bias",
            TensorData::new(vec![3.0f32, -3.0], [2]),
        );
        state.insert(
            "decoder.last_conv.5.running_var",
            TensorData::new(vec![2.0f32; ASPP_CHANNELS], [ASPP_CHANNELS]),
        );

        let decoder = decoder.load_state_dict("decoder", &mut state).unwrap();
        let report = state.finish();

        assert!(report.unused.is_empty());
        let bias = decoder
            .classifier()
            .bias
            .as_ref()
            .unwrap()
            .val()
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        assert_eq!(bias, vec![3.0, -3.0]);
    }
}
