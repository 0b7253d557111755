//! # DeepLab Model Implementation
//!
//! This module defines the main `DeepLab` model: a dilated ResNet backbone,
//! an ASPP context module and a decoder that fuses low-level features.
//!
//! Besides the plain forward pass, the model exposes staged entry points used
//! when only the last layers are fine-tuned, batch normalization freezing,
//! pretrained weight merging, and, on autodiff backends, the two parameter
//! groups trained with different learning rates.

#[cfg(feature = "pretrained")]
use std::path::Path;

use burn::{
    module::ParamId,
    prelude::*,
    tensor::{
        backend::AutodiffBackend,
        module::interpolate,
        ops::{InterpolateMode, InterpolateOptions},
    },
};
use burn_extra_ops::{trainable_param_ids, LoadReport, LoadStateDict, NormKind, StateDict};
use resnet::{ResNetBackbone, ResNetConfig};

use super::{ASPPConfig, Decoder, DecoderConfig, ASPP};
use crate::{
    config::DeepLabConfig,
    error::{DeepLabError, DeepLabResult},
};

/// Top-level key under which checkpoints store their parameters.
pub const CHECKPOINT_STATE_KEY: &str = "state_dict";

/// Learning-rate groups of the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamGroup {
    /// Backbone parameters, trained at the base learning rate.
    Backbone,
    /// ASPP and decoder parameters, trained at ten times the base learning rate.
    Head,
}

impl ParamGroup {
    /// Factor applied to the base learning rate.
    pub const fn lr_multiplier(&self) -> f64 {
        match self {
            Self::Backbone => 1.0,
            Self::Head => 10.0,
        }
    }
}

impl DeepLabConfig {
    /// Initializes a `DeepLab` model with the given configuration.
    ///
    /// # Arguments
    ///
    /// * `device` - The device to create the model on.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the pretrained
    /// checkpoint cannot be merged.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> DeepLabResult<DeepLab<B>> {
        self.validate()?;
        let output_stride = self.stride()?;
        let norm = self.norm_kind();

        if norm == NormKind::SyncBatch {
            log::warn!(
                "Synchronized batch norm requested; statistics are computed per device"
            );
        }

        let backbone = ResNetConfig::new()
            .with_depth(self.backbone.clone())
            .with_output_stride(output_stride.clone())
            .with_norm(norm.clone())
            .init(device);
        let aspp = ASPPConfig::new(backbone.output_channels(), output_stride)
            .with_global_avg_pool_bn(self.global_avg_pool_bn)
            .with_norm(norm.clone())
            .init(device);
        let decoder = DecoderConfig::new(backbone.low_level_channels(), self.num_classes)
            .with_norm(norm)
            .init(device);

        let mut model = DeepLab {
            backbone,
            aspp,
            decoder,
        };

        if self.freeze_bn {
            model = model.freeze_bn();
        }

        if self.pretrained {
            let path = self
                .pretrained_path
                .as_ref()
                .ok_or(DeepLabError::MissingPretrainedPath)?;
            model = self.load_checkpoint(model, path, device)?;
        }

        Ok(model)
    }

    #[cfg(feature = "pretrained")]
    fn load_checkpoint<B: Backend>(
        &self,
        model: DeepLab<B>,
        path: &Path,
        device: &Device<B>,
    ) -> DeepLabResult<DeepLab<B>> {
        let (model, _) = model.load_pretrained(path, self.checkpoint_key_prefix_len, device)?;
        Ok(model)
    }

    #[cfg(not(feature = "pretrained"))]
    fn load_checkpoint<B: Backend>(
        &self,
        _model: DeepLab<B>,
        path: &std::path::Path,
        _device: &Device<B>,
    ) -> DeepLabResult<DeepLab<B>> {
        Err(DeepLabError::PretrainedUnavailable {
            path: path.to_path_buf(),
        })
    }
}

/// DeepLabV3+ semantic segmentation network.
#[derive(Module, Debug)]
pub struct DeepLab<B: Backend> {
    pub(crate) backbone: ResNetBackbone<B>,
    pub(crate) aspp: ASPP<B>,
    pub(crate) decoder: Decoder<B>,
}

impl<B: Backend> DeepLab<B> {
    /// Predicts class logits at the resolution of `input`.
    ///
    /// # Shapes
    ///
    /// - input: `[batch, 3, height, width]`
    /// - output: `[batch, num_classes, height, width]`
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, height, width] = input.dims();
        let (x, low_level_feat) = self.backbone.forward(input);
        let x = self.aspp.forward(x);
        let x = self.decoder.forward(x, low_level_feat);

        upsample(x, [height, width])
    }

    /// Decoder features right before the classifier, at 1/4 resolution.
    pub fn forward_before_class_prediction(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let (x, low_level_feat) = self.backbone.forward(input);
        let x = self.aspp.forward(x);
        self.decoder.forward_before_class_prediction(x, low_level_feat)
    }

    /// Classifies features from [`Self::forward_before_class_prediction`] and
    /// upsamples the logits to `input_size` (`[height, width]`).
    pub fn forward_class_prediction(&self, x: Tensor<B, 4>, input_size: [usize; 2]) -> Tensor<B, 4> {
        let x = self.decoder.forward_class_prediction(x);
        upsample(x, input_size)
    }

    /// Decoder features after the first refinement stage, at 1/4 resolution.
    pub fn forward_before_last_conv_finetune(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let (x, low_level_feat) = self.backbone.forward(input);
        let x = self.aspp.forward(x);
        self.decoder
            .forward_before_last_conv_finetune(x, low_level_feat)
    }

    /// Remaining decoder layers on features from
    /// [`Self::forward_before_last_conv_finetune`]. The logits are not upsampled.
    pub fn forward_class_last_conv_finetune(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.decoder.forward_class_last_conv_finetune(x)
    }

    /// Puts every batch normalization in inference mode.
    ///
    /// Running statistics stop updating; affine parameters stay trainable.
    pub fn freeze_bn(self) -> Self {
        Self {
            backbone: self.backbone.freeze_bn(),
            aspp: self.aspp.freeze_bn(),
            decoder: self.decoder.freeze_bn(),
        }
    }

    /// The feature extractor.
    pub const fn backbone(&self) -> &ResNetBackbone<B> {
        &self.backbone
    }

    /// The ASPP context module.
    pub const fn aspp(&self) -> &ASPP<B> {
        &self.aspp
    }

    /// The decoder head.
    pub const fn decoder(&self) -> &Decoder<B> {
        &self.decoder
    }

    /// Reads a PyTorch checkpoint and merges its `state_dict` into the model.
    ///
    /// The first `key_prefix_len` characters of every checkpoint key are
    /// dropped before matching (7 strips `module.`).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or an entry has the wrong shape.
    #[cfg(feature = "pretrained")]
    pub fn load_pretrained<P: AsRef<Path>>(
        self,
        path: P,
        key_prefix_len: usize,
        device: &Device<B>,
    ) -> DeepLabResult<(Self, LoadReport)> {
        let path = path.as_ref();
        log::info!("Loading pretrained weights from {}", path.display());

        let state = StateDict::from_pytorch_file(path, Some(CHECKPOINT_STATE_KEY), device)?;
        self.apply_state_dict(state, key_prefix_len)
    }

    /// Merges `state` into the model by parameter name.
    ///
    /// Entries matching a parameter overwrite it. Parameters without an entry
    /// keep their value and checkpoint entries without a parameter are
    /// ignored; both are listed in the returned report.
    ///
    /// # Errors
    ///
    /// Returns an error if an entry has the wrong shape.
    pub fn apply_state_dict(
        self,
        state: StateDict<B>,
        key_prefix_len: usize,
    ) -> DeepLabResult<(Self, LoadReport)> {
        let mut state = state.strip_key_prefix(key_prefix_len);

        let model = Self {
            backbone: self.backbone.load_state_dict("backbone", &mut state)?,
            aspp: self.aspp.load_state_dict("aspp", &mut state)?,
            decoder: self.decoder.load_state_dict("decoder", &mut state)?,
        };
        let report = state.finish();

        log::info!("Loaded {} tensors from checkpoint", report.loaded.len());
        if !report.missing.is_empty() {
            log::warn!(
                "{} model parameters not found in checkpoint, keeping initial values: {:?}",
                report.missing.len(),
                report.missing
            );
        }
        if !report.unused.is_empty() {
            log::debug!(
                "{} checkpoint entries ignored: {:?}",
                report.unused.len(),
                report.unused
            );
        }

        Ok((model, report))
    }
}

impl<B: AutodiffBackend> DeepLab<B> {
    /// Trainable parameters of the backbone, stepped at the base learning rate.
    ///
    /// Batch norm running statistics and parameters detached with `no_grad`
    /// are not listed.
    pub fn backbone_params(&self) -> impl Iterator<Item = ParamId> {
        trainable_param_ids(&self.backbone).into_iter()
    }

    /// Trainable parameters of the ASPP and the decoder, stepped at ten times
    /// the base learning rate.
    pub fn head_params(&self) -> impl Iterator<Item = ParamId> {
        trainable_param_ids(&self.aspp)
            .into_iter()
            .chain(trainable_param_ids(&self.decoder))
    }

    /// Trainable parameters of `group`.
    pub fn group_params(&self, group: ParamGroup) -> Vec<ParamId> {
        match group {
            ParamGroup::Backbone => self.backbone_params().collect(),
            ParamGroup::Head => self.head_params().collect(),
        }
    }
}

fn upsample<B: Backend>(x: Tensor<B, 4>, size: [usize; 2]) -> Tensor<B, 4> {
    interpolate(x, size, InterpolateOptions::new(InterpolateMode::Bilinear))
}
