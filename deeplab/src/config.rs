//! Configuration of the DeepLab model.
//!
//! `DeepLabConfig` carries the construction parameters of the network. It is
//! a Burn `Config`, so it can be saved to and loaded from JSON.

use std::path::PathBuf;

use burn::prelude::*;
use burn_extra_ops::NormKind;
use resnet::{OutputStride, ResNetDepth};

use crate::error::{DeepLabError, DeepLabResult};

/// Configuration for the `DeepLab` model.
#[derive(Config, Debug)]
pub struct DeepLabConfig {
    /// Ratio between the input resolution and the deepest feature map (8 or 16).
    #[config(default = "16")]
    pub output_stride: usize,
    /// Number of segmentation classes.
    #[config(default = "21")]
    pub num_classes: usize,
    /// Use synchronized batch normalization.
    #[config(default = "true")]
    pub sync_bn: bool,
    /// Freeze every batch normalization after construction.
    #[config(default = "false")]
    pub freeze_bn: bool,
    /// Load `pretrained_path` after construction.
    #[config(default = "false")]
    pub pretrained: bool,
    /// Normalize the image-level pooling branch of the ASPP.
    #[config(default = "true")]
    pub global_avg_pool_bn: bool,
    /// PyTorch checkpoint holding a `state_dict` entry.
    #[config(default = "None")]
    pub pretrained_path: Option<PathBuf>,
    /// Backbone depth.
    #[config(default = "ResNetDepth::ResNet101")]
    pub backbone: ResNetDepth,
    /// Characters dropped from the front of every checkpoint key (`module.`).
    #[config(default = "7")]
    pub checkpoint_key_prefix_len: usize,
}

impl DeepLabConfig {
    /// Checks the configuration without building anything.
    ///
    /// # Errors
    ///
    /// Returns an error for an unsupported output stride, zero classes, or a
    /// pretrained request without a checkpoint path.
    pub fn validate(&self) -> DeepLabResult<()> {
        self.stride()?;

        if self.num_classes == 0 {
            return Err(DeepLabError::InvalidConfiguration {
                reason: "num_classes must be greater than 0".to_string(),
            });
        }

        if self.pretrained && self.pretrained_path.is_none() {
            return Err(DeepLabError::MissingPretrainedPath);
        }

        Ok(())
    }

    /// Output stride as understood by the backbone.
    pub fn stride(&self) -> DeepLabResult<OutputStride> {
        OutputStride::try_from(self.output_stride).map_err(|err| {
            DeepLabError::UnsupportedOutputStride {
                output_stride: err.0,
            }
        })
    }

    /// Normalization kind selected by `sync_bn`.
    pub const fn norm_kind(&self) -> NormKind {
        if self.sync_bn {
            NormKind::SyncBatch
        } else {
            NormKind::Batch
        }
    }
}
