//! # Model Architectures
//!
//! - `aspp`: atrous spatial pyramid pooling over the deep backbone features.
//! - `decoder`: fusion with low-level features and the classifier.
//! - `deeplab`: the full `DeepLab` network built from a dilated ResNet.

pub mod aspp;
pub mod decoder;
pub mod deeplab;

pub use aspp::{ASPPConfig, ASPPModule, ASPPModuleConfig, ASPP, ASPP_CHANNELS};
pub use decoder::{Decoder, DecoderConfig, LOW_LEVEL_PROJECTION};
pub use deeplab::{DeepLab, DeepLabRecord, ParamGroup, CHECKPOINT_STATE_KEY};
