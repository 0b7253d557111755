//! DeepLabV3+ semantic segmentation for Burn.
//!
//! Build a model from a [`DeepLabConfig`], optionally merging a PyTorch
//! checkpoint, then call [`DeepLab::forward`].

mod config;
mod error;
mod models;
#[cfg(test)]
mod tests;
#[cfg(feature = "train")]
mod training;

pub use config::DeepLabConfig;
pub use error::{DeepLabError, DeepLabResult};
pub use models::*;
#[cfg(feature = "train")]
pub use training::DifferentialLrOptimizer;

pub use burn_extra_ops::{LoadReport, StateDict, StateDictError};
pub use resnet::{OutputStride, ResNetDepth};
