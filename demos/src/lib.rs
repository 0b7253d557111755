//! DeepLab command line tools
//!
//! ## Available tools
//!
//! - `convert`: Merge a PyTorch checkpoint into a DeepLab model and save a Burn record
//! - `inspect`: Report the trainable parameter groups and the output shapes of every entry point
//!
//! ## Usage
//!
//! ```bash
//! # Convert a PyTorch checkpoint
//! cargo run --bin convert -- deeplab-resnet.pth deeplab-resnet
//!
//! # Inspect a model built from a configuration file
//! cargo run --bin inspect -- --config deeplab.json --height 513 --width 513
//! ```

pub mod backend;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::config::Config;
use clap::Args;
use deeplab_burn::{DeepLabConfig, ResNetDepth};
use tracing_subscriber::EnvFilter;

pub use backend::{
    backend_label, default_device, kernel_fusion, InferenceBackend, ToolDevice, TrainingBackend,
};

/// Installs a formatting subscriber filtered by `RUST_LOG` (default `info`).
///
/// Records emitted through the `log` facade by the libraries are forwarded.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Model options shared by the tools.
#[derive(Args, Debug)]
pub struct ModelArgs {
    /// Model configuration file (JSON)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Override the backbone depth (18, 34, 50, 101 or 152)
    #[arg(long)]
    pub backbone: Option<usize>,

    /// Override the output stride (8 or 16)
    #[arg(long)]
    pub output_stride: Option<usize>,

    /// Override the number of classes
    #[arg(long)]
    pub num_classes: Option<usize>,

    /// Build plain batch norms instead of synchronized ones
    #[arg(long)]
    pub no_sync_bn: bool,
}

impl ModelArgs {
    /// Loads the configuration file, if any, and applies the overrides.
    pub fn resolve(&self) -> Result<DeepLabConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => DeepLabConfig::new(),
        };

        if let Some(depth) = self.backbone {
            config.backbone = parse_depth(depth)?;
        }
        if let Some(output_stride) = self.output_stride {
            config.output_stride = output_stride;
        }
        if let Some(num_classes) = self.num_classes {
            config.num_classes = num_classes;
        }
        if self.no_sync_bn {
            config.sync_bn = false;
        }

        config.validate().context("Invalid model configuration")?;
        Ok(config)
    }
}

fn load_config(path: &Path) -> Result<DeepLabConfig> {
    DeepLabConfig::load(path)
        .with_context(|| format!("Failed to load config file: {}", path.display()))
}

/// Maps a ResNet layer count to its depth.
pub fn parse_depth(layers: usize) -> Result<ResNetDepth> {
    Ok(match layers {
        18 => ResNetDepth::ResNet18,
        34 => ResNetDepth::ResNet34,
        50 => ResNetDepth::ResNet50,
        101 => ResNetDepth::ResNet101,
        152 => ResNetDepth::ResNet152,
        other => anyhow::bail!("Unsupported ResNet depth: {other}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_depth() {
        assert_eq!(parse_depth(50).unwrap(), ResNetDepth::ResNet50);
        assert!(parse_depth(42).is_err());
    }

    #[test]
    fn test_overrides_are_applied() {
        let args = ModelArgs {
            config: None,
            backbone: Some(18),
            output_stride: Some(8),
            num_classes: Some(2),
            no_sync_bn: true,
        };

        let config = args.resolve().unwrap();
        assert_eq!(config.backbone, ResNetDepth::ResNet18);
        assert_eq!(config.output_stride, 8);
        assert_eq!(config.num_classes, 2);
        assert!(!config.sync_bn);
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let args = ModelArgs {
            config: None,
            backbone: None,
            output_stride: Some(32),
            num_classes: None,
            no_sync_bn: false,
        };

        assert!(args.resolve().is_err());
    }
}
