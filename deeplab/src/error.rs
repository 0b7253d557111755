use std::path::PathBuf;

use burn_extra_ops::StateDictError;
use thiserror::Error;

/// The error type for `DeepLab-Burn` operations.
///
/// Covers invalid model configurations and failures while merging pretrained
/// weights into a freshly built model.
#[derive(Error, Debug)]
pub enum DeepLabError {
    /// Error for when the requested output stride cannot be produced by the backbone.
    #[error("Unsupported output stride: {output_stride}. Only 8 and 16 are supported.")]
    UnsupportedOutputStride {
        /// The rejected output stride.
        output_stride: usize,
    },

    /// Error for when an invalid model configuration is provided.
    #[error("Invalid model configuration: {reason}")]
    InvalidConfiguration {
        /// The reason why the configuration is invalid.
        reason: String,
    },

    /// Error for when pretrained loading is requested without a checkpoint.
    #[error("Pretrained weights requested but no checkpoint path was given")]
    MissingPretrainedPath,

    /// Error for when pretrained loading is requested but the crate was built without it.
    #[error("Cannot load {path}: built without the `pretrained` feature")]
    PretrainedUnavailable {
        /// The checkpoint that was requested.
        path: PathBuf,
    },

    /// Error for when loading model weights fails.
    #[error("Failed to load weights: {0}")]
    WeightLoadingFailed(#[from] StateDictError),
}

/// A specialized `Result` type for `DeepLab-Burn` operations.
pub type DeepLabResult<T> = Result<T, DeepLabError>;
