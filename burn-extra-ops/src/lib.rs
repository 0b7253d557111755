//! Additional operations for the Burn deep learning framework
//!
//! This crate provides building blocks that Burn does not ship yet and that
//! models ported from PyTorch need: a batch normalization that can be frozen
//! independently of the backend, loading of weights addressed by PyTorch
//! parameter names, and listing of the parameters an optimizer should update.

mod norm;
mod params;
mod state_dict;

// Convenient re-exports
pub use norm::{BatchNorm2d, BatchNorm2dConfig, NormKind};
pub use params::trainable_param_ids;
pub use state_dict::{LoadReport, LoadStateDict, StateDict, StateDictError, StateDictResult};
