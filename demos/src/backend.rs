//! Backend the DeepLab tools run on
//!
//! Picked at compile time: `cuda` wins over `wgpu`, which wins over the
//! default `ndarray`. The `fusion` feature turns on kernel fusion for the GPU
//! backends and is ignored on the CPU.
//!
//! Models are built on [`TrainingBackend`] when their parameter groups are
//! needed, since only an autodiff backend knows which tensors are trainable,
//! and run on [`InferenceBackend`] through `AutodiffModule::valid`.

use burn::{backend::Autodiff, prelude::Device};
use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(feature = "cuda")] {
        /// Backend the forward passes run on.
        pub type InferenceBackend = burn::backend::Cuda;
        const BACKEND_NAME: &str = "CUDA";
        const GPU: bool = true;
    } else if #[cfg(feature = "wgpu")] {
        /// Backend the forward passes run on.
        pub type InferenceBackend = burn::backend::Wgpu;
        const BACKEND_NAME: &str = "WGPU";
        const GPU: bool = true;
    } else {
        /// Backend the forward passes run on.
        pub type InferenceBackend = burn::backend::NdArray;
        const BACKEND_NAME: &str = "NdArray";
        const GPU: bool = false;
    }
}

/// Gradient-tracking wrapper of [`InferenceBackend`], used to list the
/// trainable parameter groups.
pub type TrainingBackend = Autodiff<InferenceBackend>;

/// Device type shared by both backends.
pub type ToolDevice = Device<InferenceBackend>;

/// Default device of the selected backend.
pub fn default_device() -> ToolDevice {
    ToolDevice::default()
}

/// Whether kernels are fused on the selected backend.
pub const fn kernel_fusion() -> bool {
    GPU && cfg!(feature = "fusion")
}

/// Backend description printed by the tools.
pub fn backend_label() -> String {
    let place = if GPU { "GPU" } else { "CPU" };
    if kernel_fusion() {
        format!("{BACKEND_NAME} ({place}, kernel fusion)")
    } else {
        format!("{BACKEND_NAME} ({place})")
    }
}
