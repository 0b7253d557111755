//! Batch normalization with explicit freezing.
//!
//! Burn's own `BatchNorm` decides between batch statistics and running
//! statistics from the backend alone (autodiff or not). Fine-tuning with
//! small batches needs a third state: gradients flow through the affine
//! parameters while the running statistics stay fixed. `BatchNorm2d` adds
//! that state and names its parameters the way PyTorch checkpoints do.

use burn::{
    module::{Param, RunningState},
    nn::Initializer,
    prelude::*,
};

use crate::state_dict::{LoadStateDict, StateDict, StateDictResult};

/// Kind of batch normalization requested by a model configuration.
#[derive(Config, Debug, PartialEq)]
pub enum NormKind {
    /// Statistics computed on the local batch.
    Batch,
    /// Statistics aggregated across parallel workers.
    SyncBatch,
}

/// Configuration for [`BatchNorm2d`].
#[derive(Config, Debug)]
pub struct BatchNorm2dConfig {
    /// Number of channels.
    pub num_features: usize,
    /// Value added to the variance for numerical stability.
    #[config(default = 1e-5)]
    pub epsilon: f64,
    /// Weight of the current batch when updating running statistics.
    #[config(default = 0.1)]
    pub momentum: f64,
    /// Normalization kind.
    #[config(default = "NormKind::Batch")]
    pub kind: NormKind,
}

impl BatchNorm2dConfig {
    /// Initializes a new [`BatchNorm2d`] with weight 1, bias 0, mean 0 and variance 1.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> BatchNorm2d<B> {
        let weight = Initializer::Ones.init([self.num_features], device);
        let bias = Initializer::Zeros.init([self.num_features], device);
        let running_mean = Tensor::zeros([self.num_features], device);
        let running_var = Tensor::ones([self.num_features], device);

        BatchNorm2d {
            weight,
            bias,
            running_mean: RunningState::new(running_mean),
            running_var: RunningState::new(running_var),
            momentum: self.momentum,
            epsilon: self.epsilon,
            synchronized: self.kind == NormKind::SyncBatch,
            frozen: false,
        }
    }
}

/// Batch normalization over `[batch, channels, height, width]` tensors.
#[derive(Module, Debug)]
pub struct BatchNorm2d<B: Backend> {
    /// Learnable scale.
    pub weight: Param<Tensor<B, 1>>,
    /// Learnable shift.
    pub bias: Param<Tensor<B, 1>>,
    /// Running mean used at inference.
    pub running_mean: RunningState<Tensor<B, 1>>,
    /// Running variance used at inference.
    pub running_var: RunningState<Tensor<B, 1>>,
    momentum: f64,
    epsilon: f64,
    synchronized: bool,
    frozen: bool,
}

impl<B: Backend> BatchNorm2d<B> {
    /// Normalizes the input.
    ///
    /// Batch statistics are used (and folded into the running statistics)
    /// only when the backend tracks gradients and the module is not frozen.
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        if B::ad_enabled() && !self.frozen {
            self.forward_train(input)
        } else {
            self.forward_inference(input)
        }
    }

    /// Switches the module to inference statistics for good.
    pub fn freeze(mut self) -> Self {
        self.frozen = true;
        self
    }

    /// Whether running statistics are fixed.
    pub const fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Whether the module was built as a synchronized batch norm.
    pub const fn is_synchronized(&self) -> bool {
        self.synchronized
    }

    fn forward_inference(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let device = input.device();
        let channels = input.dims()[1];
        let mean = self.running_mean.value().to_device(&device);
        let var = self.running_var.value().to_device(&device);

        self.forward_shared(
            input,
            mean.reshape([1, channels, 1, 1]),
            var.reshape([1, channels, 1, 1]),
        )
    }

    fn forward_train(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch_size, channels, height, width] = input.dims();
        let flatten_size = batch_size * height * width;

        let mean = input
            .clone()
            .swap_dims(0, 1)
            .reshape([channels, flatten_size])
            .mean_dim(1)
            .reshape([1, channels, 1, 1]);
        let var = input
            .clone()
            .sub(mean.clone())
            .powi_scalar(2)
            .swap_dims(0, 1)
            .reshape([channels, flatten_size])
            .mean_dim(1)
            .reshape([1, channels, 1, 1]);

        let running_mean = self.running_mean.value_sync();
        let running_var = self.running_var.value_sync();

        let running_mean = running_mean.mul_scalar(1.0 - self.momentum).add(
            mean.clone()
                .detach()
                .mul_scalar(self.momentum)
                .reshape([channels]),
        );
        let running_var = running_var.mul_scalar(1.0 - self.momentum).add(
            var.clone()
                .detach()
                .mul_scalar(self.momentum)
                .reshape([channels]),
        );

        self.running_mean.update(running_mean.detach());
        self.running_var.update(running_var.detach());

        self.forward_shared(input, mean, var)
    }

    fn forward_shared(
        &self,
        input: Tensor<B, 4>,
        mean: Tensor<B, 4>,
        var: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let channels = input.dims()[1];
        let std = var.add_scalar(self.epsilon).sqrt();

        let x = input.sub(mean).div(std);
        let x = x.mul(self.weight.val().reshape([1, channels, 1, 1]));

        x.add(self.bias.val().reshape([1, channels, 1, 1]))
    }
}

impl<B: Backend> LoadStateDict<B> for BatchNorm2d<B> {
    fn load_state_dict(self, prefix: &str, state: &mut StateDict<B>) -> StateDictResult<Self> {
        let weight = state.load_param(&format!("{prefix}.weight"), self.weight)?;
        let bias = state.load_param(&format!("{prefix}.bias"), self.bias)?;
        let running_mean =
            state.load_running(&format!("{prefix}.running_mean"), self.running_mean)?;
        let running_var = state.load_running(&format!("{prefix}.running_var"), self.running_var)?;

        Ok(Self {
            weight,
            bias,
            running_mean,
            running_var,
            ..self
        })
    }
}
