//! Training helpers for DeepLab.
//!
//! The backbone is fine-tuned at the base learning rate while the freshly
//! initialized ASPP and decoder learn ten times faster.

use burn::{
    optim::{GradientsParams, Optimizer},
    tensor::backend::AutodiffBackend,
    LearningRate,
};

use crate::models::{DeepLab, ParamGroup};

/// Applies one optimizer per parameter group with its own learning rate.
#[derive(Debug)]
pub struct DifferentialLrOptimizer<O> {
    optimizer: O,
}

impl<O> DifferentialLrOptimizer<O> {
    /// Wraps `optimizer`.
    pub const fn new(optimizer: O) -> Self {
        Self { optimizer }
    }

    /// Returns the wrapped optimizer.
    pub fn into_inner(self) -> O {
        self.optimizer
    }

    /// Updates `model` from the gradients of one backward pass.
    ///
    /// Each group of [`DeepLab::group_params`] is stepped at
    /// `lr * group.lr_multiplier()`: `lr` for the backbone and `lr * 10` for
    /// the ASPP and decoder. Only trainable parameters with a gradient change.
    pub fn step<B>(
        &mut self,
        lr: LearningRate,
        mut model: DeepLab<B>,
        mut grads: B::Gradients,
    ) -> DeepLab<B>
    where
        B: AutodiffBackend,
        O: Optimizer<DeepLab<B>, B>,
    {
        for group in [ParamGroup::Backbone, ParamGroup::Head] {
            let params = model.group_params(group);
            let group_grads = GradientsParams::from_params(&mut grads, &model, &params);
            if group_grads.is_empty() {
                continue;
            }
            model = self
                .optimizer
                .step(lr * group.lr_multiplier(), model, group_grads);
        }
        model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DeepLabConfig, ResNetDepth, ASPP_CHANNELS};
    use burn::{
        backend::{ndarray::NdArray, Autodiff},
        optim::SgdConfig,
        prelude::*,
        tensor::Distribution,
    };

    type TestBackend = Autodiff<NdArray<f32>>;

    fn small_model(device: &Device<TestBackend>) -> DeepLab<TestBackend> {
        DeepLabConfig::new()
            .with_backbone(ResNetDepth::ResNet18)
            .with_sync_bn(false)
            .with_num_classes(2)
            .init::<TestBackend>(device)
            .unwrap()
    }

    /// Scalar loss reaching the backbone and the classifier head without
    /// going through a bilinear resize.
    fn loss(
        model: &DeepLab<TestBackend>,
        device: &Device<TestBackend>,
    ) -> Tensor<TestBackend, 1> {
        let input = Tensor::random([2, 3, 32, 32], Distribution::Default, device);
        let (deep, low_level) = model.backbone().forward(input);

        let features = Tensor::random([2, ASPP_CHANNELS, 8, 8], Distribution::Default, device);
        let logits = model.forward_class_last_conv_finetune(features);

        deep.sum() + low_level.sum() + logits.sum()
    }

    fn values(tensor: Tensor<TestBackend, 1>) -> Vec<f32> {
        tensor.inner().into_data().to_vec::<f32>().unwrap()
    }

    fn assert_stepped(before: &[f32], grad: &[f32], after: &[f32], lr: f32) {
        assert_eq!(before.len(), after.len());
        for ((b, g), a) in before.iter().zip(grad).zip(after) {
            let expected = b - lr * g;
            assert!(
                (a - expected).abs() <= 1e-4 * expected.abs().max(1.0),
                "{a} != {expected}"
            );
        }
    }

    #[test]
    fn head_moves_ten_times_faster() {
        let device = Default::default();
        let model = small_model(&device);
        let grads = loss(&model, &device).backward();

        let bias = model.decoder().classifier().bias.as_ref().unwrap();
        let bias_before = values(bias.val());
        let bias_grad = bias.grad(&grads).unwrap().into_data().to_vec::<f32>().unwrap();

        let bn = &model.backbone().conv1_block.bn1;
        let bn_before = values(bn.bias.val());
        let bn_grad = bn.bias.grad(&grads).unwrap().into_data().to_vec::<f32>().unwrap();
        let mean_before = values(bn.running_mean.value());

        let lr = 0.01;
        let mut optimizer = DifferentialLrOptimizer::new(
            SgdConfig::new().init::<TestBackend, DeepLab<TestBackend>>(),
        );
        let model = optimizer.step(lr, model, grads);

        let bias_after = values(model.decoder().classifier().bias.as_ref().unwrap().val());
        let bn = &model.backbone().conv1_block.bn1;

        assert_stepped(&bias_before, &bias_grad, &bias_after, 0.1);
        assert_stepped(&bn_before, &bn_grad, &values(bn.bias.val()), 0.01);
        assert_eq!(values(bn.running_mean.value()), mean_before);
    }

    #[test]
    fn detached_backbone_is_not_updated() {
        let device = Default::default();
        let model = small_model(&device);
        let model = DeepLab {
            backbone: model.backbone.no_grad(),
            ..model
        };
        assert!(model.group_params(ParamGroup::Backbone).is_empty());

        let grads = loss(&model, &device).backward();
        let bn_before = values(model.backbone().conv1_block.bn1.bias.val());
        let bias_before = values(model.decoder().classifier().bias.as_ref().unwrap().val());

        let mut optimizer = DifferentialLrOptimizer::new(
            SgdConfig::new().init::<TestBackend, DeepLab<TestBackend>>(),
        );
        let model = optimizer.step(0.01, model, grads);

        assert_eq!(values(model.backbone().conv1_block.bn1.bias.val()), bn_before);
        assert_ne!(
            values(model.decoder().classifier().bias.as_ref().unwrap().val()),
            bias_before
        );
    }
}
