//! Model-level tests.

use std::collections::HashSet;

use crate::{
    DeepLab, DeepLabConfig, DeepLabError, ParamGroup, ResNetDepth, StateDict, StateDictError,
    ASPP_CHANNELS,
};
use burn::{
    backend::{ndarray::NdArray, Autodiff},
    module::list_param_ids,
    optim::GradientsParams,
    prelude::*,
    tensor::Distribution,
};
use burn_extra_ops::trainable_param_ids;

type TestBackend = NdArray<f32>;
type TestAutodiffBackend = Autodiff<TestBackend>;

fn small_config() -> DeepLabConfig {
    DeepLabConfig::new()
        .with_backbone(ResNetDepth::ResNet18)
        .with_sync_bn(false)
        .with_num_classes(3)
}

fn small_model<B: Backend>(config: &DeepLabConfig, device: &Device<B>) -> DeepLab<B> {
    config.init(device).unwrap()
}

fn to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f32> {
    tensor.into_data().to_vec::<f32>().unwrap()
}

#[test]
fn test_forward_output_stride_16() {
    let device = Default::default();
    let model = small_model::<TestBackend>(&small_config(), &device);

    let input = Tensor::random([2, 3, 64, 64], Distribution::Default, &device);
    let output = model.forward(input);

    assert_eq!(output.dims(), [2, 3, 64, 64]);
}

#[test]
fn test_forward_output_stride_8_non_square() {
    let device = Default::default();
    let config = small_config().with_output_stride(8);
    let model = small_model::<TestBackend>(&config, &device);

    let input = Tensor::random([1, 3, 40, 56], Distribution::Default, &device);
    let output = model.forward(input);

    assert_eq!(output.dims(), [1, 3, 40, 56]);
}

#[test]
fn test_class_prediction_entry_points() {
    let device = Default::default();
    let model = small_model::<TestBackend>(&small_config(), &device);
    let input = Tensor::random([1, 3, 64, 64], Distribution::Default, &device);

    let features = model.forward_before_class_prediction(input);
    assert_eq!(features.dims(), [1, ASPP_CHANNELS, 16, 16]);

    let logits = model.forward_class_prediction(features, [64, 64]);
    assert_eq!(logits.dims(), [1, 3, 64, 64]);
}

#[test]
fn test_last_conv_finetune_entry_points() {
    let device = Default::default();
    let model = small_model::<TestBackend>(&small_config(), &device);
    let input = Tensor::random([1, 3, 64, 64], Distribution::Default, &device);

    let features = model.forward_before_last_conv_finetune(input);
    assert_eq!(features.dims(), [1, ASPP_CHANNELS, 16, 16]);

    // Logits stay at 1/4 resolution
    let logits = model.forward_class_last_conv_finetune(features);
    assert_eq!(logits.dims(), [1, 3, 16, 16]);
}

#[test]
fn test_staged_forward_matches_full_forward() {
    let device = Default::default();
    let model = small_model::<TestBackend>(&small_config(), &device);
    let input = Tensor::<TestBackend, 4>::random([1, 3, 32, 48], Distribution::Default, &device);

    let full = to_vec(model.forward(input.clone()));
    let features = model.forward_before_class_prediction(input);
    let staged = to_vec(model.forward_class_prediction(features, [32, 48]));

    for (a, b) in full.iter().zip(&staged) {
        assert!((a - b).abs() < 1e-4, "{a} != {b}");
    }
}

#[test]
fn test_freeze_bn_keeps_running_statistics() {
    let device = Default::default();
    let model = small_model::<TestAutodiffBackend>(&small_config(), &device).freeze_bn();
    let bn = &model.backbone().conv1_block.bn1;
    let mean_before = to_vec(bn.running_mean.value_sync());

    let input = Tensor::random([2, 3, 32, 32], Distribution::Default, &device);
    let _ = model.forward(input);

    assert!(bn.is_frozen());
    assert_eq!(to_vec(bn.running_mean.value_sync()), mean_before);
}

#[test]
fn test_unfrozen_bn_updates_running_statistics() {
    let device = Default::default();
    let model = small_model::<TestAutodiffBackend>(&small_config(), &device);
    let bn = &model.backbone().conv1_block.bn1;
    let mean_before = to_vec(bn.running_mean.value_sync());

    let input = Tensor::random([2, 3, 32, 32], Distribution::Normal(1.0, 1.0), &device);
    let _ = model.forward(input);

    assert!(!bn.is_frozen());
    assert_ne!(to_vec(bn.running_mean.value_sync()), mean_before);
}

#[test]
fn test_freeze_bn_from_config() {
    let device = Default::default();
    let model = small_model::<TestBackend>(&small_config().with_freeze_bn(true), &device);

    assert!(model.backbone().conv1_block.bn1.is_frozen());
}

#[test]
fn test_sync_bn_is_recorded() {
    let device = Default::default();
    let config = small_config().with_sync_bn(true);
    let model = small_model::<TestBackend>(&config, &device);

    assert!(model.backbone().conv1_block.bn1.is_synchronized());
}

#[test]
fn test_param_groups_partition_trainable_parameters() {
    let device = Default::default();
    let model = small_model::<TestAutodiffBackend>(&small_config(), &device);

    let backbone: HashSet<_> = model.backbone_params().collect();
    let head: HashSet<_> = model.head_params().collect();
    let trainable: HashSet<_> = trainable_param_ids(&model).into_iter().collect();

    assert!(!backbone.is_empty());
    assert!(!head.is_empty());
    assert!(backbone.is_disjoint(&head));
    assert_eq!(&backbone | &head, trainable);
    assert_eq!(model.group_params(ParamGroup::Head).len(), head.len());

    let bn = &model.backbone().conv1_block.bn1;
    assert!(backbone.contains(&bn.weight.id));
    assert!(backbone.contains(&bn.bias.id));
    assert!(head.contains(&model.decoder().classifier().weight.id));

    assert_eq!(ParamGroup::Backbone.lr_multiplier(), 1.0);
    assert_eq!(ParamGroup::Head.lr_multiplier(), 10.0);
}

#[test]
fn test_param_groups_skip_running_statistics() {
    let device = Default::default();
    let model = small_model::<TestAutodiffBackend>(&small_config(), &device);
    let backbone = model.group_params(ParamGroup::Backbone);

    // Each norm holds a weight and a bias next to two running statistics
    let all = list_param_ids(model.backbone());
    assert!(backbone.len() < all.len());

    let input = Tensor::random([1, 3, 32, 32], Distribution::Default, &device);
    let (deep, low_level) = model.backbone().forward(input);
    let mut grads = (deep.sum() + low_level.sum()).backward();
    let with_grad = GradientsParams::from_module(&mut grads, model.backbone());

    assert_eq!(with_grad.len(), backbone.len());
    let bn = &model.backbone().conv1_block.bn1;
    assert!(with_grad.get::<TestBackend, 1>(bn.weight.id).is_some());
    assert!(backbone.contains(&bn.weight.id));
}

#[test]
fn test_detached_backbone_has_no_trainable_params() {
    let device = Default::default();
    let model = small_model::<TestAutodiffBackend>(&small_config(), &device);
    let model = DeepLab {
        backbone: model.backbone.no_grad(),
        ..model
    };

    assert_eq!(model.backbone_params().count(), 0);
    assert!(model.head_params().count() > 0);
}

#[test]
fn test_apply_state_dict_strips_prefix() {
    let device = Default::default();
    let model = small_model::<TestBackend>(&small_config(), &device);

    let mut state = StateDict::new(&device);
    state.insert(
        "module.decoder.last_conv.8.bias",
        TensorData::new(vec![1.0f32, 2.0, 3.0], [3]),
    );
    state.insert(
        "module.backbone.bn1.running_var",
        TensorData::new(vec![9.0f32; 64], [64]),
    );
    state.insert("module.fc.weight", TensorData::new(vec![0.0f32; 4], [2, 2]));

    let (model, report) = model.apply_state_dict(state, 7).unwrap();

    let bias = model.decoder().classifier().bias.as_ref().unwrap().val();
    assert_eq!(to_vec(bias), vec![1.0, 2.0, 3.0]);
    let running_var = model.backbone().conv1_block.bn1.running_var.value();
    assert_eq!(to_vec(running_var), vec![9.0; 64]);

    assert_eq!(report.loaded.len(), 2);
    assert_eq!(report.unused, vec!["fc.weight"]);
    assert!(report
        .missing
        .contains(&"aspp.global_avg_pool.1.weight".to_string()));
}

#[test]
fn test_apply_state_dict_keeps_missing_parameters() {
    let device = Default::default();
    let model = small_model::<TestBackend>(&small_config(), &device);
    let weight_before = to_vec(model.decoder().classifier().weight.val());

    let (model, report) = model
        .apply_state_dict(StateDict::new(&device), 7)
        .unwrap();

    assert_eq!(to_vec(model.decoder().classifier().weight.val()), weight_before);
    assert!(report.loaded.is_empty());
    assert!(report.unused.is_empty());
    assert!(report
        .missing
        .contains(&"decoder.last_conv.8.weight".to_string()));
    assert!(report
        .missing
        .contains(&"backbone.layer4.1.bn2.running_var".to_string()));
}

#[test]
fn test_apply_state_dict_shape_mismatch() {
    let device = Default::default();
    let model = small_model::<TestBackend>(&small_config(), &device);

    let mut state = StateDict::new(&device);
    state.insert(
        "module.decoder.last_conv.8.bias",
        TensorData::new(vec![0.0f32; 21], [21]),
    );

    match model.apply_state_dict(state, 7) {
        Err(DeepLabError::WeightLoadingFailed(StateDictError::ShapeMismatch {
            key, ..
        })) => assert_eq!(key, "decoder.last_conv.8.bias"),
        other => panic!("Expected ShapeMismatch error, got {:?}", other.err()),
    }
}

#[test]
fn test_loading_keeps_frozen_norms() {
    let device = Default::default();
    let model = small_model::<TestBackend>(&small_config(), &device).freeze_bn();

    let mut state = StateDict::new(&device);
    state.insert(
        "module.backbone.bn1.weight",
        TensorData::new(vec![0.5f32; 64], [64]),
    );
    let (model, _) = model.apply_state_dict(state, 7).unwrap();

    assert!(model.backbone().conv1_block.bn1.is_frozen());
}

#[test]
fn test_invalid_config_is_rejected() {
    let device = Default::default();
    let result = small_config()
        .with_output_stride(4)
        .init::<TestBackend>(&device);

    assert!(matches!(
        result,
        Err(DeepLabError::UnsupportedOutputStride { output_stride: 4 })
    ));
}

#[cfg(feature = "pretrained")]
#[test]
fn test_pretrained_missing_checkpoint() {
    let device = Default::default();
    let result = small_config()
        .with_pretrained(true)
        .with_pretrained_path(Some("does/not/exist.pth".into()))
        .init::<TestBackend>(&device);

    assert!(matches!(
        result,
        Err(DeepLabError::WeightLoadingFailed(StateDictError::Read { .. }))
    ));
}
