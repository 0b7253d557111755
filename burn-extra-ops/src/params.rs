//! Parameter enumeration for optimizer groups.

use burn::{
    module::{Module, ModuleVisitor, ParamId},
    prelude::*,
};

struct TrainableParamIds<'a> {
    ids: &'a mut Vec<ParamId>,
}

impl<B: Backend> ModuleVisitor<B> for TrainableParamIds<'_> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        // Running statistics never track gradients
        if tensor.is_require_grad() {
            self.ids.push(id);
        }
    }
}

/// Lists the ids of the float parameters of `module` that require gradients.
///
/// Buffers such as batch norm running statistics and parameters detached with
/// `no_grad` are skipped. Gradients are only tracked on autodiff backends, so
/// the list is empty on any other backend.
pub fn trainable_param_ids<M: Module<B>, B: Backend>(module: &M) -> Vec<ParamId> {
    let mut ids = Vec::new();
    module.visit(&mut TrainableParamIds { ids: &mut ids });
    ids
}
