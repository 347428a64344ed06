//! Parameter and gradient utilities built on burn's module visitors.
//!
//! Tensors are addressed by [`ParamId`], which stays stable across
//! `Module::map`, so gradients, perturbations and snapshots taken from one
//! version of a model apply to any later version of it.

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;

use burn::module::{AutodiffModule, ModuleMapper, ModuleVisitor, ParamId};
use burn::optim::GradientsParams;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use crate::losses::scalar;

/// Detached copy of every float tensor of a module, parameters and
/// running statistics alike.
///
/// Copies are kept on the inner backend. Restoring builds fresh leaf
/// tensors, so a restored parameter can be tracked again regardless of the
/// graph the replaced tensor belonged to.
pub struct ParamSnapshot<B: AutodiffBackend> {
    tensors: HashMap<ParamId, Tensor<B::InnerBackend, 1>>,
    trainable: HashSet<ParamId>,
}

struct SnapshotVisitor<'a, B: AutodiffBackend> {
    snapshot: &'a mut ParamSnapshot<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for SnapshotVisitor<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        if tensor.is_require_grad() {
            self.snapshot.trainable.insert(id);
        }
        let numel = tensor.shape().num_elements();
        self.snapshot
            .tensors
            .insert(id, tensor.clone().inner().reshape([numel]));
    }
}

struct RestoreMapper<'a, B: AutodiffBackend> {
    snapshot: &'a ParamSnapshot<B>,
}

impl<B: AutodiffBackend> ModuleMapper<B> for RestoreMapper<'_, B> {
    fn map_float<const D: usize>(&mut self, id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        match self.snapshot.tensors.get(&id) {
            Some(saved) => {
                let restored = Tensor::from_inner(saved.clone().reshape(tensor.dims()));
                if tensor.is_require_grad() {
                    restored.require_grad()
                } else {
                    restored
                }
            }
            None => tensor,
        }
    }
}

impl<B: AutodiffBackend> ParamSnapshot<B> {
    pub fn capture<M: AutodiffModule<B>>(module: &M) -> Self {
        let mut snapshot = Self {
            tensors: HashMap::new(),
            trainable: HashSet::new(),
        };
        module.visit(&mut SnapshotVisitor {
            snapshot: &mut snapshot,
        });
        snapshot
    }

    /// Overwrites every captured tensor of `module`, keeping the
    /// `require_grad` flag of the tensor being replaced.
    pub fn restore<M: AutodiffModule<B>>(&self, module: M) -> M {
        module.map(&mut RestoreMapper { snapshot: self })
    }

    /// Flattened copy of one tensor
    pub fn get(&self, id: &ParamId) -> Option<&Tensor<B::InnerBackend, 1>> {
        self.tensors.get(id)
    }

    /// Whether the tensor was a trainable parameter when captured
    pub fn is_trainable(&self, id: &ParamId) -> bool {
        self.trainable.contains(id)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

struct GradNormVisitor<'a, B: AutodiffBackend> {
    grads: &'a GradientsParams,
    sum_sq: Option<Tensor<B::InnerBackend, 1>>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradNormVisitor<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if let Some(grad) = self.grads.get::<B::InnerBackend, D>(id) {
            let sq = grad.powf_scalar(2.0).sum();
            self.sum_sq = Some(match self.sum_sq.take() {
                Some(acc) => acc + sq,
                None => sq,
            });
        }
    }
}

/// Global L2 norm over all gradients present in `grads`; `None` when the
/// model has no gradient at all.
pub fn grad_norm<B: AutodiffBackend, M: AutodiffModule<B>>(
    model: &M,
    grads: &GradientsParams,
) -> Option<f32> {
    let mut visitor = GradNormVisitor::<B> {
        grads,
        sum_sq: None,
    };
    model.visit(&mut visitor);
    visitor.sum_sq.map(|sum| scalar(sum).sqrt())
}

struct ScaleVisitor<'a, B: AutodiffBackend> {
    grads: &'a GradientsParams,
    scaled: GradientsParams,
    scale: f32,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for ScaleVisitor<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if let Some(grad) = self.grads.get::<B::InnerBackend, D>(id) {
            self.scaled.register(id, grad.mul_scalar(self.scale));
        }
    }
}

/// `grads * scale` for every gradient of `model`
pub fn scale_grads<B: AutodiffBackend, M: AutodiffModule<B>>(
    model: &M,
    grads: &GradientsParams,
    scale: f32,
) -> GradientsParams {
    let mut visitor = ScaleVisitor::<B> {
        grads,
        scaled: GradientsParams::new(),
        scale,
        _backend: PhantomData,
    };
    model.visit(&mut visitor);
    visitor.scaled
}

struct ShiftMapper<'a> {
    deltas: &'a GradientsParams,
    sign: f32,
}

impl<B: AutodiffBackend> ModuleMapper<B> for ShiftMapper<'_> {
    fn map_float<const D: usize>(&mut self, id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        let Some(delta) = self.deltas.get::<B::InnerBackend, D>(id) else {
            return tensor;
        };
        let is_require_grad = tensor.is_require_grad();
        let shifted = Tensor::from_inner(tensor.inner() + delta.mul_scalar(self.sign));
        if is_require_grad {
            shifted.require_grad()
        } else {
            shifted
        }
    }
}

/// `param + sign * delta` for every parameter with an entry in `deltas`
pub fn shift_params<B: AutodiffBackend, M: AutodiffModule<B>>(
    model: M,
    deltas: &GradientsParams,
    sign: f32,
) -> M {
    model.map(&mut ShiftMapper { deltas, sign })
}

struct FuseVisitor<'a, B: AutodiffBackend> {
    into: &'a mut GradientsParams,
    extra: &'a GradientsParams,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for FuseVisitor<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        let Some(extra) = self.extra.get::<B::InnerBackend, D>(id) else {
            return;
        };
        let fused = match self.into.remove::<B::InnerBackend, D>(id) {
            Some(grad) => grad + extra,
            None => extra,
        };
        self.into.register(id, fused);
    }
}

/// Elementwise `into += extra` over the parameters of `model`
pub fn fuse_grads<B: AutodiffBackend, M: AutodiffModule<B>>(
    model: &M,
    into: &mut GradientsParams,
    extra: &GradientsParams,
) {
    let mut visitor = FuseVisitor::<B> {
        into,
        extra,
        _backend: PhantomData,
    };
    model.visit(&mut visitor);
}
