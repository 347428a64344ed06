//! Exponential moving average of model weights.
//!
//! The shadow lives on the inner (non-autodiff) backend, so it is always in
//! inference mode: dropout is inactive and batch norm uses running stats.

use burn::module::{AutodiffModule, ModuleMapper, ParamId};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use crate::model::ImageClassifier;
use crate::params::ParamSnapshot;

pub struct EmaModel<B: AutodiffBackend, M: AutodiffModule<B>> {
    shadow: M::InnerModule,
    decay: f64,
}

struct EmaMapper<'a, B: AutodiffBackend> {
    online: &'a ParamSnapshot<B>,
    decay: f64,
}

impl<B: AutodiffBackend> ModuleMapper<B::InnerBackend> for EmaMapper<'_, B> {
    fn map_float<const D: usize>(
        &mut self,
        id: ParamId,
        tensor: Tensor<B::InnerBackend, D>,
    ) -> Tensor<B::InnerBackend, D> {
        let Some(online) = self.online.get(&id) else {
            return tensor;
        };
        let online = online.clone().reshape(tensor.dims());

        if self.online.is_trainable(&id) {
            tensor.mul_scalar(self.decay) + online.mul_scalar(1.0 - self.decay)
        } else {
            // running statistics are copied, not averaged
            online
        }
    }
}

impl<B: AutodiffBackend, M: AutodiffModule<B>> EmaModel<B, M> {
    /// The shadow starts as an exact copy of `model`
    pub fn new(model: &M, decay: f64) -> Self {
        Self {
            shadow: model.valid(),
            decay,
        }
    }

    pub fn decay(&self) -> f64 {
        self.decay
    }

    /// `shadow = decay * shadow + (1 - decay) * online` for trainable
    /// parameters; buffers are copied from the online model.
    pub fn update(&mut self, online: &M) {
        let snapshot = ParamSnapshot::capture(online);
        let mut mapper = EmaMapper::<B> {
            online: &snapshot,
            decay: self.decay,
        };
        self.shadow = self.shadow.clone().map(&mut mapper);
    }

    pub fn shadow(&self) -> &M::InnerModule {
        &self.shadow
    }

    pub fn set_shadow(&mut self, shadow: M::InnerModule) {
        self.shadow = shadow;
    }

    pub fn into_shadow(self) -> M::InnerModule {
        self.shadow
    }
}

impl<B, M> EmaModel<B, M>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    M::InnerModule: ImageClassifier<B::InnerBackend>,
{
    pub fn forward(&self, images: Tensor<B::InnerBackend, 4>) -> Tensor<B::InnerBackend, 2> {
        self.shadow.forward(images)
    }
}
