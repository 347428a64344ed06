//! Classifier architectures and the name-based model registry.
//!
//! Implements:
//! - Wide-ResNet (28-2, 28-8 and the four-stage 37-2 variant)
//! - CnnLite, a small network for quick runs
//! - The `ImageClassifier` contract the training loop depends on

use std::path::Path;

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d,
    },
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::{activation::leaky_relu, backend::Backend, Tensor},
};
use freematch_core::{Error, ModelConfig};
use tracing::info;

const LEAKY_SLOPE: f64 = 0.1;
const BN_MOMENTUM: f64 = 0.001;

/// Forward contract between the training loop and any architecture
pub trait ImageClassifier<B: Backend> {
    /// `[N, 3, H, W]` images to `[N, num_classes]` logits
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;

    fn num_classes(&self) -> usize;
}

/// Registry of the available architectures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Wrn28x2,
    Wrn28x8,
    Wrn37x2,
    CnnLite,
}

impl ModelKind {
    pub fn from_name(name: &str) -> freematch_core::Result<Self> {
        match name {
            "wrn_28_2" => Ok(Self::Wrn28x2),
            "wrn_28_8" => Ok(Self::Wrn28x8),
            "wrn_37_2" => Ok(Self::Wrn37x2),
            "cnn_lite" => Ok(Self::CnnLite),
            other => Err(Error::Model(format!("Unknown model '{other}'"))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Wrn28x2 => "wrn_28_2",
            Self::Wrn28x8 => "wrn_28_8",
            Self::Wrn37x2 => "wrn_37_2",
            Self::CnnLite => "cnn_lite",
        }
    }

    pub fn build<B: Backend>(
        &self,
        num_classes: usize,
        dropout: f64,
        device: &B::Device,
    ) -> FreeMatchModel<B> {
        let wrn = |widen_factor, num_stages, first_stride| {
            WideResNetConfig::new(num_classes)
                .with_widen_factor(widen_factor)
                .with_num_stages(num_stages)
                .with_first_stride(first_stride)
                .with_dropout(dropout)
        };

        match self {
            Self::Wrn28x2 => FreeMatchModel::WideResNet(wrn(2, 3, 1).init(device)),
            Self::Wrn28x8 => FreeMatchModel::WideResNet(wrn(8, 3, 1).init(device)),
            Self::Wrn37x2 => FreeMatchModel::WideResNet(wrn(2, 4, 2).init(device)),
            Self::CnnLite => FreeMatchModel::CnnLite(
                CnnLiteConfig::new(num_classes)
                    .with_dropout(dropout)
                    .init(device),
            ),
        }
    }
}

/// Build the configured architecture, loading pretrained weights when asked
pub fn build_model<B: Backend>(
    config: &ModelConfig,
    num_classes: usize,
    device: &B::Device,
) -> freematch_core::Result<FreeMatchModel<B>> {
    let kind = ModelKind::from_name(&config.name)?;
    let model = kind.build::<B>(num_classes, config.dropout, device);

    if !config.pretrained {
        return Ok(model);
    }
    let path = config
        .pretrained_path
        .as_deref()
        .ok_or_else(|| Error::Model("pretrained = true needs pretrained_path".into()))?;
    load_pretrained(model, path, device)
}

fn load_pretrained<B: Backend>(
    model: FreeMatchModel<B>,
    path: &Path,
    device: &B::Device,
) -> freematch_core::Result<FreeMatchModel<B>> {
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    let model = model
        .load_file(path.to_path_buf(), &recorder, device)
        .map_err(|e| Error::Model(format!("Failed to load weights from {}: {e}", path.display())))?;
    info!("Loaded pretrained weights from {}", path.display());
    Ok(model)
}

/// Any architecture from the registry
#[derive(Module, Debug)]
pub enum FreeMatchModel<B: Backend> {
    WideResNet(WideResNet<B>),
    CnnLite(CnnLite<B>),
}

impl<B: Backend> ImageClassifier<B> for FreeMatchModel<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        match self {
            Self::WideResNet(model) => model.forward(images),
            Self::CnnLite(model) => model.forward(images),
        }
    }

    fn num_classes(&self) -> usize {
        match self {
            Self::WideResNet(model) => model.num_classes,
            Self::CnnLite(model) => model.num_classes,
        }
    }
}

#[derive(Config, Debug)]
pub struct WideResNetConfig {
    pub num_classes: usize,
    #[config(default = "2")]
    pub widen_factor: usize,
    /// Basic blocks per stage, `(28 - 4) / 6` for WRN-28
    #[config(default = "4")]
    pub blocks_per_stage: usize,
    #[config(default = "3")]
    pub num_stages: usize,
    #[config(default = "1")]
    pub first_stride: usize,
    #[config(default = "0.0")]
    pub dropout: f64,
}

impl WideResNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> WideResNet<B> {
        let mut channels = vec![16];
        channels.extend((0..self.num_stages).map(|i| 16 * self.widen_factor << i));

        let conv1 = Conv2dConfig::new([3, channels[0]], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);

        let stages = (0..self.num_stages)
            .map(|i| {
                let stride = if i == 0 { self.first_stride } else { 2 };
                NetworkBlock::new(
                    self.blocks_per_stage,
                    channels[i],
                    channels[i + 1],
                    stride,
                    i == 0,
                    self.dropout,
                    device,
                )
            })
            .collect();

        let features = channels[self.num_stages];
        WideResNet {
            conv1,
            stages,
            bn: BatchNormConfig::new(features).with_momentum(BN_MOMENTUM).init(device),
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc: LinearConfig::new(features, self.num_classes).init(device),
            num_classes: self.num_classes,
        }
    }
}

#[derive(Module, Debug)]
pub struct WideResNet<B: Backend> {
    conv1: Conv2d<B>,
    stages: Vec<NetworkBlock<B>>,
    bn: BatchNorm<B, 2>,
    pool: AdaptiveAvgPool2d,
    fc: Linear<B>,
    num_classes: usize,
}

impl<B: Backend> WideResNet<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = self.conv1.forward(input);
        for stage in &self.stages {
            x = stage.forward(x);
        }
        let x = leaky_relu(self.bn.forward(x), LEAKY_SLOPE);
        let x = self.pool.forward(x);
        let [n, c, _, _] = x.dims();
        self.fc.forward(x.reshape([n, c]))
    }
}

#[derive(Module, Debug)]
pub struct NetworkBlock<B: Backend> {
    blocks: Vec<BasicBlock<B>>,
}

impl<B: Backend> NetworkBlock<B> {
    fn new(
        num_blocks: usize,
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        activate_before_residual: bool,
        dropout: f64,
        device: &B::Device,
    ) -> Self {
        let blocks = (0..num_blocks)
            .map(|i| {
                let (input, stride) = if i == 0 {
                    (in_channels, stride)
                } else {
                    (out_channels, 1)
                };
                BasicBlock::new(
                    input,
                    out_channels,
                    stride,
                    activate_before_residual,
                    dropout,
                    device,
                )
            })
            .collect();
        Self { blocks }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.blocks.iter().fold(input, |x, block| block.forward(x))
    }
}

/// Pre-activation residual block
#[derive(Module, Debug)]
pub struct BasicBlock<B: Backend> {
    bn1: BatchNorm<B, 2>,
    conv1: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    dropout: Dropout,
    /// 1x1 projection when the channel count changes
    shortcut: Option<Conv2d<B>>,
    activate_before_residual: bool,
}

impl<B: Backend> BasicBlock<B> {
    fn new(
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        activate_before_residual: bool,
        dropout: f64,
        device: &B::Device,
    ) -> Self {
        let conv3x3 = |input, output, stride| {
            Conv2dConfig::new([input, output], [3, 3])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(false)
                .init(device)
        };

        let shortcut = (in_channels != out_channels).then(|| {
            Conv2dConfig::new([in_channels, out_channels], [1, 1])
                .with_stride([stride, stride])
                .with_bias(false)
                .init(device)
        });

        Self {
            bn1: BatchNormConfig::new(in_channels).with_momentum(BN_MOMENTUM).init(device),
            conv1: conv3x3(in_channels, out_channels, stride),
            bn2: BatchNormConfig::new(out_channels).with_momentum(BN_MOMENTUM).init(device),
            conv2: conv3x3(out_channels, out_channels, 1),
            dropout: DropoutConfig::new(dropout).init(),
            shortcut,
            activate_before_residual,
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let pre = leaky_relu(self.bn1.forward(x.clone()), LEAKY_SLOPE);

        match &self.shortcut {
            None => {
                let out = self.residual(pre);
                x + out
            }
            Some(shortcut) => {
                // The first block of a stage may project the raw input instead
                let x = if self.activate_before_residual { pre } else { x };
                let out = self.residual(x.clone());
                shortcut.forward(x) + out
            }
        }
    }

    fn residual(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = leaky_relu(self.bn2.forward(self.conv1.forward(x)), LEAKY_SLOPE);
        let out = self.dropout.forward(out);
        self.conv2.forward(out)
    }
}

#[derive(Config, Debug)]
pub struct CnnLiteConfig {
    pub num_classes: usize,
    #[config(default = "16")]
    pub base_filters: usize,
    #[config(default = "0.0")]
    pub dropout: f64,
}

impl CnnLiteConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> CnnLite<B> {
        let f = self.base_filters;
        let conv = |input, output| {
            Conv2dConfig::new([input, output], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device)
        };

        CnnLite {
            conv1: conv(3, f),
            bn1: BatchNormConfig::new(f).init(device),
            conv2: conv(f, 2 * f),
            bn2: BatchNormConfig::new(2 * f).init(device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            global_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            dropout: DropoutConfig::new(self.dropout).init(),
            fc: LinearConfig::new(2 * f, self.num_classes).init(device),
            num_classes: self.num_classes,
        }
    }
}

#[derive(Module, Debug)]
pub struct CnnLite<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    pool: MaxPool2d,
    global_pool: AdaptiveAvgPool2d,
    dropout: Dropout,
    fc: Linear<B>,
    num_classes: usize,
}

impl<B: Backend> CnnLite<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = leaky_relu(self.bn1.forward(self.conv1.forward(input)), LEAKY_SLOPE);
        let x = self.pool.forward(x);
        let x = leaky_relu(self.bn2.forward(self.conv2.forward(x)), LEAKY_SLOPE);
        let x = self.global_pool.forward(x);
        let [n, c, _, _] = x.dims();
        let x = self.dropout.forward(x.reshape([n, c]));
        self.fc.forward(x)
    }
}
