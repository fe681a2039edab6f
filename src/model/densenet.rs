//! DenseNet backbone with a sigmoid classification head
//!
//! Parameter names follow the torchvision layout (`features.conv0`,
//! `features.denseblockN.denselayerM.norm1`, `features.transitionN.conv`,
//! `features.norm5`) so converted weights can be reused downstream. The
//! classifier is `Sequential(Linear, Sigmoid)`, hence `classifier.0.*`.

use candle_core::{Module, Result, Tensor};
use candle_nn::{batch_norm, conv2d_no_bias, linear, BatchNorm, Conv2d, Conv2dConfig, Linear, VarBuilder};
use serde::{Deserialize, Serialize};

const BATCH_NORM_EPS: f64 = 1e-5;

/// DenseNet hyperparameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenseNetConfig {
    /// Channels added by each dense layer
    pub growth_rate: usize,
    /// Dense layers per block
    pub block_config: Vec<usize>,
    /// Channels produced by the stem convolution
    pub num_init_features: usize,
    /// Bottleneck width multiplier
    pub bn_size: usize,
    /// Classifier outputs
    pub num_classes: usize,
}

impl DenseNetConfig {
    /// DenseNet-121 with a custom number of classes
    pub fn densenet121(num_classes: usize) -> Self {
        Self {
            growth_rate: 32,
            block_config: vec![6, 12, 24, 16],
            num_init_features: 64,
            bn_size: 4,
            num_classes,
        }
    }

    /// Channels entering the classifier
    pub fn num_features(&self) -> usize {
        let mut features = self.num_init_features;
        for (i, &layers) in self.block_config.iter().enumerate() {
            features += layers * self.growth_rate;
            if i + 1 != self.block_config.len() {
                features /= 2;
            }
        }
        features
    }
}

#[derive(Debug, Clone)]
struct DenseLayer {
    norm1: BatchNorm,
    conv1: Conv2d,
    norm2: BatchNorm,
    conv2: Conv2d,
}

impl DenseLayer {
    fn new(in_channels: usize, growth_rate: usize, bn_size: usize, vb: VarBuilder) -> Result<Self> {
        let bottleneck = bn_size * growth_rate;
        let conv3x3 = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };

        Ok(Self {
            norm1: batch_norm(in_channels, BATCH_NORM_EPS, vb.pp("norm1"))?,
            conv1: conv2d_no_bias(in_channels, bottleneck, 1, Default::default(), vb.pp("conv1"))?,
            norm2: batch_norm(bottleneck, BATCH_NORM_EPS, vb.pp("norm2"))?,
            conv2: conv2d_no_bias(bottleneck, growth_rate, 3, conv3x3, vb.pp("conv2"))?,
        })
    }
}

impl Module for DenseLayer {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let ys = xs
            .apply_t(&self.norm1, false)?
            .relu()?
            .apply(&self.conv1)?
            .apply_t(&self.norm2, false)?
            .relu()?
            .apply(&self.conv2)?;
        Tensor::cat(&[xs, &ys], 1)
    }
}

#[derive(Debug, Clone)]
struct Transition {
    norm: BatchNorm,
    conv: Conv2d,
}

impl Transition {
    fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm: batch_norm(in_channels, BATCH_NORM_EPS, vb.pp("norm"))?,
            conv: conv2d_no_bias(in_channels, out_channels, 1, Default::default(), vb.pp("conv"))?,
        })
    }
}

impl Module for Transition {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply_t(&self.norm, false)?
            .relu()?
            .apply(&self.conv)?
            .avg_pool2d(2)
    }
}

#[derive(Debug, Clone)]
struct Features {
    conv0: Conv2d,
    norm0: BatchNorm,
    blocks: Vec<Vec<DenseLayer>>,
    transitions: Vec<Transition>,
    norm5: BatchNorm,
}

impl Features {
    fn new(config: &DenseNetConfig, vb: VarBuilder) -> Result<Self> {
        let stem = Conv2dConfig {
            padding: 3,
            stride: 2,
            ..Default::default()
        };
        let conv0 = conv2d_no_bias(3, config.num_init_features, 7, stem, vb.pp("conv0"))?;
        let norm0 = batch_norm(config.num_init_features, BATCH_NORM_EPS, vb.pp("norm0"))?;

        let mut channels = config.num_init_features;
        let mut blocks = Vec::with_capacity(config.block_config.len());
        let mut transitions = Vec::new();

        for (i, &num_layers) in config.block_config.iter().enumerate() {
            let block_vb = vb.pp(format!("denseblock{}", i + 1));
            let mut layers = Vec::with_capacity(num_layers);
            for j in 0..num_layers {
                layers.push(DenseLayer::new(
                    channels + j * config.growth_rate,
                    config.growth_rate,
                    config.bn_size,
                    block_vb.pp(format!("denselayer{}", j + 1)),
                )?);
            }
            blocks.push(layers);
            channels += num_layers * config.growth_rate;

            if i + 1 != config.block_config.len() {
                transitions.push(Transition::new(
                    channels,
                    channels / 2,
                    vb.pp(format!("transition{}", i + 1)),
                )?);
                channels /= 2;
            }
        }

        let norm5 = batch_norm(channels, BATCH_NORM_EPS, vb.pp("norm5"))?;

        Ok(Self {
            conv0,
            norm0,
            blocks,
            transitions,
            norm5,
        })
    }
}

impl Module for Features {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = xs
            .apply(&self.conv0)?
            .apply_t(&self.norm0, false)?
            .relu()?
            // 3x3/2 max pool with padding 1; inputs are non-negative after relu so zero padding is exact
            .pad_with_zeros(2, 1, 1)?
            .pad_with_zeros(3, 1, 1)?
            .max_pool2d_with_stride(3, 2)?;

        for (i, block) in self.blocks.iter().enumerate() {
            for layer in block {
                xs = xs.apply(layer)?;
            }
            if let Some(transition) = self.transitions.get(i) {
                xs = xs.apply(transition)?;
            }
        }

        xs.apply_t(&self.norm5, false)
    }
}

/// DenseNet whose classifier is `Linear` followed by an elementwise sigmoid
#[derive(Debug, Clone)]
pub struct DenseNet {
    features: Features,
    classifier: Linear,
    config: DenseNetConfig,
}

impl DenseNet {
    /// Create the network, registering parameters through `vb`
    pub fn new(config: &DenseNetConfig, vb: VarBuilder) -> Result<Self> {
        let features = Features::new(config, vb.pp("features"))?;
        let classifier = linear(
            config.num_features(),
            config.num_classes,
            vb.pp("classifier").pp("0"),
        )?;

        Ok(Self {
            features,
            classifier,
            config: config.clone(),
        })
    }

    /// Network hyperparameters
    pub fn config(&self) -> &DenseNetConfig {
        &self.config
    }
}

impl Module for DenseNet {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let pooled = xs.apply(&self.features)?.relu()?.mean((2, 3))?;
        candle_nn::ops::sigmoid(&pooled.apply(&self.classifier)?)
    }
}
