use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d, Relu};
use burn::prelude::*;
use burn::tensor::activation::leaky_relu;
use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};

/// Bilinear resize of `[batch, channels, h, w]` to `size` (`[height, width]`).
pub fn upsample_bilinear<B: Backend>(x: Tensor<B, 4>, size: [usize; 2]) -> Tensor<B, 4> {
    let [_, _, h, w] = x.dims();
    if [h, w] == size {
        return x;
    }
    interpolate(x, size, InterpolateOptions::new(InterpolateMode::Bilinear))
}

/// Features and logits of one forward pass.
#[derive(Debug, Clone)]
pub struct SegOutput<B: Backend> {
    /// `[batch, feat_dim, h/4, w/4]`
    pub feat: Tensor<B, 4>,
    /// `[batch, n_class, h/4, w/4]`
    pub out: Tensor<B, 4>,
}

/// Segmentation network.
///
/// ```text
/// Input:  [batch, 3, H, W]
/// Conv1:  3 -> 32, 3x3 stride 2, BN, ReLU       =>  [batch, 32, H/2, W/2]
/// Conv2:  32 -> 64, 3x3 stride 2, BN, ReLU      =>  [batch, 64, H/4, W/4]
/// Conv3:  64 -> feat_dim, 3x3, BN, ReLU         =>  feat
/// Classifier: feat_dim -> n_class, 1x1          =>  out
/// ```
#[derive(Module, Debug)]
pub struct SegNet<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    conv3: Conv2d<B>,
    bn3: BatchNorm<B, 2>,
    classifier: Conv2d<B>,
    relu: Relu,
}

#[derive(Config, Debug)]
pub struct SegNetConfig {
    pub n_class: usize,
    #[config(default = 128)]
    pub feat_dim: usize,
}

fn conv3x3(channels: [usize; 2], stride: usize) -> Conv2dConfig {
    Conv2dConfig::new(channels, [3, 3])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
}

impl SegNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> SegNet<B> {
        SegNet {
            conv1: conv3x3([3, 32], 2).init(device),
            bn1: BatchNormConfig::new(32).init(device),
            conv2: conv3x3([32, 64], 2).init(device),
            bn2: BatchNormConfig::new(64).init(device),
            conv3: conv3x3([64, self.feat_dim], 1).init(device),
            bn3: BatchNormConfig::new(self.feat_dim).init(device),
            classifier: Conv2dConfig::new([self.feat_dim, self.n_class], [1, 1]).init(device),
            relu: Relu::new(),
        }
    }
}

impl<B: Backend> SegNet<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> SegOutput<B> {
        let x = self.relu.forward(self.bn1.forward(self.conv1.forward(input)));
        let x = self.relu.forward(self.bn2.forward(self.conv2.forward(x)));
        let feat = self.relu.forward(self.bn3.forward(self.conv3.forward(x)));
        let out = self.classifier.forward(feat.clone());
        SegOutput { feat, out }
    }

    /// Zero momentum: batch statistics no longer move the running estimates.
    pub fn freeze_norm(mut self) -> Self {
        self.bn1.momentum = 0.0;
        self.bn2.momentum = 0.0;
        self.bn3.momentum = 0.0;
        self
    }

    pub fn n_class(&self) -> usize {
        let [n_class, _, _, _] = self.classifier.weight.val().dims();
        n_class
    }

    pub fn norm_frozen(&self) -> bool {
        self.bn1.momentum == 0.0 && self.bn2.momentum == 0.0 && self.bn3.momentum == 0.0
    }
}

/// Fully-convolutional domain discriminator over class probability maps.
///
/// ```text
/// Input:  [batch, n_class, h, w]
/// Conv1:  n_class -> 64, 4x4 stride 2, LeakyReLU(0.2)
/// Conv2:  64 -> 128, 4x4 stride 2, LeakyReLU(0.2)
/// Conv3:  128 -> 1, 3x3                          => domain logits
/// ```
#[derive(Module, Debug)]
pub struct Discriminator<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    conv3: Conv2d<B>,
}

#[derive(Config, Debug)]
pub struct DiscriminatorConfig {
    pub n_class: usize,
}

impl DiscriminatorConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Discriminator<B> {
        let down = |c: [usize; 2]| {
            Conv2dConfig::new(c, [4, 4])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
        };
        Discriminator {
            conv1: down([self.n_class, 64]).init(device),
            conv2: down([64, 128]).init(device),
            conv3: conv3x3([128, 1], 1).init(device),
        }
    }
}

impl<B: Backend> Discriminator<B> {
    pub fn forward(&self, probs: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = leaky_relu(self.conv1.forward(probs), 0.2);
        let x = leaky_relu(self.conv2.forward(x), 0.2);
        self.conv3.forward(x)
    }
}
