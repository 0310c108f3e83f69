//! The adaptation model seam and its burn implementation.
//!
//! - [`AdaptationModel`] — what the training loop needs from a model
//! - [`SegAdaptModel`] — segmentation network + discriminator with Adam
//! - [`networks`] — `SegNet` and `Discriminator` modules
//! - [`loss`] — masked cross-entropy, BCE, soft cross-entropy
//! - [`scheduler`] — learning-rate schedules

mod adapt;
pub mod loss;
pub mod networks;
pub mod scheduler;

use std::path::Path;

use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};

use crate::data::AugParams;
use crate::error::ModelError;
use crate::prototypes::Prototypes;
use crate::stage::{DistillationLosses, SelfTrainingLosses, WarmUpLosses};

pub use adapt::SegAdaptModel;

/// Inputs of the adversarial warm-up step.
#[derive(Debug, Clone)]
pub struct AdversarialInputs<B: Backend> {
    pub images: Tensor<B, 4>,
    pub labels: Tensor<B, 3, Int>,
    pub target_image: Tensor<B, 4>,
    pub source_image_strong: Tensor<B, 4>,
    pub source_params: Vec<AugParams>,
}

/// Inputs of the prototype self-training step.
#[derive(Debug, Clone)]
pub struct SelfTrainingInputs<B: Backend> {
    pub images: Tensor<B, 4>,
    pub labels: Tensor<B, 3, Int>,
    pub target_image: Tensor<B, 4>,
    pub target_image_strong: Tensor<B, 4>,
    pub target_params: Vec<AugParams>,
    pub target_lp: Option<Tensor<B, 3, Int>>,
    pub target_lpsoft: Option<Tensor<B, 4>>,
    pub target_image_full: Tensor<B, 4>,
    pub target_weak_params: Vec<AugParams>,
}

/// Inputs of the distillation step.
#[derive(Debug, Clone)]
pub struct DistillationInputs<B: Backend> {
    pub images: Tensor<B, 4>,
    pub labels: Tensor<B, 3, Int>,
    pub target_image: Tensor<B, 4>,
    pub target_image_strong: Tensor<B, 4>,
    pub target_params: Vec<AugParams>,
    pub target_lp: Option<Tensor<B, 3, Int>>,
}

/// Interface the training loop drives.
///
/// A model owns one or more named networks, each with its own optimizer and
/// learning-rate schedule.
pub trait AdaptationModel<B: Backend> {
    fn enter_train_mode(&mut self);

    fn enter_eval_mode(&mut self);

    /// Drop cached device buffers (e.g. inference copies of the networks).
    fn release_device_memory(&mut self) {}

    /// Stop normalisation layers from updating their running statistics.
    fn freeze_norm_stats(&mut self);

    /// Clear accumulated gradients. Models that compute fresh gradients on
    /// every step keep the default.
    fn zero_grad(&mut self) {}

    fn step_adv(&mut self, inputs: AdversarialInputs<B>) -> Result<WarmUpLosses, ModelError>;

    fn step_self_training(
        &mut self,
        inputs: SelfTrainingInputs<B>,
    ) -> Result<SelfTrainingLosses, ModelError>;

    fn step_distillation(
        &mut self,
        inputs: DistillationInputs<B>,
    ) -> Result<DistillationLosses, ModelError>;

    /// Advance every network's learning-rate schedule by one iteration.
    fn scheduler_step(&mut self);

    /// Base-network logits `[batch, n_class, h, w]`, without gradient tracking.
    /// The output may be at a lower resolution than `images`.
    fn infer(&mut self, images: Tensor<B, 4>) -> Tensor<B, 4>;

    /// Current learning rate of each network, keyed by network name.
    fn learning_rates(&self) -> Vec<(String, f64)>;

    fn set_objective_vectors(&mut self, prototypes: Prototypes) -> Result<(), ModelError>;

    fn objective_vectors(&self) -> Option<&Prototypes>;

    /// Write every network's parameters into `dir`, plus optimizer and
    /// scheduler state when `include_training_state` is set. Returns the
    /// names of the networks written.
    fn save_networks(
        &self,
        dir: &Path,
        include_training_state: bool,
    ) -> Result<Vec<String>, ModelError>;
}
