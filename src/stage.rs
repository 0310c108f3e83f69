use std::fmt;

use serde::{Deserialize, Serialize};

/// Training regime selected for a run.
///
/// `warm_up` and `stage1` are matched by name; any other value selects
/// distillation (`stage2`, `stage3`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Stage {
    WarmUp,
    Stage1,
    Distillation,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::WarmUp => "warm_up",
            Stage::Stage1 => "stage1",
            Stage::Distillation => "distillation",
        }
    }
}

impl From<&str> for Stage {
    fn from(s: &str) -> Self {
        match s {
            "warm_up" => Stage::WarmUp,
            "stage1" => Stage::Stage1,
            _ => Stage::Distillation,
        }
    }
}

impl From<String> for Stage {
    fn from(s: String) -> Self {
        Stage::from(s.as_str())
    }
}

impl From<Stage> for String {
    fn from(stage: Stage) -> Self {
        stage.name().to_string()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Losses returned by the adversarial warm-up step.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WarmUpLosses {
    /// Segmentation loss on labelled source images.
    pub loss_gta: f32,
    /// Adversarial loss pushing target predictions toward the source domain.
    pub loss_g: f32,
    /// Discriminator loss.
    pub loss_d: f32,
}

/// Losses returned by the prototype self-training step.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SelfTrainingLosses {
    pub loss: f32,
    /// Cross-entropy on target strong views against rectified pseudo-labels.
    pub loss_cts: f32,
    /// Weak/strong prediction consistency.
    pub loss_consist: f32,
}

/// Losses returned by the distillation step.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DistillationLosses {
    pub loss_gta: f32,
    pub loss: f32,
}

/// Per-iteration losses, tagged by the stage that produced them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StageLosses {
    WarmUp(WarmUpLosses),
    Stage1(SelfTrainingLosses),
    Distillation(DistillationLosses),
}

impl StageLosses {
    /// Loss columns of the progress line, e.g. `loss_GTA: 0.1234  loss: 0.5678`.
    pub fn summary(&self) -> String {
        match self {
            StageLosses::WarmUp(l) => format!(
                "loss_GTA: {:.4}  loss_G: {:.4}  loss_D: {:.4}",
                l.loss_gta, l.loss_g, l.loss_d
            ),
            StageLosses::Stage1(l) => format!(
                "loss: {:.4}  loss_CTS: {:.4}  loss_consist: {:.4}",
                l.loss, l.loss_cts, l.loss_consist
            ),
            StageLosses::Distillation(l) => {
                format!("loss_GTA: {:.4}  loss: {:.4}", l.loss_gta, l.loss)
            }
        }
    }
}
