use serde::{Deserialize, Serialize};

use crate::stage::Stage;

/// The two checkpoint records a run keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    /// Rewritten at every validation, parameters only.
    Current,
    /// Rewritten when the mean IoU ties or beats the best so far, with
    /// optimizer and scheduler state.
    Best,
}

impl CheckpointKind {
    pub fn suffix(&self) -> &'static str {
        match self {
            CheckpointKind::Current => "current_model",
            CheckpointKind::Best => "best_model",
        }
    }

    pub fn includes_training_state(&self) -> bool {
        matches!(self, CheckpointKind::Best)
    }
}

/// Top-level checkpoint metadata written to metadata.json.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub kind: CheckpointKind,
    pub stage: Stage,
    /// Completed training iterations when the record was written.
    pub iter: usize,
    /// Mean IoU stored with the record; `None` when the score was not finite.
    pub best_iou: Option<f64>,
    /// Networks saved in the record, by name.
    pub networks: Vec<String>,
    #[serde(default)]
    pub has_objective_vectors: bool,
    pub timestamp: u64,
}
