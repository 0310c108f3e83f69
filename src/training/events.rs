use std::path::PathBuf;

use crate::checkpoint::CheckpointKind;
use crate::stage::StageLosses;

/// Progress updates sent from the training loop to an observer.
#[derive(Debug, Clone)]
pub enum TrainingUpdate {
    Losses {
        epoch: usize,
        iter: usize,
        losses: StageLosses,
        infer_time_per_image: f64,
        load_time_per_image: f64,
    },
    Validation {
        iter: usize,
        mean_iou: f64,
        best_iou: Option<f64>,
    },
    CheckpointSaved {
        iter: usize,
        kind: CheckpointKind,
        path: PathBuf,
    },
    Finished {
        iter: usize,
        best_iou: Option<f64>,
    },
}
