use std::collections::BTreeMap;
use std::path::PathBuf;

use burn::tensor::backend::Backend;

use crate::checkpoint::{CheckpointKind, CheckpointManager};
use crate::data::{BatchLoader, ValidBatch};
use crate::error::TrainingError;
use crate::model::networks::upsample_bilinear;
use crate::model::AdaptationModel;
use crate::training::metrics::{RunningScore, Scores};
use crate::training::session::TrainingSession;

/// Result of one validation pass.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub scores: Scores,
    pub class_iou: BTreeMap<usize, f64>,
    pub current: PathBuf,
    /// Set when the pass tied or beat the best score and a best record was written.
    pub best: Option<PathBuf>,
}

/// Score the model on the validation loader and write checkpoints.
///
/// The "current" record is always rewritten. When the mean IoU ties or beats
/// `session.best_iou`, the session is updated and the "best" record, with
/// optimizer and scheduler state, is rewritten too.
pub fn validation<B: Backend, M: AdaptationModel<B> + ?Sized>(
    model: &mut M,
    loader: &mut dyn BatchLoader<B>,
    session: &mut TrainingSession,
    checkpoints: &CheckpointManager,
    n_class: usize,
) -> Result<ValidationReport, TrainingError> {
    for (name, lr) in model.learning_rates() {
        log::info!("learning rate is {lr} for {name} net");
    }

    model.enter_eval_mode();
    let mut running = RunningScore::new(n_class);
    validate(loader, model, &mut running)?;

    let (scores, class_iou) = running.get_scores();
    for (name, value) in scores.entries() {
        println!("{name} {value}");
        log::info!("{name}: {value}");
    }
    for (class, iou) in &class_iou {
        log::info!("{class}: {iou}");
    }

    let mean_iou = scores.mean_iou;
    let current = checkpoints.save(&*model, CheckpointKind::Current, session.iter, mean_iou)?;

    let best = if session.offer_best(mean_iou) {
        Some(checkpoints.save(&*model, CheckpointKind::Best, session.iter, mean_iou)?)
    } else {
        None
    };

    Ok(ValidationReport {
        scores,
        class_iou,
        current,
        best,
    })
}

/// Accumulate (ground truth, prediction) pairs for every validation batch.
///
/// Logits are resized to the input resolution before the per-pixel arg-max.
/// The model's `infer` runs without gradient tracking.
pub fn validate<B: Backend, M: AdaptationModel<B> + ?Sized>(
    loader: &mut dyn BatchLoader<B>,
    model: &mut M,
    running: &mut RunningScore,
) -> Result<(), TrainingError> {
    for index in 0..loader.num_batches() {
        let batch = ValidBatch::try_from(loader.load_batch(index)?)?;
        let [_, _, h, w] = batch.img.dims();

        let logits = upsample_bilinear(model.infer(batch.img), [h, w]);
        let pred: Vec<i64> = logits.argmax(1).into_data().iter::<i64>().collect();
        let gt: Vec<i64> = batch.label.into_data().iter::<i64>().collect();
        running.update(&gt, &pred);
    }
    Ok(())
}
