use std::sync::mpsc::Sender;
use std::time::Instant;

use burn::tensor::backend::Backend;

use crate::checkpoint::{CheckpointKind, CheckpointManager, CheckpointManagerConfig};
use crate::config::TrainOptions;
use crate::data::{Datasets, SourceBatch, TargetBatch};
use crate::error::{CheckpointError, TrainingError};
use crate::model::{AdaptationModel, AdversarialInputs, DistillationInputs, SelfTrainingInputs};
use crate::prototypes::load_objective_vectors;
use crate::stage::{Stage, StageLosses};
use crate::training::events::TrainingUpdate;
use crate::training::metrics::AverageMeter;
use crate::training::session::TrainingSession;
use crate::training::validation::validation;

/// Runs the stage selected in [`TrainOptions`] over the target loader.
pub struct Trainer {
    options: TrainOptions,
    checkpoints: CheckpointManager,
    updates: Option<Sender<TrainingUpdate>>,
}

impl Trainer {
    pub fn new(options: TrainOptions) -> Self {
        let checkpoints = CheckpointManager::new(CheckpointManagerConfig::from(&options));
        Trainer {
            options,
            checkpoints,
            updates: None,
        }
    }

    /// Also send progress to `tx`. A dropped receiver is ignored.
    pub fn with_updates(mut self, tx: Sender<TrainingUpdate>) -> Self {
        self.updates = Some(tx);
        self
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    fn send(&self, update: TrainingUpdate) {
        if let Some(tx) = &self.updates {
            let _ = tx.send(update);
        }
    }

    /// Run `epochs` passes over the target loader.
    ///
    /// Every iteration pairs the next target batch with the next source
    /// batch; the source loader cycles on its own. Progress lines are emitted
    /// every `print_interval` completed iterations and validation runs every
    /// `val_interval`.
    pub fn train<B: Backend, M: AdaptationModel<B> + ?Sized>(
        &self,
        model: &mut M,
        datasets: &mut Datasets<B>,
        session: &mut TrainingSession,
    ) -> Result<(), TrainingError> {
        let opt = &self.options;

        if let Some(prototypes) = load_objective_vectors(opt)? {
            model.set_objective_vectors(prototypes)?;
        }

        let n_batches = datasets.target_train.num_batches();
        if n_batches == 0 {
            return Err(TrainingError::EmptyTargetLoader);
        }
        std::fs::create_dir_all(&opt.logdir).map_err(CheckpointError::from)?;

        log::info!(
            "Starting {} for {} epochs ({} target batches per epoch)",
            opt.stage,
            opt.epochs,
            n_batches
        );

        let mut infer_time = AverageMeter::new();
        let mut load_time = AverageMeter::new();
        let bs = opt.bs.max(1) as f64;

        for epoch in 0..opt.epochs {
            session.epoch = epoch;
            datasets.target_train.start_epoch();

            for index in 0..n_batches {
                let load_start = Instant::now();
                let target = TargetBatch::try_from(datasets.target_train.load_batch(index)?)?;
                let source = SourceBatch::try_from(datasets.source_train.next_batch()?)?;

                let step_start = Instant::now();
                model.enter_train_mode();
                if opt.freeze_bn {
                    model.freeze_norm_stats();
                }
                model.zero_grad();
                let losses = self.step(model, source, target)?;

                session.advance();
                infer_time.update(step_start.elapsed().as_secs_f64(), 1);
                load_time.update((step_start - load_start).as_secs_f64(), 1);

                if session.at_interval(opt.print_interval) {
                    let line = format!(
                        "Epochs [{}/{}] Iter [{}/{}]  {} infertime/Image: {:.4} imgloadtime/Image: {:.4}",
                        epoch + 1,
                        opt.epochs,
                        session.iter,
                        opt.train_iters,
                        losses.summary(),
                        infer_time.avg / bs,
                        load_time.avg / bs
                    );
                    println!("{line}");
                    log::info!("{line}");
                    self.send(TrainingUpdate::Losses {
                        epoch,
                        iter: session.iter,
                        losses,
                        infer_time_per_image: infer_time.avg / bs,
                        load_time_per_image: load_time.avg / bs,
                    });
                    infer_time.reset();
                    load_time.reset();
                }

                if session.at_interval(opt.val_interval) {
                    let report = validation(
                        model,
                        datasets.target_valid.as_mut(),
                        session,
                        &self.checkpoints,
                        opt.n_class,
                    )?;
                    model.release_device_memory();
                    log::info!("Best iou until now is {:?}", session.best_iou);

                    self.send(TrainingUpdate::Validation {
                        iter: session.iter,
                        mean_iou: report.scores.mean_iou,
                        best_iou: session.best_iou,
                    });
                    self.send(TrainingUpdate::CheckpointSaved {
                        iter: session.iter,
                        kind: CheckpointKind::Current,
                        path: report.current,
                    });
                    if let Some(path) = report.best {
                        log::info!("New best checkpoint at iter {}", session.iter);
                        self.send(TrainingUpdate::CheckpointSaved {
                            iter: session.iter,
                            kind: CheckpointKind::Best,
                            path,
                        });
                    }
                }

                model.scheduler_step();
            }
        }

        log::info!(
            "Training complete after {} iterations, best iou {:?}",
            session.iter,
            session.best_iou
        );
        self.send(TrainingUpdate::Finished {
            iter: session.iter,
            best_iou: session.best_iou,
        });
        Ok(())
    }

    fn step<B: Backend, M: AdaptationModel<B> + ?Sized>(
        &self,
        model: &mut M,
        source: SourceBatch<B>,
        target: TargetBatch<B>,
    ) -> Result<StageLosses, TrainingError> {
        let losses = match self.options.stage {
            Stage::WarmUp => StageLosses::WarmUp(model.step_adv(AdversarialInputs {
                images: source.img,
                labels: source.label,
                target_image: target.img,
                source_image_strong: source.img_strong,
                source_params: source.params,
            })?),
            Stage::Stage1 => StageLosses::Stage1(model.step_self_training(SelfTrainingInputs {
                images: source.img,
                labels: source.label,
                target_image: target.img,
                target_image_strong: target.img_strong,
                target_params: target.params,
                target_lp: target.lp,
                target_lpsoft: target.lpsoft,
                target_image_full: target.img_full,
                target_weak_params: target.weak_params,
            })?),
            Stage::Distillation => {
                StageLosses::Distillation(model.step_distillation(DistillationInputs {
                    images: source.img,
                    labels: source.label,
                    target_image: target.img,
                    target_image_strong: target.img_strong,
                    target_params: target.params,
                    target_lp: target.lp,
                })?)
            }
        };
        Ok(losses)
    }
}
