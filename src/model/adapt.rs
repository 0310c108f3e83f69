use std::path::Path;

use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{Adam, AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::record::{DefaultRecorder, Recorder};
use burn::tensor::activation::softmax;
use burn::tensor::backend::AutodiffBackend;

use super::loss::{bce_with_logits, cross_entropy_2d, soft_cross_entropy};
use super::networks::{
    upsample_bilinear, Discriminator, DiscriminatorConfig, SegNet, SegNetConfig,
};
use super::scheduler::LrScheduler;
use super::{AdaptationModel, AdversarialInputs, DistillationInputs, SelfTrainingInputs};
use crate::config::{AppConfig, OptimConfig};
use crate::data::{AugParams, BatchLoader, TargetBatch, IGNORE_INDEX};
use crate::error::{DataError, ModelError};
use crate::prototypes::{PrototypeAccumulator, Prototypes};
use crate::stage::{DistillationLosses, SelfTrainingLosses, Stage, WarmUpLosses};

pub const SEG_NET: &str = "SegNet";
pub const DISCRIMINATOR: &str = "Discriminator";

/// Parameters, optimizer and schedule of one network.
struct NetState<B: AutodiffBackend, M: AutodiffModule<B>> {
    name: &'static str,
    module: M,
    optim: OptimizerAdaptor<Adam, M, B>,
    scheduler: LrScheduler,
    device: B::Device,
}

impl<B: AutodiffBackend, M: AutodiffModule<B>> NetState<B, M> {
    fn new(name: &'static str, module: M, scheduler: LrScheduler, device: &B::Device) -> Self {
        NetState {
            name,
            module,
            optim: AdamConfig::new().with_beta_2(0.99).init(),
            scheduler,
            device: device.clone(),
        }
    }

    /// Backward `loss` and apply the gradients that belong to this network.
    fn update(&mut self, loss: Tensor<B, 1>) {
        let grads = loss.backward();
        let grads = GradientsParams::from_grads(grads, &self.module);
        self.module = self
            .optim
            .step(self.scheduler.lr(), self.module.clone(), grads);
    }

    fn save_err(&self, e: impl std::fmt::Display) -> ModelError {
        ModelError::Save {
            name: self.name.to_string(),
            reason: e.to_string(),
        }
    }

    fn load_err(&self, e: impl std::fmt::Display) -> ModelError {
        ModelError::Load {
            name: self.name.to_string(),
            reason: e.to_string(),
        }
    }
}

/// Object-safe view of a [`NetState`], so networks of different types can
/// be iterated by name.
trait ManagedNetwork {
    fn name(&self) -> &'static str;
    fn lr(&self) -> f64;
    fn scheduler_step(&mut self);
    fn save(&self, dir: &Path, include_training_state: bool) -> Result<(), ModelError>;
    fn load(&mut self, dir: &Path) -> Result<(), ModelError>;
}

impl<B: AutodiffBackend, M: AutodiffModule<B>> ManagedNetwork for NetState<B, M> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn lr(&self) -> f64 {
        self.scheduler.lr()
    }

    fn scheduler_step(&mut self) {
        self.scheduler.step();
    }

    fn save(&self, dir: &Path, include_training_state: bool) -> Result<(), ModelError> {
        let recorder = DefaultRecorder::default();
        self.module
            .clone()
            .save_file(dir.join(self.name), &recorder)
            .map_err(|e| self.save_err(e))?;
        if include_training_state {
            Recorder::<B>::record(
                &recorder,
                self.optim.to_record(),
                dir.join(format!("{}_optim", self.name)),
            )
            .map_err(|e| self.save_err(e))?;
            self.scheduler
                .save(&dir.join(format!("{}_scheduler.json", self.name)))?;
        }
        Ok(())
    }

    /// Parameters are required; optimizer and scheduler state are restored
    /// when the checkpoint carries them.
    fn load(&mut self, dir: &Path) -> Result<(), ModelError> {
        let recorder = DefaultRecorder::default();
        self.module = self
            .module
            .clone()
            .load_file(dir.join(self.name), &recorder, &self.device)
            .map_err(|e| self.load_err(e))?;

        if dir.join(format!("{}_optim.mpk", self.name)).exists() {
            let record = Recorder::<B>::load(
                &recorder,
                dir.join(format!("{}_optim", self.name)),
                &self.device,
            )
            .map_err(|e| self.load_err(e))?;
            self.optim = self.optim.clone().load_record(record);
        }
        let sched = dir.join(format!("{}_scheduler.json", self.name));
        if sched.exists() {
            self.scheduler = LrScheduler::load(&sched)?;
        }
        Ok(())
    }
}

fn scalar<B: Backend>(loss: &Tensor<B, 1>) -> f32 {
    loss.clone().into_scalar().elem::<f32>()
}

/// Undo or apply per-sample horizontal flips so that a map predicted on the
/// unflipped image lines up with the augmented view.
pub fn align_to_view<B: Backend>(x: Tensor<B, 4>, params: &[AugParams]) -> Tensor<B, 4> {
    if !params.iter().any(|p| p.flipped) {
        return x;
    }
    let parts = params
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let sample = x.clone().narrow(0, i, 1);
            if p.flipped {
                sample.flip([3])
            } else {
                sample
            }
        })
        .collect();
    Tensor::cat(parts, 0)
}

/// Prototype-rectified hard pseudo-labels.
///
/// `probs` (`[batch, n_class, h', w']`) is reweighted per pixel by
/// `softmax(-||feat - proto_c|| / temperature)` over classes, resized to
/// `size` and arg-maxed. `feat` is `[batch, feat_dim, h', w']`, `protos`
/// is `[n_class, feat_dim]`.
pub fn rectify_pseudo_labels<B: Backend>(
    probs: Tensor<B, 4>,
    feat: Tensor<B, 4>,
    protos: Tensor<B, 2>,
    temperature: f32,
    size: [usize; 2],
) -> Tensor<B, 3, Int> {
    let [batch, dim, h, w] = feat.dims();
    let [n_class, _] = protos.dims();

    let flat = feat.permute([0, 2, 3, 1]).reshape([batch * h * w, dim]);
    let f2 = flat.clone().powf_scalar(2.0).sum_dim(1);
    let p2 = protos.clone().powf_scalar(2.0).sum_dim(1).transpose();
    let cross = flat.matmul(protos.transpose());
    let dist = (f2 + p2 - cross.mul_scalar(2.0)).clamp_min(0.0).sqrt();

    let weights = softmax(dist.div_scalar(-temperature), 1)
        .reshape([batch, h, w, n_class])
        .permute([0, 3, 1, 2]);
    let rectified = upsample_bilinear(upsample_bilinear(probs, [h, w]) * weights, size);
    rectified.argmax(1).squeeze(1)
}

/// Segmentation network plus (warm-up only) a domain discriminator, each
/// trained with Adam under its own learning-rate schedule.
pub struct SegAdaptModel<B: AutodiffBackend> {
    stage: Stage,
    optim: OptimConfig,
    seg: NetState<B, SegNet<B>>,
    disc: Option<NetState<B, Discriminator<B>>>,
    /// Frozen copy of the base network that distillation learns from.
    teacher: Option<SegNet<B::InnerBackend>>,
    eval_net: Option<SegNet<B::InnerBackend>>,
    objective_vectors: Option<Prototypes>,
    proto_tensor: Option<Tensor<B::InnerBackend, 2>>,
    feat_dim: usize,
    training: bool,
}

impl<B: AutodiffBackend> SegAdaptModel<B> {
    pub fn new(config: &AppConfig, device: &B::Device) -> Self {
        let train = &config.train;
        let optim = config.optim.clone();
        let scheduler = |lr| LrScheduler::new(optim.scheduler, lr, optim.poly_power, train.train_iters);

        let seg_net = SegNetConfig::new(train.n_class)
            .with_feat_dim(optim.feat_dim)
            .init(device);
        let seg = NetState::new(SEG_NET, seg_net, scheduler(optim.lr), device);

        let disc = (train.stage == Stage::WarmUp).then(|| {
            let net = DiscriminatorConfig::new(train.n_class).init(device);
            NetState::new(DISCRIMINATOR, net, scheduler(optim.lr_d), device)
        });

        log::info!(
            "Built {} for stage {} ({} classes, {} feature channels)",
            if disc.is_some() { "SegNet + Discriminator" } else { "SegNet" },
            train.stage,
            train.n_class,
            optim.feat_dim
        );

        SegAdaptModel {
            stage: train.stage,
            feat_dim: optim.feat_dim,
            optim,
            seg,
            disc,
            teacher: None,
            eval_net: None,
            objective_vectors: None,
            proto_tensor: None,
            training: true,
        }
    }

    fn networks(&self) -> Vec<&dyn ManagedNetwork> {
        let mut nets: Vec<&dyn ManagedNetwork> = vec![&self.seg];
        if let Some(d) = &self.disc {
            nets.push(d);
        }
        nets.sort_by_key(|n| n.name());
        nets
    }

    fn networks_mut(&mut self) -> Vec<&mut dyn ManagedNetwork> {
        let mut nets: Vec<&mut dyn ManagedNetwork> = vec![&mut self.seg];
        if let Some(d) = &mut self.disc {
            nets.push(d);
        }
        nets.sort_by_key(|n| n.name());
        nets
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn seg_net(&self) -> &SegNet<B> {
        &self.seg.module
    }

    /// Restore every network from a checkpoint directory. Networks missing
    /// from the checkpoint are an error. Distillation snapshots the restored
    /// base network as its teacher.
    pub fn resume(&mut self, dir: &Path) -> Result<(), ModelError> {
        for net in self.networks_mut() {
            net.load(dir)?;
            log::info!("Restored {} from {}", net.name(), dir.display());
        }
        self.eval_net = None;
        if self.stage == Stage::Distillation {
            self.teacher = Some(self.seg.module.valid());
        }
        Ok(())
    }

    /// Base-network features and logits on the inner backend.
    pub fn infer_features(&self, images: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let net = match &self.eval_net {
            Some(net) => net.clone(),
            None => self.seg.module.valid(),
        };
        let out = net.forward(images.inner());
        (Tensor::from_inner(out.feat), Tensor::from_inner(out.out))
    }

    /// Class-mean features over a target loader. Pixels are labelled by the
    /// batch's hard pseudo-labels when present, else by the network's own
    /// arg-max prediction.
    pub fn compute_prototypes(
        &mut self,
        loader: &mut dyn BatchLoader<B>,
    ) -> Result<Prototypes, DataError> {
        self.enter_eval_mode();
        let n_class = self.seg.module.n_class();
        let mut acc = PrototypeAccumulator::new(n_class, self.feat_dim);
        loader.start_epoch();
        for index in 0..loader.num_batches() {
            let batch = TargetBatch::try_from(loader.load_batch(index)?)?;
            let (feat, logits) = self.infer_features(batch.img);
            match batch.lp {
                Some(lp) => {
                    let [_, h, w] = lp.dims();
                    acc.update(upsample_bilinear(feat, [h, w]), lp);
                }
                None => acc.update(feat, logits.argmax(1).squeeze(1)),
            }
        }
        self.release_device_memory();
        Ok(acc.finish())
    }

    fn teacher_net(&mut self) -> SegNet<B::InnerBackend> {
        match &self.teacher {
            Some(t) => t.clone(),
            None => {
                let t = self.seg.module.valid();
                self.teacher = Some(t.clone());
                t
            }
        }
    }
}

impl<B: AutodiffBackend> AdaptationModel<B> for SegAdaptModel<B> {
    fn enter_train_mode(&mut self) {
        self.training = true;
        self.eval_net = None;
    }

    fn enter_eval_mode(&mut self) {
        self.training = false;
        self.eval_net = Some(self.seg.module.valid());
    }

    fn release_device_memory(&mut self) {
        self.eval_net = None;
    }

    fn freeze_norm_stats(&mut self) {
        if !self.seg.module.norm_frozen() {
            self.seg.module = self.seg.module.clone().freeze_norm();
            log::debug!("Froze batch-norm running statistics");
        }
    }

    fn step_adv(&mut self, inputs: AdversarialInputs<B>) -> Result<WarmUpLosses, ModelError> {
        let AdversarialInputs {
            images,
            labels,
            target_image,
            source_image_strong,
            source_params,
        } = inputs;

        let src = self.seg.module.forward(images);
        let loss_gta = cross_entropy_2d(src.out.clone(), labels.clone());
        let mut seg_loss = loss_gta.clone();
        if !source_params.iter().all(AugParams::is_photometric_identity) {
            let strong = self.seg.module.forward(source_image_strong);
            seg_loss = seg_loss + cross_entropy_2d(strong.out, labels);
        }

        let tgt = self.seg.module.forward(target_image);
        let src_prob = softmax(src.out.detach(), 1);
        let tgt_prob = softmax(tgt.out.clone().detach(), 1);

        let loss_g = match &self.disc {
            Some(disc) => {
                let d_out = disc.module.forward(softmax(tgt.out, 1));
                bce_with_logits(d_out, 1.0).mul_scalar(self.optim.adv_weight)
            }
            None => Tensor::zeros([1], &src_prob.device()),
        };
        let loss_gta_val = scalar(&loss_gta);
        let loss_g_val = scalar(&loss_g);
        self.seg.update(seg_loss + loss_g);

        let loss_d_val = match &mut self.disc {
            Some(disc) => {
                let d_src = disc.module.forward(src_prob);
                let d_tgt = disc.module.forward(tgt_prob);
                let loss_d = (bce_with_logits(d_src, 1.0) + bce_with_logits(d_tgt, 0.0)).div_scalar(2.0);
                let v = scalar(&loss_d);
                disc.update(loss_d);
                v
            }
            None => 0.0,
        };
        self.eval_net = None;

        Ok(WarmUpLosses {
            loss_gta: loss_gta_val,
            loss_g: loss_g_val,
            loss_d: loss_d_val,
        })
    }

    fn step_self_training(
        &mut self,
        inputs: SelfTrainingInputs<B>,
    ) -> Result<SelfTrainingLosses, ModelError> {
        let protos = self
            .proto_tensor
            .clone()
            .ok_or(ModelError::MissingObjectiveVectors)?;
        let SelfTrainingInputs {
            images,
            labels,
            target_image,
            target_image_strong,
            target_lp,
            target_lpsoft,
            target_image_full,
            target_weak_params,
            ..
        } = inputs;
        let [_, _, h, w] = target_image.dims();

        // Pseudo-labels come from the inference copy and carry no gradient.
        let frozen = self.seg.module.valid();
        let weak = frozen.forward(target_image.inner());
        let probs = match target_lpsoft {
            Some(soft) => soft.inner(),
            None => {
                let full = frozen.forward(target_image_full.inner());
                let probs = softmax(upsample_bilinear(full.out, [h, w]), 1);
                align_to_view(probs, &target_weak_params)
            }
        };
        let mut pseudo = rectify_pseudo_labels(
            probs,
            weak.feat,
            protos,
            self.optim.proto_temperature,
            [h, w],
        );
        if let Some(lp) = target_lp {
            let disagree = lp.inner().not_equal(pseudo.clone());
            pseudo = pseudo.mask_fill(disagree, IGNORE_INDEX);
        }
        let pseudo = Tensor::<B, 3, Int>::from_inner(pseudo);
        let weak_target = Tensor::<B, 4>::from_inner(softmax(weak.out, 1));

        let loss_src = cross_entropy_2d(self.seg.module.forward(images).out, labels);
        let strong = self.seg.module.forward(target_image_strong);
        let loss_cts = cross_entropy_2d(strong.out.clone(), pseudo);
        let loss_consist =
            soft_cross_entropy(strong.out, weak_target).mul_scalar(self.optim.consist_weight);
        let loss = loss_src + loss_cts.clone() + loss_consist.clone();

        let losses = SelfTrainingLosses {
            loss: scalar(&loss),
            loss_cts: scalar(&loss_cts),
            loss_consist: scalar(&loss_consist),
        };
        self.seg.update(loss);
        self.eval_net = None;
        Ok(losses)
    }

    fn step_distillation(
        &mut self,
        inputs: DistillationInputs<B>,
    ) -> Result<DistillationLosses, ModelError> {
        let DistillationInputs {
            images,
            labels,
            target_image,
            target_image_strong,
            target_lp,
            ..
        } = inputs;

        let loss_gta = cross_entropy_2d(self.seg.module.forward(images).out, labels);
        let student = self.seg.module.forward(target_image_strong).out;
        let loss = match target_lp {
            Some(lp) => cross_entropy_2d(student, lp),
            None => {
                let teacher = self.teacher_net();
                let soft = softmax(teacher.forward(target_image.inner()).out, 1);
                soft_cross_entropy(student, Tensor::from_inner(soft))
            }
        }
        .mul_scalar(self.optim.distill_weight);

        let losses = DistillationLosses {
            loss_gta: scalar(&loss_gta),
            loss: scalar(&loss),
        };
        self.seg.update(loss_gta + loss);
        self.eval_net = None;
        Ok(losses)
    }

    fn scheduler_step(&mut self) {
        for net in self.networks_mut() {
            net.scheduler_step();
        }
    }

    fn infer(&mut self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        if self.eval_net.is_none() {
            self.eval_net = Some(self.seg.module.valid());
        }
        self.infer_features(images).1
    }

    fn learning_rates(&self) -> Vec<(String, f64)> {
        self.networks()
            .into_iter()
            .map(|n| (n.name().to_string(), n.lr()))
            .collect()
    }

    fn set_objective_vectors(&mut self, prototypes: Prototypes) -> Result<(), ModelError> {
        if prototypes.feat_dim != self.feat_dim {
            return Err(ModelError::ObjectiveVectorShape {
                expected: self.feat_dim,
                got: prototypes.feat_dim,
            });
        }
        let n_class = self.seg.module.n_class();
        if prototypes.n_class != n_class {
            return Err(ModelError::ObjectiveVectorClasses {
                expected: n_class,
                got: prototypes.n_class,
            });
        }
        let device = self.seg.device.clone();
        self.proto_tensor = Some(prototypes.to_tensor::<B::InnerBackend>(&device));
        self.objective_vectors = Some(prototypes);
        Ok(())
    }

    fn objective_vectors(&self) -> Option<&Prototypes> {
        self.objective_vectors.as_ref()
    }

    fn save_networks(
        &self,
        dir: &Path,
        include_training_state: bool,
    ) -> Result<Vec<String>, ModelError> {
        let mut names = Vec::new();
        for net in self.networks() {
            net.save(dir, include_training_state)?;
            names.push(net.name().to_string());
        }
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::TensorData;
    use tempfile::TempDir;

    type TestBackend = Autodiff<NdArray<f32>>;
    type Inner = NdArray<f32>;

    const N_CLASS: usize = 3;
    const FEAT: usize = 8;

    fn config(stage: Stage) -> AppConfig {
        let mut config = AppConfig::default();
        config.train.stage = stage;
        config.train.n_class = N_CLASS;
        config.train.train_iters = 10;
        config.optim.feat_dim = FEAT;
        config
    }

    fn images(device: &<TestBackend as Backend>::Device) -> Tensor<TestBackend, 4> {
        Tensor::random([2, 3, 16, 16], burn::tensor::Distribution::Normal(0.0, 1.0), device)
    }

    fn labels(device: &<TestBackend as Backend>::Device) -> Tensor<TestBackend, 3, Int> {
        let values: Vec<i64> = (0..2 * 16 * 16).map(|i| (i % N_CLASS) as i64).collect();
        Tensor::from_data(TensorData::new(values, [2, 16, 16]).convert::<i64>(), device)
    }

    fn flipped() -> AugParams {
        AugParams {
            flipped: true,
            brightness: 1.2,
            ..Default::default()
        }
    }

    #[test]
    fn test_networks_per_stage() {
        let device = Default::default();
        let warm = SegAdaptModel::<TestBackend>::new(&config(Stage::WarmUp), &device);
        let names: Vec<String> = warm.learning_rates().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec![DISCRIMINATOR.to_string(), SEG_NET.to_string()]);

        let st = SegAdaptModel::<TestBackend>::new(&config(Stage::Stage1), &device);
        assert_eq!(st.learning_rates().len(), 1);
    }

    #[test]
    fn test_step_adv_returns_finite_losses() {
        let device = Default::default();
        let mut model = SegAdaptModel::<TestBackend>::new(&config(Stage::WarmUp), &device);
        let losses = model
            .step_adv(AdversarialInputs {
                images: images(&device),
                labels: labels(&device),
                target_image: images(&device),
                source_image_strong: images(&device),
                source_params: vec![flipped(), AugParams::default()],
            })
            .unwrap();
        assert!(losses.loss_gta.is_finite() && losses.loss_gta > 0.0);
        assert!(losses.loss_g.is_finite());
        assert!(losses.loss_d.is_finite() && losses.loss_d > 0.0);
    }

    #[test]
    fn test_self_training_requires_prototypes() {
        let device = Default::default();
        let mut model = SegAdaptModel::<TestBackend>::new(&config(Stage::Stage1), &device);
        let inputs = SelfTrainingInputs {
            images: images(&device),
            labels: labels(&device),
            target_image: images(&device),
            target_image_strong: images(&device),
            target_params: vec![flipped(); 2],
            target_lp: None,
            target_lpsoft: None,
            target_image_full: Tensor::zeros([2, 3, 24, 24], &device),
            target_weak_params: vec![flipped(); 2],
        };
        assert!(matches!(
            model.step_self_training(inputs.clone()),
            Err(ModelError::MissingObjectiveVectors)
        ));

        let protos = Prototypes::new(N_CLASS, FEAT, vec![0.1; N_CLASS * FEAT]).unwrap();
        model.set_objective_vectors(protos).unwrap();
        let losses = model
            .step_self_training(SelfTrainingInputs {
                target_lp: Some(labels(&device)),
                ..inputs
            })
            .unwrap();
        assert!(losses.loss.is_finite());
        assert!(losses.loss_consist.is_finite());
    }

    #[test]
    fn test_objective_vector_shape_checked() {
        let device = Default::default();
        let mut model = SegAdaptModel::<TestBackend>::new(&config(Stage::Stage1), &device);
        let protos = Prototypes::new(N_CLASS, FEAT + 1, vec![0.0; N_CLASS * (FEAT + 1)]).unwrap();
        assert!(matches!(
            model.set_objective_vectors(protos),
            Err(ModelError::ObjectiveVectorShape { expected: FEAT, .. })
        ));
        assert!(model.objective_vectors().is_none());
    }

    #[test]
    fn test_objective_vector_class_count_checked() {
        let device = Default::default();
        let mut model = SegAdaptModel::<TestBackend>::new(&config(Stage::Stage1), &device);
        let n = N_CLASS + 2;
        let protos = Prototypes::new(n, FEAT, vec![0.1; n * FEAT]).unwrap();
        assert!(matches!(
            model.set_objective_vectors(protos),
            Err(ModelError::ObjectiveVectorClasses { expected: N_CLASS, got }) if got == n
        ));
        assert!(model.objective_vectors().is_none());
    }

    #[test]
    fn test_distillation_without_pseudo_labels_uses_teacher() {
        let device = Default::default();
        let mut model = SegAdaptModel::<TestBackend>::new(&config(Stage::Distillation), &device);
        let losses = model
            .step_distillation(DistillationInputs {
                images: images(&device),
                labels: labels(&device),
                target_image: images(&device),
                target_image_strong: images(&device),
                target_params: vec![AugParams::default(); 2],
                target_lp: None,
            })
            .unwrap();
        assert!(losses.loss.is_finite() && losses.loss > 0.0);
        assert!(model.teacher.is_some());
    }

    #[test]
    fn test_poly_schedule_advances_all_networks() {
        let device = Default::default();
        let mut cfg = config(Stage::WarmUp);
        cfg.optim.scheduler = crate::config::SchedulerKind::Poly;
        let mut model = SegAdaptModel::<TestBackend>::new(&cfg, &device);
        let before = model.learning_rates();
        model.scheduler_step();
        let after = model.learning_rates();
        for ((_, b), (_, a)) in before.iter().zip(&after) {
            assert!(a < b);
        }
    }

    #[test]
    fn test_infer_output_shape() {
        let device = Default::default();
        let mut model = SegAdaptModel::<TestBackend>::new(&config(Stage::WarmUp), &device);
        model.enter_eval_mode();
        let out = model.infer(images(&device));
        assert_eq!(out.dims(), [2, N_CLASS, 4, 4]);
        model.release_device_memory();
        model.enter_train_mode();
        assert!(model.is_training());
    }

    #[test]
    fn test_save_and_resume() {
        let tmp = TempDir::new().unwrap();
        let device = Default::default();
        let mut cfg = config(Stage::WarmUp);
        cfg.optim.scheduler = crate::config::SchedulerKind::Poly;
        let mut model = SegAdaptModel::<TestBackend>::new(&cfg, &device);
        model.scheduler_step();

        let names = model.save_networks(tmp.path(), true).unwrap();
        assert_eq!(names, vec![DISCRIMINATOR.to_string(), SEG_NET.to_string()]);
        assert!(tmp.path().join("SegNet.mpk").exists());
        assert!(tmp.path().join("SegNet_optim.mpk").exists());
        assert!(tmp.path().join("Discriminator_scheduler.json").exists());

        let mut restored = SegAdaptModel::<TestBackend>::new(&cfg, &device);
        restored.resume(tmp.path()).unwrap();
        assert_eq!(restored.learning_rates(), model.learning_rates());
    }

    #[test]
    fn test_params_only_save() {
        let tmp = TempDir::new().unwrap();
        let device = Default::default();
        let model = SegAdaptModel::<TestBackend>::new(&config(Stage::Stage1), &device);
        model.save_networks(tmp.path(), false).unwrap();
        assert!(tmp.path().join("SegNet.mpk").exists());
        assert!(!tmp.path().join("SegNet_optim.mpk").exists());
        assert!(!tmp.path().join("SegNet_scheduler.json").exists());
    }

    #[test]
    fn test_rectify_prefers_nearest_prototype() {
        let device = Default::default();
        let probs = Tensor::<Inner, 4>::full([1, 2, 2, 2], 0.5, &device);
        let feat = Tensor::<Inner, 4>::zeros([1, 1, 2, 2], &device);
        let protos = Tensor::<Inner, 2>::from_data(TensorData::new(vec![10.0f32, 0.0], [2, 1]), &device);
        let labels = rectify_pseudo_labels(probs, feat, protos, 1.0, [4, 4]);
        assert_eq!(labels.dims(), [1, 4, 4]);
        let values: Vec<i64> = labels.into_data().iter::<i64>().collect();
        assert!(values.iter().all(|&v| v == 1));
    }

    #[test]
    fn test_align_to_view_flips_selected_samples() {
        let device = Default::default();
        let x = Tensor::<Inner, 4>::from_data(
            TensorData::new(vec![1.0f32, 2.0, 3.0, 4.0], [2, 1, 1, 2]),
            &device,
        );
        let params = [AugParams::default(), flipped()];
        let y: Vec<f32> = align_to_view(x, &params).into_data().iter::<f32>().collect();
        assert_eq!(y, vec![1.0, 2.0, 4.0, 3.0]);
    }

    #[test]
    fn test_compute_prototypes_shape() {
        use crate::data::{BatchField, BatchRecord, VecLoader, IMG, IMG_FULL, IMG_STRONG, LP, PARAMS, WEAK_PARAMS};

        let device = Default::default();
        let mut model = SegAdaptModel::<TestBackend>::new(&config(Stage::Stage1), &device);
        let record = |with_lp: bool| {
            let r = BatchRecord::new()
                .with(IMG, BatchField::Image(images(&device)))
                .with(IMG_STRONG, BatchField::Image(images(&device)))
                .with(IMG_FULL, BatchField::Image(images(&device)))
                .with(PARAMS, BatchField::Params(vec![AugParams::default(); 2]))
                .with(WEAK_PARAMS, BatchField::Params(vec![AugParams::default(); 2]));
            if with_lp {
                r.with(LP, BatchField::Labels(labels(&device)))
            } else {
                r
            }
        };
        let mut loader = VecLoader::new(vec![record(true), record(false)]);
        let protos = model.compute_prototypes(&mut loader).unwrap();
        assert_eq!(protos.n_class, N_CLASS);
        assert_eq!(protos.feat_dim, FEAT);
        assert!(protos.values.iter().all(|v| v.is_finite()));
    }
}
