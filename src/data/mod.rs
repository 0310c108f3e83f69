//! Batches, loaders and the source/target dataset bundle.
//!
//! Loaders produce [`BatchRecord`]s: maps from field name to tensor or
//! augmentation parameters. The training loop converts them into typed views
//! ([`SourceBatch`], [`TargetBatch`], [`ValidBatch`]); required fields must be
//! present, while the optional pseudo-label fields become `None` when absent.

mod augment;
mod folder;

use std::collections::HashMap;

use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};

use crate::config::AppConfig;
use crate::error::DataError;

pub use augment::{flip_gray, flip_rgb, photometric, AugParams};
pub use folder::{FolderLoader, FolderLoaderConfig, LoaderRole};

/// Label value for pixels excluded from losses and metrics.
pub const IGNORE_INDEX: i64 = 250;

pub const IMG: &str = "img";
pub const IMG_STRONG: &str = "img_strong";
pub const IMG_FULL: &str = "img_full";
pub const LABEL: &str = "label";
pub const PARAMS: &str = "params";
pub const WEAK_PARAMS: &str = "weak_params";
pub const LP: &str = "lp";
pub const LP_SOFT: &str = "lpsoft";

/// One named entry of a batch record.
#[derive(Debug, Clone)]
pub enum BatchField<B: Backend> {
    /// `[batch, 3, height, width]` normalised image.
    Image(Tensor<B, 4>),
    /// `[batch, height, width]` class indices.
    Labels(Tensor<B, 3, Int>),
    /// `[batch, n_class, height, width]` class distribution.
    Soft(Tensor<B, 4>),
    /// Per-sample augmentation parameters.
    Params(Vec<AugParams>),
}

/// Field-name keyed batch, produced fresh per iteration and consumed once.
#[derive(Debug, Clone)]
pub struct BatchRecord<B: Backend> {
    fields: HashMap<&'static str, BatchField<B>>,
}

impl<B: Backend> Default for BatchRecord<B> {
    fn default() -> Self {
        BatchRecord {
            fields: HashMap::new(),
        }
    }
}

impl<B: Backend> BatchRecord<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &'static str, field: BatchField<B>) -> Self {
        self.fields.insert(name, field);
        self
    }

    pub fn insert(&mut self, name: &'static str, field: BatchField<B>) {
        self.fields.insert(name, field);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    fn take(&mut self, name: &'static str) -> Result<BatchField<B>, DataError> {
        self.fields
            .remove(name)
            .ok_or(DataError::MissingField(name))
    }

    fn take_image(&mut self, name: &'static str) -> Result<Tensor<B, 4>, DataError> {
        match self.take(name)? {
            BatchField::Image(t) => Ok(t),
            _ => Err(DataError::FieldKind {
                field: name,
                expected: "image",
            }),
        }
    }

    fn take_labels(&mut self, name: &'static str) -> Result<Tensor<B, 3, Int>, DataError> {
        match self.take(name)? {
            BatchField::Labels(t) => Ok(t),
            _ => Err(DataError::FieldKind {
                field: name,
                expected: "labels",
            }),
        }
    }

    fn take_params(&mut self, name: &'static str) -> Result<Vec<AugParams>, DataError> {
        match self.take(name)? {
            BatchField::Params(p) => Ok(p),
            _ => Err(DataError::FieldKind {
                field: name,
                expected: "params",
            }),
        }
    }

    fn take_optional_labels(
        &mut self,
        name: &'static str,
    ) -> Result<Option<Tensor<B, 3, Int>>, DataError> {
        if self.contains(name) {
            self.take_labels(name).map(Some)
        } else {
            Ok(None)
        }
    }

    fn take_optional_soft(&mut self, name: &'static str) -> Result<Option<Tensor<B, 4>>, DataError> {
        match self.fields.remove(name) {
            None => Ok(None),
            Some(BatchField::Soft(t)) => Ok(Some(t)),
            Some(_) => Err(DataError::FieldKind {
                field: name,
                expected: "soft labels",
            }),
        }
    }
}

/// Labelled source-domain batch.
#[derive(Debug, Clone)]
pub struct SourceBatch<B: Backend> {
    pub img: Tensor<B, 4>,
    pub label: Tensor<B, 3, Int>,
    pub img_strong: Tensor<B, 4>,
    pub params: Vec<AugParams>,
}

impl<B: Backend> TryFrom<BatchRecord<B>> for SourceBatch<B> {
    type Error = DataError;

    fn try_from(mut record: BatchRecord<B>) -> Result<Self, DataError> {
        Ok(SourceBatch {
            img: record.take_image(IMG)?,
            label: record.take_labels(LABEL)?,
            img_strong: record.take_image(IMG_STRONG)?,
            params: record.take_params(PARAMS)?,
        })
    }
}

/// Unlabelled target-domain batch with weak/strong/full views.
#[derive(Debug, Clone)]
pub struct TargetBatch<B: Backend> {
    pub img: Tensor<B, 4>,
    pub img_strong: Tensor<B, 4>,
    pub params: Vec<AugParams>,
    pub img_full: Tensor<B, 4>,
    pub weak_params: Vec<AugParams>,
    pub lp: Option<Tensor<B, 3, Int>>,
    pub lpsoft: Option<Tensor<B, 4>>,
}

impl<B: Backend> TryFrom<BatchRecord<B>> for TargetBatch<B> {
    type Error = DataError;

    fn try_from(mut record: BatchRecord<B>) -> Result<Self, DataError> {
        Ok(TargetBatch {
            img: record.take_image(IMG)?,
            img_strong: record.take_image(IMG_STRONG)?,
            params: record.take_params(PARAMS)?,
            img_full: record.take_image(IMG_FULL)?,
            weak_params: record.take_params(WEAK_PARAMS)?,
            lp: record.take_optional_labels(LP)?,
            lpsoft: record.take_optional_soft(LP_SOFT)?,
        })
    }
}

/// Labelled validation batch.
#[derive(Debug, Clone)]
pub struct ValidBatch<B: Backend> {
    pub img: Tensor<B, 4>,
    pub label: Tensor<B, 3, Int>,
}

impl<B: Backend> TryFrom<BatchRecord<B>> for ValidBatch<B> {
    type Error = DataError;

    fn try_from(mut record: BatchRecord<B>) -> Result<Self, DataError> {
        Ok(ValidBatch {
            img: record.take_image(IMG)?,
            label: record.take_labels(LABEL)?,
        })
    }
}

/// Indexed source of batch records.
pub trait BatchLoader<B: Backend> {
    fn num_batches(&self) -> usize;

    /// Called before each pass; shuffling loaders reorder here.
    fn start_epoch(&mut self) {}

    fn load_batch(&mut self, index: usize) -> Result<BatchRecord<B>, DataError>;
}

/// Loader over batches already held in memory.
pub struct VecLoader<B: Backend> {
    batches: Vec<BatchRecord<B>>,
}

impl<B: Backend> VecLoader<B> {
    pub fn new(batches: Vec<BatchRecord<B>>) -> Self {
        VecLoader { batches }
    }
}

impl<B: Backend> BatchLoader<B> for VecLoader<B> {
    fn num_batches(&self) -> usize {
        self.batches.len()
    }

    fn load_batch(&mut self, index: usize) -> Result<BatchRecord<B>, DataError> {
        self.batches
            .get(index)
            .cloned()
            .ok_or(DataError::BatchOutOfRange {
                index,
                len: self.batches.len(),
            })
    }
}

/// Endless iteration over a loader, restarting when exhausted.
///
/// The source domain is cycled independently of the target epoch boundaries.
pub struct SourceCycle<B: Backend> {
    loader: Box<dyn BatchLoader<B>>,
    cursor: usize,
}

impl<B: Backend> SourceCycle<B> {
    pub fn new(loader: Box<dyn BatchLoader<B>>) -> Self {
        SourceCycle { loader, cursor: 0 }
    }

    pub fn next_batch(&mut self) -> Result<BatchRecord<B>, DataError> {
        let len = self.loader.num_batches();
        if len == 0 {
            return Err(DataError::EmptyLoader);
        }
        if self.cursor == 0 {
            self.loader.start_epoch();
        }
        let record = self.loader.load_batch(self.cursor)?;
        self.cursor = (self.cursor + 1) % len;
        Ok(record)
    }
}

/// Source and target loaders used by one training run.
pub struct Datasets<B: Backend> {
    pub source_train: SourceCycle<B>,
    pub target_train: Box<dyn BatchLoader<B>>,
    pub target_valid: Box<dyn BatchLoader<B>>,
}

/// Build folder-backed loaders for both domains from configuration.
pub fn create_datasets<B: Backend>(
    config: &AppConfig,
    device: &B::Device,
) -> Result<Datasets<B>, DataError> {
    let data = &config.data;
    let seed = config.train.seed;

    let source = FolderLoader::<B>::open(
        FolderLoaderConfig {
            root: data.src_root.clone(),
            pseudo_dir: None,
            size: data.train_size,
            full_size: data.full_size,
            batch_size: config.train.bs,
            shuffle: true,
            seed,
        },
        LoaderRole::SourceTrain,
        device,
    )?;
    let target = FolderLoader::<B>::open(
        FolderLoaderConfig {
            root: data.tgt_root.clone(),
            pseudo_dir: data.pseudo_dir.clone(),
            size: data.train_size,
            full_size: data.full_size,
            batch_size: config.train.bs,
            shuffle: true,
            seed: seed.wrapping_add(1),
        },
        LoaderRole::TargetTrain,
        device,
    )?;
    let valid = FolderLoader::<B>::open(
        FolderLoaderConfig {
            root: data.tgt_valid_root.clone(),
            pseudo_dir: None,
            size: data.valid_size,
            full_size: data.valid_size,
            batch_size: data.valid_bs,
            shuffle: false,
            seed,
        },
        LoaderRole::Validation,
        device,
    )?;

    log::info!(
        "source {} batches, target {} batches, validation {} batches",
        source.num_batches(),
        target.num_batches(),
        valid.num_batches()
    );

    Ok(Datasets {
        source_train: SourceCycle::new(Box::new(source)),
        target_train: Box::new(target),
        target_valid: Box::new(valid),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn image(v: f32) -> BatchField<TestBackend> {
        BatchField::Image(Tensor::full([1, 3, 2, 2], v, &Default::default()))
    }

    fn labels() -> BatchField<TestBackend> {
        BatchField::Labels(Tensor::zeros([1, 2, 2], &Default::default()))
    }

    fn target_record() -> BatchRecord<TestBackend> {
        BatchRecord::new()
            .with(IMG, image(0.0))
            .with(IMG_STRONG, image(1.0))
            .with(PARAMS, BatchField::Params(vec![AugParams::default()]))
            .with(IMG_FULL, image(2.0))
            .with(WEAK_PARAMS, BatchField::Params(vec![AugParams::default()]))
    }

    #[test]
    fn test_target_batch_without_pseudo_labels() {
        let batch = TargetBatch::try_from(target_record()).unwrap();
        assert!(batch.lp.is_none());
        assert!(batch.lpsoft.is_none());
        assert_eq!(batch.img_full.dims(), [1, 3, 2, 2]);
    }

    #[test]
    fn test_target_batch_with_pseudo_labels() {
        let record = target_record().with(LP, labels()).with(
            LP_SOFT,
            BatchField::Soft(Tensor::zeros([1, 4, 2, 2], &Default::default())),
        );
        let batch = TargetBatch::try_from(record).unwrap();
        assert!(batch.lp.is_some());
        assert_eq!(batch.lpsoft.unwrap().dims(), [1, 4, 2, 2]);
    }

    #[test]
    fn test_missing_required_field() {
        let record = BatchRecord::<TestBackend>::new().with(IMG, image(0.0));
        let err = SourceBatch::try_from(record).unwrap_err();
        assert!(matches!(err, DataError::MissingField(LABEL)));
    }

    #[test]
    fn test_wrong_field_kind() {
        let record = BatchRecord::<TestBackend>::new()
            .with(IMG, image(0.0))
            .with(LABEL, image(0.0));
        let err = ValidBatch::try_from(record).unwrap_err();
        assert!(matches!(err, DataError::FieldKind { field: LABEL, .. }));
    }

    #[test]
    fn test_source_cycle_wraps() {
        let records = (0..2)
            .map(|i| BatchRecord::new().with(IMG, image(i as f32)))
            .collect();
        let mut cycle = SourceCycle::<TestBackend>::new(Box::new(VecLoader::new(records)));
        let mut seen = Vec::new();
        for _ in 0..5 {
            let mut r = cycle.next_batch().unwrap();
            let img = r.take_image(IMG).unwrap();
            let v: f32 = img.into_data().iter::<f32>().next().unwrap();
            seen.push(v);
        }
        assert_eq!(seen, vec![0.0, 1.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_source_cycle_empty() {
        let mut cycle = SourceCycle::<TestBackend>::new(Box::new(VecLoader::new(Vec::new())));
        assert!(matches!(cycle.next_batch(), Err(DataError::EmptyLoader)));
    }
}
