//! Per-class feature prototypes ("objective vectors").
//!
//! Prototypes are computed offline by the `prototypes` binary and stored as
//! JSON next to the checkpoint that produced them. The stage1 self-training
//! step loads them once at startup and uses them as fixed anchors.

use std::path::{Path, PathBuf};

use burn::prelude::*;
use burn::tensor::TensorData;

use crate::config::TrainOptions;
use crate::error::PrototypeError;
use crate::stage::Stage;

/// `n_class x feat_dim` matrix of class-mean features, row-major.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Prototypes {
    pub n_class: usize,
    pub feat_dim: usize,
    pub values: Vec<f32>,
}

impl Prototypes {
    pub fn new(n_class: usize, feat_dim: usize, values: Vec<f32>) -> Result<Self, PrototypeError> {
        let prototypes = Prototypes {
            n_class,
            feat_dim,
            values,
        };
        prototypes.check_shape()?;
        Ok(prototypes)
    }

    fn check_shape(&self) -> Result<(), PrototypeError> {
        if self.values.len() != self.n_class * self.feat_dim {
            return Err(PrototypeError::Shape {
                len: self.values.len(),
                n_class: self.n_class,
                feat_dim: self.feat_dim,
            });
        }
        Ok(())
    }

    pub fn class(&self, c: usize) -> &[f32] {
        &self.values[c * self.feat_dim..(c + 1) * self.feat_dim]
    }

    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 2> {
        let data = TensorData::new(self.values.clone(), [self.n_class, self.feat_dim])
            .convert::<B::FloatElem>();
        Tensor::from_data(data, device)
    }

    pub fn save(&self, path: &Path) -> Result<(), PrototypeError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, PrototypeError> {
        if !path.exists() {
            return Err(PrototypeError::NotFound(path.to_path_buf()));
        }
        let json = std::fs::read_to_string(path).map_err(|e| PrototypeError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let prototypes: Prototypes =
            serde_json::from_str(&json).map_err(|e| PrototypeError::Parse {
                path: path.to_path_buf(),
                source: e,
            })?;
        prototypes.check_shape()?;
        Ok(prototypes)
    }
}

/// `<dirname(resume_path)>/prototypes_on_<tgt>_from_<model>`.
pub fn prototype_path(resume_path: &Path, tgt_dataset: &str, model_name: &str) -> PathBuf {
    let dir = resume_path.parent().unwrap_or_else(|| Path::new(""));
    dir.join(format!("prototypes_on_{tgt_dataset}_from_{model_name}"))
}

/// Load the prototypes a stage needs at startup.
///
/// Only `stage1` reads them; every other stage gets `Ok(None)`. For `stage1`
/// a missing file is an error.
pub fn load_objective_vectors(options: &TrainOptions) -> Result<Option<Prototypes>, PrototypeError> {
    if options.stage != Stage::Stage1 {
        return Ok(None);
    }
    let resume = options
        .resume_path
        .as_deref()
        .ok_or(PrototypeError::NoResumePath)?;
    let path = prototype_path(resume, &options.tgt_dataset, &options.model_name);
    let prototypes = Prototypes::load(&path)?;
    log::info!(
        "Loaded {} prototypes ({} channels) from {}",
        prototypes.n_class,
        prototypes.feat_dim,
        path.display()
    );
    Ok(Some(prototypes))
}

/// Running per-class feature sums.
#[derive(Debug, Clone)]
pub struct PrototypeAccumulator {
    n_class: usize,
    feat_dim: usize,
    sums: Vec<f64>,
    counts: Vec<u64>,
}

impl PrototypeAccumulator {
    pub fn new(n_class: usize, feat_dim: usize) -> Self {
        PrototypeAccumulator {
            n_class,
            feat_dim,
            sums: vec![0.0; n_class * feat_dim],
            counts: vec![0; n_class],
        }
    }

    /// Add every labelled pixel of `feat` (`[batch, feat_dim, h, w]`) to its
    /// class sum. `labels` is `[batch, h, w]`; values outside `0..n_class`
    /// are skipped.
    pub fn update<B: Backend>(&mut self, feat: Tensor<B, 4>, labels: Tensor<B, 3, Int>) {
        let [batch, dim, h, w] = feat.dims();
        debug_assert_eq!(dim, self.feat_dim);
        debug_assert_eq!(labels.dims(), [batch, h, w]);

        let feat: Vec<f32> = feat.into_data().iter::<f32>().collect();
        let labels: Vec<i64> = labels.into_data().iter::<i64>().collect();
        let plane = h * w;

        for b in 0..batch {
            for p in 0..plane {
                let label = labels[b * plane + p];
                if label < 0 || label as usize >= self.n_class {
                    continue;
                }
                let c = label as usize;
                self.counts[c] += 1;
                for d in 0..dim {
                    self.sums[c * dim + d] += feat[(b * dim + d) * plane + p] as f64;
                }
            }
        }
    }

    pub fn count(&self, c: usize) -> u64 {
        self.counts[c]
    }

    /// Class means; classes never observed get a zero vector.
    pub fn finish(self) -> Prototypes {
        let mut values = vec![0f32; self.n_class * self.feat_dim];
        for c in 0..self.n_class {
            let n = self.counts[c];
            if n == 0 {
                log::warn!("class {c} has no pixels, its prototype is zero");
                continue;
            }
            for d in 0..self.feat_dim {
                values[c * self.feat_dim + d] = (self.sums[c * self.feat_dim + d] / n as f64) as f32;
            }
        }
        Prototypes {
            n_class: self.n_class,
            feat_dim: self.feat_dim,
            values,
        }
    }
}
