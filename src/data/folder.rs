use std::fs;
use std::path::{Path, PathBuf};

use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};
use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::augment::{flip_gray, flip_rgb, photometric, AugParams};
use super::{
    BatchField, BatchLoader, BatchRecord, IGNORE_INDEX, IMG, IMG_FULL, IMG_STRONG, LABEL, LP,
    PARAMS, WEAK_PARAMS,
};
use crate::error::DataError;

const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// What a loader yields, which decides the fields it fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderRole {
    /// `img`, `label`, `img_strong`, `params`.
    SourceTrain,
    /// `img`, `img_strong`, `params`, `img_full`, `weak_params`, optional `lp`.
    TargetTrain,
    /// `img`, `label`.
    Validation,
}

#[derive(Debug, Clone)]
pub struct FolderLoaderConfig {
    pub root: PathBuf,
    /// Hard pseudo-label directory, joined onto `root` when relative.
    pub pseudo_dir: Option<PathBuf>,
    /// `[height, width]`.
    pub size: [usize; 2],
    pub full_size: [usize; 2],
    pub batch_size: usize,
    pub shuffle: bool,
    pub seed: u64,
}

#[derive(Debug, Clone)]
struct Sample {
    image: PathBuf,
    label: Option<PathBuf>,
    pseudo: Option<PathBuf>,
}

/// Loader over `<root>/images/*` with labels in `<root>/labels/<stem>.png`.
///
/// Label pixels hold class ids; 255 is mapped to [`IGNORE_INDEX`].
pub struct FolderLoader<B: Backend> {
    samples: Vec<Sample>,
    config: FolderLoaderConfig,
    role: LoaderRole,
    order: Vec<usize>,
    rng: StdRng,
    device: B::Device,
}

fn is_image(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()),
        Some(ref e) if e == "png" || e == "jpg" || e == "jpeg"
    )
}

impl<B: Backend> FolderLoader<B> {
    pub fn open(
        config: FolderLoaderConfig,
        role: LoaderRole,
        device: &B::Device,
    ) -> Result<Self, DataError> {
        let image_dir = config.root.join("images");
        if !image_dir.is_dir() {
            return Err(DataError::DirNotFound(image_dir));
        }
        let label_dir = config.root.join("labels");
        let pseudo_dir = config.pseudo_dir.as_ref().map(|p| config.root.join(p));

        let mut images: Vec<PathBuf> = fs::read_dir(&image_dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| is_image(p))
            .collect();
        images.sort();
        if images.is_empty() {
            return Err(DataError::Empty(image_dir));
        }

        let needs_label = role != LoaderRole::TargetTrain;
        let mut samples = Vec::with_capacity(images.len());
        for image in images {
            let stem = image
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let label = label_dir.join(format!("{stem}.png"));
            let label = if label.is_file() { Some(label) } else { None };
            if needs_label && label.is_none() {
                return Err(DataError::MissingLabel(image));
            }
            let pseudo = pseudo_dir
                .as_ref()
                .map(|d| d.join(format!("{stem}.png")))
                .filter(|p| p.is_file());
            samples.push(Sample {
                image,
                label,
                pseudo,
            });
        }

        let order = (0..samples.len()).collect();
        Ok(FolderLoader {
            samples,
            rng: StdRng::seed_from_u64(config.seed),
            config,
            role,
            order,
            device: device.clone(),
        })
    }

    pub fn num_samples(&self) -> usize {
        self.samples.len()
    }

    fn read_rgb(&self, path: &Path, size: [usize; 2]) -> Result<RgbImage, DataError> {
        let img = image::open(path)
            .map_err(|e| DataError::Image {
                path: path.to_path_buf(),
                source: e,
            })?
            .to_rgb8();
        Ok(imageops::resize(
            &img,
            size[1] as u32,
            size[0] as u32,
            FilterType::Triangle,
        ))
    }

    fn read_labels(&self, path: &Path, size: [usize; 2]) -> Result<GrayImage, DataError> {
        let img = image::open(path)
            .map_err(|e| DataError::Image {
                path: path.to_path_buf(),
                source: e,
            })?
            .to_luma8();
        Ok(imageops::resize(
            &img,
            size[1] as u32,
            size[0] as u32,
            FilterType::Nearest,
        ))
    }

    fn image_tensor(&self, images: &[RgbImage], size: [usize; 2]) -> Tensor<B, 4> {
        let [h, w] = size;
        let mut values = Vec::with_capacity(images.len() * 3 * h * w);
        for img in images {
            for c in 0..3 {
                for px in img.pixels() {
                    values.push((px[c] as f32 / 255.0 - MEAN[c]) / STD[c]);
                }
            }
        }
        let data = TensorData::new(values, [images.len(), 3, h, w]);
        Tensor::from_data(data.convert::<B::FloatElem>(), &self.device)
    }

    fn label_tensor(&self, labels: &[GrayImage], size: [usize; 2]) -> Tensor<B, 3, Int> {
        let [h, w] = size;
        let mut values = Vec::with_capacity(labels.len() * h * w);
        for img in labels {
            values.extend(img.pixels().map(|p| match p[0] {
                255 => IGNORE_INDEX,
                v => v as i64,
            }));
        }
        let data = TensorData::new(values, [labels.len(), h, w]);
        Tensor::from_data(data.convert::<B::IntElem>(), &self.device)
    }
}

impl<B: Backend> BatchLoader<B> for FolderLoader<B> {
    fn num_batches(&self) -> usize {
        let bs = self.config.batch_size.max(1);
        match self.role {
            LoaderRole::Validation => self.samples.len().div_ceil(bs),
            _ => self.samples.len() / bs,
        }
    }

    fn start_epoch(&mut self) {
        if self.config.shuffle {
            self.order.shuffle(&mut self.rng);
        }
    }

    fn load_batch(&mut self, index: usize) -> Result<BatchRecord<B>, DataError> {
        let len = self.num_batches();
        if index >= len {
            return Err(DataError::BatchOutOfRange { index, len });
        }
        let bs = self.config.batch_size.max(1);
        let start = index * bs;
        let end = (start + bs).min(self.samples.len());
        let picked: Vec<Sample> = self.order[start..end]
            .iter()
            .map(|&i| self.samples[i].clone())
            .collect();
        let size = self.config.size;

        let mut record = BatchRecord::new();
        if self.role == LoaderRole::Validation {
            let mut imgs = Vec::with_capacity(picked.len());
            let mut labels = Vec::with_capacity(picked.len());
            for s in &picked {
                imgs.push(self.read_rgb(&s.image, size)?);
                let label = s.label.as_ref().ok_or_else(|| DataError::MissingLabel(s.image.clone()))?;
                labels.push(self.read_labels(label, size)?);
            }
            record.insert(IMG, BatchField::Image(self.image_tensor(&imgs, size)));
            record.insert(LABEL, BatchField::Labels(self.label_tensor(&labels, size)));
            return Ok(record);
        }

        let mut weak_imgs = Vec::with_capacity(picked.len());
        let mut strong_imgs = Vec::with_capacity(picked.len());
        let mut full_imgs = Vec::with_capacity(picked.len());
        let mut labels = Vec::with_capacity(picked.len());
        let mut pseudo = Vec::with_capacity(picked.len());
        let mut weak_params = Vec::with_capacity(picked.len());
        let mut strong_params = Vec::with_capacity(picked.len());

        for s in &picked {
            let raw = image::open(&s.image)
                .map_err(|e| DataError::Image {
                    path: s.image.clone(),
                    source: e,
                })?
                .to_rgb8();
            let resized = imageops::resize(&raw, size[1] as u32, size[0] as u32, FilterType::Triangle);

            let weak = AugParams::sample_weak(&mut self.rng);
            let strong = AugParams::sample_strong(&mut self.rng, &weak);
            let weak_img = flip_rgb(&resized, &weak);
            strong_imgs.push(photometric(&weak_img, &strong));
            weak_imgs.push(weak_img);

            match self.role {
                LoaderRole::SourceTrain => {
                    let label = s.label.as_ref().ok_or_else(|| DataError::MissingLabel(s.image.clone()))?;
                    labels.push(flip_gray(&self.read_labels(label, size)?, &weak));
                }
                _ => {
                    let [fh, fw] = self.config.full_size;
                    full_imgs.push(imageops::resize(&raw, fw as u32, fh as u32, FilterType::Triangle));
                    if let Some(p) = &s.pseudo {
                        pseudo.push(flip_gray(&self.read_labels(p, size)?, &weak));
                    }
                }
            }
            weak_params.push(weak);
            strong_params.push(strong);
        }

        record.insert(IMG, BatchField::Image(self.image_tensor(&weak_imgs, size)));
        record.insert(IMG_STRONG, BatchField::Image(self.image_tensor(&strong_imgs, size)));
        record.insert(PARAMS, BatchField::Params(strong_params));

        if self.role == LoaderRole::SourceTrain {
            record.insert(LABEL, BatchField::Labels(self.label_tensor(&labels, size)));
        } else {
            record.insert(
                IMG_FULL,
                BatchField::Image(self.image_tensor(&full_imgs, self.config.full_size)),
            );
            record.insert(WEAK_PARAMS, BatchField::Params(weak_params));
            // Pseudo-labels are only usable when the whole batch has them.
            if !pseudo.is_empty() && pseudo.len() == picked.len() {
                record.insert(LP, BatchField::Labels(self.label_tensor(&pseudo, size)));
            }
        }
        Ok(record)
    }
}
