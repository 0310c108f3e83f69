use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::stage::Stage;

/// Options that drive the training loop.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct TrainOptions {
    pub stage: Stage,
    pub seed: u64,
    pub epochs: usize,
    /// Nominal iteration count, shown in progress lines.
    pub train_iters: usize,
    pub bs: usize,
    pub print_interval: usize,
    pub val_interval: usize,
    pub freeze_bn: bool,
    /// Checkpoint to resume from; its directory also holds the stage1 prototypes.
    pub resume_path: Option<PathBuf>,
    pub src_dataset: String,
    pub tgt_dataset: String,
    pub model_name: String,
    pub n_class: usize,
    pub logdir: PathBuf,
}

impl Default for TrainOptions {
    fn default() -> Self {
        TrainOptions {
            stage: Stage::WarmUp,
            seed: 1337,
            epochs: 84,
            train_iters: 90_000,
            bs: 2,
            print_interval: 20,
            val_interval: 1000,
            freeze_bn: false,
            resume_path: None,
            src_dataset: "gta5".to_string(),
            tgt_dataset: "cityscapes".to_string(),
            model_name: "deeplabv2".to_string(),
            n_class: 19,
            logdir: PathBuf::from("logs/default"),
        }
    }
}

/// Where each domain's images live and how they are sized.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub src_root: PathBuf,
    pub tgt_root: PathBuf,
    /// Validation split of the target domain.
    pub tgt_valid_root: PathBuf,
    /// Directory of hard pseudo-labels for target images, relative to `tgt_root`.
    pub pseudo_dir: Option<PathBuf>,
    /// `[height, width]` of training crops.
    pub train_size: [usize; 2],
    /// `[height, width]` of the full-resolution target view.
    pub full_size: [usize; 2],
    pub valid_size: [usize; 2],
    pub valid_bs: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        DataConfig {
            src_root: PathBuf::from("data/gta5"),
            tgt_root: PathBuf::from("data/cityscapes/train"),
            tgt_valid_root: PathBuf::from("data/cityscapes/val"),
            pseudo_dir: None,
            train_size: [512, 896],
            full_size: [1024, 2048],
            valid_size: [1024, 2048],
            valid_bs: 1,
        }
    }
}

/// Learning-rate schedule shape.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    Constant,
    Poly,
}

/// Optimisation and loss hyperparameters of the adaptation model.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct OptimConfig {
    pub lr: f64,
    pub lr_d: f64,
    pub scheduler: SchedulerKind,
    pub poly_power: f64,
    pub feat_dim: usize,
    pub adv_weight: f32,
    pub consist_weight: f32,
    pub distill_weight: f32,
    /// Temperature of the softmax over negative prototype distances.
    pub proto_temperature: f32,
}

impl Default for OptimConfig {
    fn default() -> Self {
        OptimConfig {
            lr: 1e-4,
            lr_d: 1e-4,
            scheduler: SchedulerKind::Constant,
            poly_power: 0.9,
            feat_dim: 128,
            adv_weight: 0.01,
            consist_weight: 10.0,
            distill_weight: 1.0,
            proto_temperature: 1.0,
        }
    }
}

/// Top-level application configuration, loadable from TOML.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub train: TrainOptions,
    pub data: DataConfig,
    pub optim: OptimConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration from a TOML file, falling back to defaults if the file
    /// does not exist.
    ///
    /// Neither loader validates: command-line overrides are applied first and
    /// the caller runs [`AppConfig::validate`] on the merged result.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.train;
        if t.epochs == 0 {
            return Err(ConfigError::Validation("train.epochs must be > 0".into()));
        }
        if t.bs == 0 {
            return Err(ConfigError::Validation("train.bs must be > 0".into()));
        }
        if t.print_interval == 0 {
            return Err(ConfigError::Validation(
                "train.print_interval must be > 0".into(),
            ));
        }
        if t.val_interval == 0 {
            return Err(ConfigError::Validation(
                "train.val_interval must be > 0".into(),
            ));
        }
        if t.n_class == 0 {
            return Err(ConfigError::Validation("train.n_class must be > 0".into()));
        }
        if t.stage == Stage::Stage1 && t.resume_path.is_none() {
            return Err(ConfigError::Validation(
                "train.resume_path is required for stage1".into(),
            ));
        }

        let d = &self.data;
        if d.train_size.contains(&0) || d.full_size.contains(&0) || d.valid_size.contains(&0) {
            return Err(ConfigError::Validation("data sizes must be > 0".into()));
        }
        if d.valid_bs == 0 {
            return Err(ConfigError::Validation("data.valid_bs must be > 0".into()));
        }

        let o = &self.optim;
        if o.lr <= 0.0 || o.lr_d <= 0.0 {
            return Err(ConfigError::Validation(
                "optim.lr and optim.lr_d must be > 0".into(),
            ));
        }
        if o.feat_dim == 0 {
            return Err(ConfigError::Validation("optim.feat_dim must be > 0".into()));
        }
        if o.proto_temperature <= 0.0 {
            return Err(ConfigError::Validation(
                "optim.proto_temperature must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// Make every relative path absolute with respect to `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        let abs = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        abs(&mut self.train.logdir);
        if let Some(p) = self.train.resume_path.as_mut() {
            abs(p);
        }
        abs(&mut self.data.src_root);
        abs(&mut self.data.tgt_root);
        abs(&mut self.data.tgt_valid_root);
    }

    /// Generate a TOML string with all default values.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&AppConfig::default()).expect("default config serializes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        config.validate().expect("default config should be valid");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
[train]
stage = "stage2"
bs = 4
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.train.stage, Stage::Distillation);
        assert_eq!(config.train.bs, 4);
        assert_eq!(config.train.n_class, 19);
        assert!((config.optim.lr - 1e-4).abs() < 1e-12);
    }

    #[test]
    fn test_validation_rejects_zero_intervals() {
        let mut config = AppConfig::default();
        config.train.print_interval = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.train.val_interval = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_batch() {
        let mut config = AppConfig::default();
        config.train.bs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stage1_requires_resume_path() {
        let mut config = AppConfig::default();
        config.train.stage = Stage::Stage1;
        assert!(config.validate().is_err());
        config.train.resume_path = Some(PathBuf::from("runs/warmup/best"));
        config.validate().expect("stage1 with resume path is valid");
    }

    #[test]
    fn test_stage1_file_completed_by_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stage1.toml");
        std::fs::write(&path, "[train]\nstage = \"stage1\"\n").unwrap();

        let mut config = AppConfig::load_or_default(&path).expect("stage1 file parses");
        assert_eq!(config.train.stage, Stage::Stage1);
        assert!(config.validate().is_err());

        config.train.resume_path = Some(PathBuf::from("runs/warmup/best"));
        config.validate().expect("override supplies resume path");
    }

    #[test]
    fn test_validation_rejects_non_positive_lr() {
        let mut config = AppConfig::default();
        config.optim.lr = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolve_paths() {
        let mut config = AppConfig::default();
        config.train.resume_path = Some(PathBuf::from("runs/a/best"));
        config.data.src_root = PathBuf::from("/abs/gta5");
        config.resolve_paths(Path::new("/work"));
        assert_eq!(config.train.logdir, PathBuf::from("/work/logs/default"));
        assert_eq!(
            config.train.resume_path,
            Some(PathBuf::from("/work/runs/a/best"))
        );
        assert_eq!(config.data.src_root, PathBuf::from("/abs/gta5"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adapt.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
[train]
stage = "warm_up"
val_interval = 50

[optim]
scheduler = "poly"
"#
        )
        .unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.train.stage, Stage::WarmUp);
        assert_eq!(config.train.val_interval, 50);
        assert_eq!(config.optim.scheduler, SchedulerKind::Poly);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = AppConfig::load_or_default(Path::new("nonexistent_adapt.toml")).unwrap();
        assert_eq!(config.train.print_interval, 20);
    }

    #[test]
    fn test_default_toml_roundtrips() {
        let toml_str = AppConfig::default_toml();
        let config: AppConfig = toml::from_str(&toml_str).unwrap();
        config.validate().expect("roundtripped config should be valid");
    }
}
