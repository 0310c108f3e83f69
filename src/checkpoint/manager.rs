use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use burn::tensor::backend::Backend;

use crate::checkpoint::metadata::{CheckpointKind, CheckpointMetadata};
use crate::config::TrainOptions;
use crate::error::CheckpointError;
use crate::model::AdaptationModel;
use crate::prototypes::Prototypes;
use crate::stage::Stage;

const METADATA_FILE: &str = "metadata.json";
const OBJECTIVE_VECTORS_FILE: &str = "objective_vectors.json";

/// Where checkpoint records go and how they are named.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CheckpointManagerConfig {
    pub logdir: PathBuf,
    pub src_dataset: String,
    pub tgt_dataset: String,
    pub model_name: String,
    pub stage: Stage,
}

impl From<&TrainOptions> for CheckpointManagerConfig {
    fn from(options: &TrainOptions) -> Self {
        CheckpointManagerConfig {
            logdir: options.logdir.clone(),
            src_dataset: options.src_dataset.clone(),
            tgt_dataset: options.tgt_dataset.clone(),
            model_name: options.model_name.clone(),
            stage: options.stage,
        }
    }
}

/// Writes the "current" and "best" checkpoint records of a run.
///
/// Each record is a directory; it is assembled in a `.tmp` sibling and
/// renamed over the previous record, so a crash mid-write leaves the old
/// record intact.
pub struct CheckpointManager {
    config: CheckpointManagerConfig,
}

impl CheckpointManager {
    pub fn new(config: CheckpointManagerConfig) -> Self {
        CheckpointManager { config }
    }

    /// `<logdir>/from_<src>_to_<tgt>_on_<model>_<kind>_model`.
    pub fn record_dir(&self, kind: CheckpointKind) -> PathBuf {
        self.config.logdir.join(format!(
            "from_{}_to_{}_on_{}_{}",
            self.config.src_dataset,
            self.config.tgt_dataset,
            self.config.model_name,
            kind.suffix()
        ))
    }

    pub fn save<B: Backend, M: AdaptationModel<B> + ?Sized>(
        &self,
        model: &M,
        kind: CheckpointKind,
        iter: usize,
        best_iou: f64,
    ) -> Result<PathBuf, CheckpointError> {
        let final_dir = self.record_dir(kind);
        let mut tmp_name = final_dir.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_dir = PathBuf::from(tmp_name);

        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir)?;
        }
        fs::create_dir_all(&tmp_dir)?;

        let networks = model.save_networks(&tmp_dir, kind.includes_training_state())?;

        let protos = model.objective_vectors();
        if let Some(p) = protos {
            p.save(&tmp_dir.join(OBJECTIVE_VECTORS_FILE))?;
        }

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let metadata = CheckpointMetadata {
            kind,
            stage: self.config.stage,
            iter,
            best_iou: Some(best_iou).filter(|v| v.is_finite()),
            networks,
            has_objective_vectors: protos.is_some(),
            timestamp,
        };
        fs::write(
            tmp_dir.join(METADATA_FILE),
            serde_json::to_string_pretty(&metadata)?,
        )?;

        if final_dir.exists() {
            fs::remove_dir_all(&final_dir)?;
        }
        fs::rename(&tmp_dir, &final_dir)?;

        log::debug!("Wrote {:?} checkpoint to {}", kind, final_dir.display());
        Ok(final_dir)
    }
}

pub fn load_metadata(dir: &Path) -> Result<CheckpointMetadata, CheckpointError> {
    if !dir.is_dir() {
        return Err(CheckpointError::DirNotFound(dir.to_path_buf()));
    }
    let meta_path = dir.join(METADATA_FILE);
    let meta_json = fs::read_to_string(&meta_path).map_err(|e| CheckpointError::MetadataRead {
        path: meta_path.clone(),
        source: e,
    })?;
    serde_json::from_str(&meta_json).map_err(|e| CheckpointError::MetadataParse {
        path: meta_path,
        source: e,
    })
}

/// Objective vectors stored in a checkpoint record, if it has any.
pub fn load_checkpoint_objective_vectors(dir: &Path) -> Result<Option<Prototypes>, CheckpointError> {
    let path = dir.join(OBJECTIVE_VECTORS_FILE);
    if !path.exists() {
        return Ok(None);
    }
    Ok(Some(Prototypes::load(&path)?))
}
