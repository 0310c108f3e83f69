use std::path::PathBuf;

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint directory not found: {0}")]
    DirNotFound(PathBuf),

    #[error("failed to read metadata from {path}: {source}")]
    MetadataRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse metadata from {path}: {source}")]
    MetadataParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to save networks: {0}")]
    Model(#[from] ModelError),

    #[error("objective vectors: {0}")]
    Prototypes(#[from] PrototypeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by an adaptation model while stepping, saving or loading.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("self-training step requires objective vectors, none are loaded")]
    MissingObjectiveVectors,

    #[error("objective vectors have {got} feature channels, network produces {expected}")]
    ObjectiveVectorShape { expected: usize, got: usize },

    #[error("objective vectors cover {got} classes, network predicts {expected}")]
    ObjectiveVectorClasses { expected: usize, got: usize },

    #[error("failed to save {name}: {reason}")]
    Save { name: String, reason: String },

    #[error("failed to load {name}: {reason}")]
    Load { name: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur while reading or assembling batches.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("batch record has no '{0}' field")]
    MissingField(&'static str),

    #[error("batch field '{field}' has the wrong kind (expected {expected})")]
    FieldKind {
        field: &'static str,
        expected: &'static str,
    },

    #[error("dataset directory not found: {0}")]
    DirNotFound(PathBuf),

    #[error("no images found under {0}")]
    Empty(PathBuf),

    #[error("loader has no batches")]
    EmptyLoader,

    #[error("no label found for image {0}")]
    MissingLabel(PathBuf),

    #[error("batch index {index} out of range ({len} batches)")]
    BatchOutOfRange { index: usize, len: usize },

    #[error("failed to decode image {path}: {source}")]
    Image {
        path: PathBuf,
        source: image::ImageError,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while loading or writing prototype files.
#[derive(Debug, thiserror::Error)]
pub enum PrototypeError {
    #[error("prototype file not found: {0}")]
    NotFound(PathBuf),

    #[error("stage1 needs a resume_path to locate prototypes")]
    NoResumePath,

    #[error("failed to read prototypes from {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse prototypes from {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("prototype values length {len} does not match {n_class} x {feat_dim}")]
    Shape {
        len: usize,
        n_class: usize,
        feat_dim: usize,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur during training.
#[derive(Debug, thiserror::Error)]
pub enum TrainingError {
    #[error("target training loader is empty")]
    EmptyTargetLoader,

    #[error("prototype error: {0}")]
    Prototypes(#[from] PrototypeError),

    #[error("data error: {0}")]
    Data(#[from] DataError),

    #[error("model error: {0}")]
    Model(#[from] ModelError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("config validation error: {0}")]
    Validation(String),
}
