mod manager;
mod metadata;

pub use manager::{
    load_checkpoint_objective_vectors, load_metadata, CheckpointManager, CheckpointManagerConfig,
};
pub use metadata::{CheckpointKind, CheckpointMetadata};
