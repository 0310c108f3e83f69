//! Training loop: session counters, the stage driver, validation with
//! checkpointing, confusion-matrix metrics, and progress events.

pub mod events;
pub mod metrics;
pub mod session;
pub mod trainer;
pub mod validation;

pub use session::TrainingSession;
pub use trainer::Trainer;
