//! # seg-adapt
//!
//! Multi-stage unsupervised domain adaptation for semantic segmentation,
//! built on the Burn ML framework. A run trains one stage:
//! adversarial warm-up, prototype self-training (`stage1`), or distillation,
//! validating on the target domain and keeping "current" and "best"
//! checkpoints.
//!
//! ## Modules
//!
//! - [`config`] — TOML configuration loading and validation
//! - [`data`] — batch records, folder loaders, augmentation
//! - [`model`] — model interface, networks, losses, LR schedules
//! - [`prototypes`] — per-class objective vectors
//! - [`training`] — driver, validation, metrics, session state
//! - [`checkpoint`] — current/best checkpoint records
//! - [`stage`] — training stages and their loss records
//! - [`logging`] — `env_logger` setup with a run log file
//! - [`error`] — Structured error types

#![recursion_limit = "256"]

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod logging;
pub mod model;
pub mod prototypes;
pub mod stage;
pub mod training;
