//! Infrastructure layer: job storage, queueing, the pipeline and configuration.

pub mod config;
pub mod jobs;

pub use config::{AppConfig, ConfigError};
