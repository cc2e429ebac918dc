//! Tracing and logging setup shared by the binaries.

pub mod tracing;

pub use tracing::{LogConfig, LogFormat};

/// Initialize process-wide logging from `config`.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init(config: &LogConfig) {
    tracing::init(config);
}
