//! Tracing and logging setup shared by binaries and integration tests.

/// Initialize process-wide logging with the defaults (JSON, `info`).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

pub mod tracing;

pub use self::tracing::{LogConfig, LogFormat, init_with};
