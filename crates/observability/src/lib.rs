//! Tracing and logging setup shared by the storefront binaries.

/// Initialize process-wide logging with the defaults.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    logging::init(&logging::LogConfig::default());
}

/// Subscriber configuration (filters, formatting).
pub mod logging;
