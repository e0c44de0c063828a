//! Process-wide logging setup shared by the API binary and background workers.

pub mod logging;

pub use logging::LogFormat;

/// Initialize tracing from `RUST_LOG` and `LOG_FORMAT`.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    let format = std::env::var("LOG_FORMAT")
        .ok()
        .map(|raw| LogFormat::parse(&raw))
        .unwrap_or_default();
    logging::init(format);
}
