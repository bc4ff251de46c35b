//! Tracing/logging initialization.
//!
//! Output is JSON by default; `BATCH_LOG_FORMAT=pretty` switches to the
//! human-readable formatter. Filtering follows `RUST_LOG` (default `info`).

use tracing_subscriber::EnvFilter;

const FORMAT_VAR: &str = "BATCH_LOG_FORMAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    pub fn from_env() -> Self {
        Self::parse(std::env::var(FORMAT_VAR).ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("pretty") || v.eq_ignore_ascii_case("text") => {
                LogFormat::Pretty
            }
            _ => LogFormat::Json,
        }
    }
}

fn filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter("info"))
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_thread_names(true);

    let _ = match LogFormat::from_env() {
        LogFormat::Json => builder.json().with_target(false).try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
}

/// Compact output captured by the test harness, `debug` by default.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter("debug"))
        .with_test_writer()
        .compact()
        .try_init();
}
