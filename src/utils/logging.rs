//! Tracing subscriber setup.
//!
//! Log level comes from `RUST_LOG` (default `info`). Output format comes from
//! `TREESYNC_LOG_FORMAT`: `json` for aggregation pipelines, `compact` for
//! terse terminals, anything else for the human-readable default.

use tracing_subscriber::{fmt, EnvFilter};

/// Output format for log events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, one event per block.
    #[default]
    Pretty,
    /// Flattened JSON with span context, for log aggregation.
    Json,
    /// Terse single-line output.
    Compact,
}

impl LogFormat {
    /// Format selected by `TREESYNC_LOG_FORMAT`.
    pub fn from_env() -> Self {
        match std::env::var("TREESYNC_LOG_FORMAT").as_deref() {
            Ok(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            Ok(v) if v.eq_ignore_ascii_case("compact") => LogFormat::Compact,
            _ => LogFormat::Pretty,
        }
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber with the given format. Panics if a
/// subscriber is already installed; call once at process start.
pub fn init_logging_with_format(format: LogFormat) {
    match format {
        LogFormat::Pretty => fmt()
            .with_env_filter(env_filter())
            .with_target(true)
            .init(),
        LogFormat::Json => fmt()
            .with_env_filter(env_filter())
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .flatten_event(true)
            .init(),
        LogFormat::Compact => fmt()
            .with_env_filter(env_filter())
            .compact()
            .with_target(false)
            .init(),
    }
}

/// Install the global subscriber in the default pretty format.
pub fn init_logging() {
    init_logging_with_format(LogFormat::Pretty);
}

/// Install the global subscriber with everything read from the environment.
pub fn init_logging_from_env() {
    init_logging_with_format(LogFormat::from_env());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_selection_is_case_insensitive() {
        std::env::set_var("TREESYNC_LOG_FORMAT", "JSON");
        assert_eq!(LogFormat::from_env(), LogFormat::Json);
        std::env::set_var("TREESYNC_LOG_FORMAT", "compact");
        assert_eq!(LogFormat::from_env(), LogFormat::Compact);
        std::env::set_var("TREESYNC_LOG_FORMAT", "fancy");
        assert_eq!(LogFormat::from_env(), LogFormat::Pretty);
        std::env::remove_var("TREESYNC_LOG_FORMAT");
    }
}
