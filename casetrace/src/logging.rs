//! Diagnostic tracing for sessions and the `casetrace` CLI.
//!
//! Diagnostics go to stderr and are never part of what is reported to the
//! remote service. The session report (`io/session_report`) is the durable
//! artifact and does not depend on the log filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when neither `CASETRACE_LOG` nor `RUST_LOG` is set.
pub const DEFAULT_FILTER: &str = "casetrace=info,warn";

/// Filter directive from `lookup`: `CASETRACE_LOG` wins over `RUST_LOG`.
pub fn filter_directive<F>(lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    ["CASETRACE_LOG", "RUST_LOG"]
        .iter()
        .find_map(|key| lookup(key).filter(|value| !value.trim().is_empty()))
        .unwrap_or_else(|| DEFAULT_FILTER.to_string())
}

/// Install the stderr subscriber.
///
/// Returns false when a global subscriber is already installed, e.g. when a
/// host test harness set up its own.
///
/// ```bash
/// CASETRACE_LOG=casetrace::report_sync=debug casetrace summary
/// ```
pub fn init() -> bool {
    let directive = filter_directive(|key| std::env::var(key).ok());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_variable_wins_over_rust_log() {
        let directive = filter_directive(|key| match key {
            "CASETRACE_LOG" => Some("casetrace=debug".to_string()),
            "RUST_LOG" => Some("trace".to_string()),
            _ => None,
        });
        assert_eq!(directive, "casetrace=debug");
    }

    #[test]
    fn blank_values_fall_back_to_default() {
        let directive = filter_directive(|key| (key == "CASETRACE_LOG").then(|| " ".to_string()));
        assert_eq!(directive, DEFAULT_FILTER);
        assert_eq!(filter_directive(|_| None), DEFAULT_FILTER);
    }
}
