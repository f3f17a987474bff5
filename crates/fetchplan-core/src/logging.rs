//! Logging integration for fetchplan.
//!
//! Provides helpers for configuring [`tracing`]-based logging from
//! [`Settings`](crate::settings::Settings) and for creating per-query spans.

use crate::settings::Settings;

/// Sets up the global tracing subscriber based on the given settings.
///
/// The log level is read from `settings.log_level`. In debug mode a pretty,
/// human-readable format is used; otherwise a structured JSON format is used.
/// Installing a second subscriber is silently ignored.
pub fn setup_logging(settings: &Settings) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&settings.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if settings.debug {
        fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(true)
            .with_line_number(true)
            .pretty()
            .try_init()
            .ok();
    } else {
        fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .json()
            .try_init()
            .ok();
    }
}

/// Creates a tracing span for one optimized query.
///
/// Every log entry emitted while the query is rewritten, executed and
/// observed carries the call-site location and model label.
///
/// # Examples
///
/// ```
/// use fetchplan_core::logging::query_span;
///
/// let span = query_span("reports/views/list_reports", "reports.Report");
/// let _guard = span.enter();
/// tracing::debug!("rewriting");
/// ```
pub fn query_span(location: &str, model: &str) -> tracing::Span {
    tracing::info_span!("optimized_query", location = location, model = model)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_logging_twice_is_harmless() {
        let settings = Settings {
            log_level: "not a [valid directive".into(),
            ..Settings::default()
        };
        setup_logging(&settings);
        setup_logging(&settings);
    }

    #[test]
    fn test_query_span_enter() {
        let span = query_span("app/views/index", "app.Item");
        let _guard = span.enter();
        tracing::debug!("inside span");
    }
}
