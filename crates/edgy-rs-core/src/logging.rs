//! Logging integration for edgy-rs.
//!
//! Provides [`setup_logging`] for installing a [`tracing`] subscriber from
//! [`Settings`](crate::settings::Settings) and span helpers used by the query
//! engine so every statement is attributable to a model and an operation.

use crate::settings::Settings;

/// Sets up the global tracing subscriber based on the given settings.
///
/// The filter is read from `settings.log_level`. In debug mode a pretty,
/// human-readable format is used; otherwise a structured JSON format is used.
/// Installing a second subscriber is a silent no-op.
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

/// Creates a span for one queryset operation.
///
/// # Examples
///
/// ```
/// use edgy_rs_core::logging::query_span;
///
/// let span = query_span("Track", "count");
/// let _guard = span.enter();
/// tracing::debug!("compiling");
/// ```
pub fn query_span(model: &str, operation: &'static str) -> tracing::Span {
    tracing::debug_span!("query", model = model, op = operation)
}

/// Creates a span for a transaction scope at the given nesting depth.
pub fn transaction_span(depth: u32, force_rollback: bool) -> tracing::Span {
    tracing::debug_span!("transaction", depth = depth, force_rollback = force_rollback)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_logging_twice_is_harmless() {
        let settings = Settings {
            log_level: "not a valid filter [[".to_string(),
            ..Settings::default()
        };
        setup_logging(&settings);
        setup_logging(&Settings::default());
    }

    #[test]
    fn test_spans_can_be_entered() {
        let span = query_span("Album", "all");
        let _guard = span.enter();
        let inner = transaction_span(2, true);
        let _inner_guard = inner.enter();
    }
}
