use std::env;

use sentry::integrations::tracing::EventFilter;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, Logging};

fn get_rust_log(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::OFF => "",
        LevelFilter::ERROR => "ERROR",
        LevelFilter::WARN => "WARN",
        LevelFilter::INFO => "INFO",
        LevelFilter::DEBUG => "INFO,refetch_cache=DEBUG",
        LevelFilter::TRACE => "INFO,refetch_cache=TRACE",
    }
}

/// Initializes logging for the cache.
///
/// This considers the `RUST_LOG` environment variable and defaults it to the level specified in the
/// configuration. Errors are also reported to sentry as events, `INFO` and `WARN` as breadcrumbs.
pub fn init_logging(config: &Logging) -> Result<(), TryInitError> {
    let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| get_rust_log(config.level).to_string());

    let layer = tracing_subscriber::fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true);

    let fmt_layer = match (config.format, console::user_attended()) {
        (LogFormat::Auto, true) | (LogFormat::Pretty, _) => layer.pretty().boxed(),
        (LogFormat::Auto, false) | (LogFormat::Simplified, _) => {
            layer.compact().with_ansi(false).boxed()
        }
        (LogFormat::Json, _) => layer
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
    }
    .with_filter(EnvFilter::new(&rust_log));

    let sentry_layer =
        sentry::integrations::tracing::layer().event_filter(|md| match *md.level() {
            tracing::Level::ERROR => EventFilter::Event,
            tracing::Level::WARN | tracing::Level::INFO => EventFilter::Breadcrumb,
            tracing::Level::DEBUG | tracing::Level::TRACE => EventFilter::Ignore,
        });

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(sentry_layer)
        .try_init()
}
