//! Tracing subscriber setup.
//!
//! `RUST_LOG` overrides the filter. `PAGED_KV_LOG_MORE=1` switches to the
//! detailed format with file, line, and thread of every event.

use tracing_subscriber::EnvFilter;

/// Environment variable selecting the detailed log format.
pub const LOG_MORE_ENV: &str = "PAGED_KV_LOG_MORE";

/// Default filter directive for the given verbosity.
pub fn default_filter(verbose: bool) -> &'static str {
    if verbose {
        "paged_kv_cache=debug,tower_http=debug"
    } else {
        "paged_kv_cache=info,tower_http=info"
    }
}

/// Whether `value` (the content of [`LOG_MORE_ENV`]) asks for detailed logs.
pub fn log_more_enabled(value: Option<&str>) -> bool {
    value.map(str::trim) == Some("1")
}

/// Install the global subscriber. Call once, at startup.
pub fn init(verbose: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(verbose).into());
    let log_more = log_more_enabled(std::env::var(LOG_MORE_ENV).ok().as_deref());

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if log_more {
        builder
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .init();
    } else {
        builder.compact().init();
    }
}
