//! Tracing initialisation.
//!
//! Colored human output for development, JSON lines when `LOG_FORMAT=json`.
//! Logs go to stderr so stdout stays machine-readable.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Output format of the log layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    /// Read `LOG_FORMAT`; anything but `json` means pretty.
    pub fn from_env() -> Self {
        Self::parse(std::env::var("LOG_FORMAT").ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_lowercase()) {
            Some(v) if v == "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

/// Default directives applied on top of `RUST_LOG`.
const DEFAULT_DIRECTIVES: &[&str] = &["vplay=info", "vplay_media=info", "vplay_cli=info"];

/// Install the global subscriber.
pub fn init_tracing(format: LogFormat) {
    let mut env_filter = EnvFilter::from_default_env();
    for directive in DEFAULT_DIRECTIVES {
        if let Ok(directive) = directive.parse() {
            env_filter = env_filter.add_directive(directive);
        }
    }

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .with(env_filter)
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_ansi(true)
                        .with_target(true)
                        .with_thread_ids(false)
                        .with_file(false)
                        .with_line_number(false),
                )
                .with(env_filter)
                .init();
        }
    }
}
