//! tracing-subscriber initialization. Format and level are configured entirely from the
//! environment (§6); there is no code-level knob beyond what `Settings` exposes.

use tracing_subscriber::{fmt, EnvFilter};

/// Text or structured JSON log output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, for local development.
    Text,
    /// Newline-delimited JSON, for log aggregation.
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Text
    }
}

/// Initializes the global tracing subscriber. Call once at process startup.
pub fn init(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }
}
