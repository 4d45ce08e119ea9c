//! Bridge configuration: environment loading (§6) plus the request-scoped [`Data`] handle that
//! every component receives, split the same way `FederationConfig<T>`/`Data<T>` usually is.
//!
//! ```
//! # use fedbridge::config::Settings;
//! let settings = Settings::from_env_iter([
//!     ("HOMESERVER_URL", "https://matrix.example.com"),
//!     ("HOMESERVER_TOKEN", "hs_tok"),
//!     ("APPSERVICE_TOKEN", "as_tok"),
//!     ("LOCAL_DOMAIN", "example.com"),
//!     ("FED_BASE_URL", "https://fed.example.com"),
//!     ("DATABASE_URL", "postgres://localhost/fedbridge"),
//!     ("ENCRYPTION_KEY", &"ab".repeat(32)),
//! ]).unwrap();
//! assert_eq!(settings.local_domain, "example.com");
//! ```

use crate::{db::DbPool, error::Error};
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use url::Url;

/// Raw environment-variable shape, deserialized with `envy`. Field names map to the
/// `SCREAMING_SNAKE_CASE` environment variables documented in spec.md §6.
#[derive(Debug, Deserialize)]
struct RawSettings {
    homeserver_url: String,
    homeserver_token: String,
    appservice_token: String,
    local_domain: String,
    fed_base_url: String,
    database_url: String,
    #[serde(default)]
    queue_broker_url: Option<String>,
    encryption_key: String,
    #[serde(default)]
    blocked_instances: Option<String>,
    #[serde(default = "default_rate_limit_per_min")]
    rate_limit_per_min: u32,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default)]
    log_format: String,
    #[serde(default)]
    admin_room_chat_id: Option<String>,
    #[serde(default = "default_bind_addr")]
    bind_addr: String,
    #[serde(default = "default_auto_accept_follows")]
    auto_accept_follows: bool,
    #[serde(default)]
    debug: bool,
}

fn default_auto_accept_follows() -> bool {
    true
}

fn default_rate_limit_per_min() -> u32 {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

/// Validated, process-wide bridge settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Base URL of the homeserver's client/application-service API.
    pub homeserver_url: Url,
    /// Bearer token the homeserver uses to authenticate callbacks to us (`hs_token`).
    pub homeserver_token: String,
    /// Bearer token we use to authenticate requests to the homeserver (`as_token`).
    pub appservice_token: String,
    /// Domain of the chat homeserver, used to build ghost ids (`@_ap_user_host:local_domain`).
    pub local_domain: String,
    /// Base URL under which fed actors/objects/activities are minted.
    pub fed_base_url: Url,
    /// Postgres connection string.
    pub database_url: String,
    /// Durable queue broker URL, if any (unused by the in-process worker pool, kept for ops
    /// parity with the wire contract in spec.md §6).
    pub queue_broker_url: Option<String>,
    /// 32-byte key used to encrypt stored chat access tokens at rest.
    pub encryption_key: [u8; 32],
    /// Instance hostnames blocked admin-wide at startup (seeds the block table).
    pub blocked_instances: Vec<String>,
    /// Default per-remote-host inbox rate limit (requests/minute).
    pub rate_limit_per_min: u32,
    /// `tracing-subscriber` env-filter directive.
    pub log_level: String,
    /// `text` or `json`.
    pub log_format: crate::logging::LogFormat,
    /// Auto-accept inbound `Follow` activities. Configurable via `AUTO_ACCEPT_FOLLOWS`, defaults
    /// to `true` (Open Question #1 in DESIGN.md).
    pub auto_accept_follows: bool,
    /// Allow plain-HTTP webfinger resolution against `DEBUG`-enabled deployments (local/test
    /// homeservers without TLS). Defaults to `false`.
    pub debug: bool,
    /// Chat room id that incoming `Flag` reports are forwarded to, if configured (§4.8).
    pub admin_room_chat_id: Option<String>,
    /// Socket address the inbox server binds to. Not named by spec.md §6; defaults to
    /// `0.0.0.0:8000` (DESIGN.md Open Question).
    pub bind_addr: String,
}

impl Settings {
    /// Loads settings from the process environment.
    pub fn from_env() -> Result<Self, Error> {
        let raw: RawSettings = envy::from_env()
            .map_err(|e| Error::Configuration(format!("missing or invalid env var: {e}")))?;
        Self::from_raw(raw)
    }

    /// Test helper: load settings from an explicit iterator of key/value pairs instead of the
    /// real process environment.
    #[doc(hidden)]
    pub fn from_env_iter<I, K, V>(vars: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let raw: RawSettings = envy::from_iter(
            vars.into_iter()
                .map(|(k, v)| (k.as_ref().to_string(), v.as_ref().to_string())),
        )
        .map_err(|e| Error::Configuration(format!("missing or invalid env var: {e}")))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawSettings) -> Result<Self, Error> {
        let homeserver_url = Url::parse(&raw.homeserver_url)
            .map_err(|e| Error::Configuration(format!("HOMESERVER_URL: {e}")))?;
        let fed_base_url = Url::parse(&raw.fed_base_url)
            .map_err(|e| Error::Configuration(format!("FED_BASE_URL: {e}")))?;
        let key_bytes = hex::decode(&raw.encryption_key)
            .map_err(|e| Error::Configuration(format!("ENCRYPTION_KEY must be hex: {e}")))?;
        let encryption_key: [u8; 32] = key_bytes
            .try_into()
            .map_err(|_| Error::Configuration("ENCRYPTION_KEY must be 32 bytes".to_string()))?;
        let blocked_instances = raw
            .blocked_instances
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        let log_format = match raw.log_format.as_str() {
            "json" => crate::logging::LogFormat::Json,
            _ => crate::logging::LogFormat::Text,
        };

        Ok(Settings {
            homeserver_url,
            homeserver_token: raw.homeserver_token,
            appservice_token: raw.appservice_token,
            local_domain: raw.local_domain,
            fed_base_url,
            database_url: raw.database_url,
            queue_broker_url: raw.queue_broker_url,
            encryption_key,
            blocked_instances,
            rate_limit_per_min: raw.rate_limit_per_min,
            log_level: raw.log_level,
            log_format,
            auto_accept_follows: raw.auto_accept_follows,
            debug: raw.debug,
            admin_room_chat_id: raw.admin_room_chat_id,
            bind_addr: raw.bind_addr,
        })
    }

    /// True if `url` refers to this bridge's own fed domain.
    pub fn is_local_fed_url(&self, url: &Url) -> bool {
        url.domain() == self.fed_base_url.domain()
    }
}

/// Process-wide application state shared across all request handlers and queue workers.
///
/// Built once at startup, cheap to clone (an `Arc` internally), and handed out per-request as
/// [`Data`].
pub struct AppState {
    /// Validated settings.
    pub settings: Settings,
    /// Shared HTTP client with retry/tracing middleware.
    pub client: ClientWithMiddleware,
    /// Database connection pool.
    pub db: DbPool,
    /// Public-key cache (§4.2).
    pub key_cache: crate::core::key_cache::KeyCache,
    /// Processed-activity fingerprint set (§4.5).
    pub dedupe: crate::inbox::dedupe::DedupeSet,
    /// Processed-transaction fingerprint set, reusing the same bounded TTL cache shape (§4.9).
    pub txn_dedupe: crate::inbox::dedupe::DedupeSet,
    /// Per-host inbound rate limiter (§4.5).
    pub rate_limiter: crate::inbox::rate_limit::RateLimiter,
    /// Per-host circuit breaker (§4.6).
    pub circuit_breakers: crate::queue::circuit_breaker::CircuitBreakerRegistry,
    /// Media byte-capped LRU cache (§4.3).
    pub media_cache: crate::media::MediaCache,
    /// Handles to the three durable queues (§4.6).
    pub queues: crate::queue::Queues,
    /// Timeout applied to every outbound HTTP request (§5).
    pub request_timeout: Duration,
}

/// Cheaply-cloneable handle to [`AppState`], passed to every handler and worker task.
///
/// A per-request capability object threaded explicitly rather than through globals (§9).
#[derive(Clone)]
pub struct Data(pub Arc<AppState>);

impl std::ops::Deref for Data {
    type Target = AppState;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Data {
    /// Wraps an [`AppState`] for handing out to request handlers.
    pub fn new(state: Arc<AppState>) -> Self {
        Data(state)
    }
}
