//! CLI entrypoint and composition root (§6). A single binary: `start` (the default) runs the
//! bridge, `migrate up|down` applies or reverts schema migrations, and `registration` writes the
//! application-service registration document the homeserver expects on its side.
//!
//! Settings load from the process environment, optionally layered under a `--config` TOML file
//! (file values first, environment wins) in the style of the `ChainSafe-forest` CLI's
//! config-file-under-env layering, generalized from its own `FOREST_CONFIG_PATH`/`--config` split.

use clap::{Parser, Subcommand};
use diesel::Connection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use fedbridge::{
    config::{AppState, Data, Settings},
    core::key_cache::KeyCache,
    db,
    inbox::{dedupe::DedupeSet, rate_limit::RateLimiter, server},
    logging,
    media::{MediaCache, DEFAULT_CACHE_CAPACITY_BYTES},
    queue::{circuit_breaker::CircuitBreakerRegistry, Queues, DEFAULT_WORKER_CONCURRENCY},
};
use std::{
    collections::HashMap,
    net::SocketAddr,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::{Arc, Weak},
    time::Duration,
};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");
const KEY_CACHE_CAPACITY: u64 = 10_000;
const DB_POOL_MIN_IDLE: u32 = 1;
const DB_POOL_MAX_SIZE: u32 = 10;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_ALLOWED_MIME_TYPES: &[&str] = &["image/*", "video/*", "audio/*"];

#[derive(Parser)]
#[command(
    name = "fedbridge",
    about = "Bidirectional gateway between a homeserver chat protocol and a federated activity protocol"
)]
struct Cli {
    /// TOML config file layered under the process environment (env vars win).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the bridge. The default when no subcommand is given.
    Start,
    /// Apply or revert database migrations.
    Migrate {
        #[command(subcommand)]
        direction: MigrateDirection,
    },
    /// Write the application-service registration document for the homeserver.
    Registration {
        #[arg(long, default_value = "registration.json")]
        output: PathBuf,
    },
}

#[derive(Subcommand)]
enum MigrateDirection {
    Up,
    Down,
}

/// Distinguishes a signal-initiated shutdown (exit 130) from every other fatal error (exit 1),
/// per §6's exit code table.
enum Shutdown {
    Interrupted,
    Fatal(anyhow::Error),
}

impl From<anyhow::Error> for Shutdown {
    fn from(error: anyhow::Error) -> Self {
        Shutdown::Fatal(error)
    }
}

impl From<fedbridge::error::Error> for Shutdown {
    fn from(error: fedbridge::error::Error) -> Self {
        Shutdown::Fatal(error.into())
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let settings = match load_settings(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(error) => {
            eprintln!("fedbridge: {error}");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("fedbridge: failed to start tokio runtime: {error}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(dispatch(cli.command.unwrap_or(Command::Start), settings)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(Shutdown::Interrupted) => ExitCode::from(130),
        Err(Shutdown::Fatal(error)) => {
            eprintln!("fedbridge: {error}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(command: Command, settings: Settings) -> Result<(), Shutdown> {
    match command {
        Command::Start => run_start(settings).await,
        Command::Migrate { direction } => {
            run_migrate(&settings, direction).map_err(Shutdown::from)
        }
        Command::Registration { output } => {
            write_registration(&settings, &output).map_err(Shutdown::from)
        }
    }
}

/// Loads settings from `--config` (if given) layered under the process environment, environment
/// values winning on key collision (§6 ambient CLI behavior).
fn load_settings(config_path: Option<&Path>) -> anyhow::Result<Settings> {
    let mut vars: HashMap<String, String> = match config_path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
            toml_to_env_map(&raw)?
        }
        None => HashMap::new(),
    };
    vars.extend(std::env::vars());
    Ok(Settings::from_env_iter(vars)?)
}

fn toml_to_env_map(raw: &str) -> anyhow::Result<HashMap<String, String>> {
    let table: toml::Table = raw.parse()?;
    Ok(table
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                toml::Value::String(s) => s,
                other => other.to_string(),
            };
            (key.to_uppercase(), value)
        })
        .collect())
}

async fn run_start(settings: Settings) -> Result<(), Shutdown> {
    logging::init(&settings.log_level, settings.log_format);
    tracing::info!(domain = %settings.local_domain, "starting fedbridge");

    run_embedded_migrations(&settings.database_url)?;

    let db_pool = db::build_pool(&settings.database_url, DB_POOL_MIN_IDLE, DB_POOL_MAX_SIZE)?;
    let client = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| Shutdown::Fatal(e.into()))?
        .into();
    let bind_addr: SocketAddr = settings
        .bind_addr
        .parse()
        .map_err(|e| Shutdown::Fatal(anyhow::anyhow!("invalid bind address {}: {e}", settings.bind_addr)))?;

    let key_cache = KeyCache::new(KEY_CACHE_CAPACITY);
    let dedupe = DedupeSet::new();
    let txn_dedupe = DedupeSet::new();
    let rate_limiter = RateLimiter::new(settings.rate_limit_per_min);
    let circuit_breakers = CircuitBreakerRegistry::default();
    let allowed_mime_types = DEFAULT_ALLOWED_MIME_TYPES.iter().map(|s| s.to_string()).collect();
    let media_cache = MediaCache::new(DEFAULT_CACHE_CAPACITY_BYTES, allowed_mime_types);

    // `Queues` needs a `Weak<AppState>` before `AppState` itself exists; `new_cyclic` hands us
    // that handle up front so workers can `upgrade()` it once construction finishes.
    let state = Arc::new_cyclic(|weak: &Weak<AppState>| {
        let queues = Queues::spawn_all(weak.clone(), DEFAULT_WORKER_CONCURRENCY);
        AppState {
            settings,
            client,
            db: db_pool,
            key_cache,
            dedupe,
            txn_dedupe,
            rate_limiter,
            circuit_breakers,
            media_cache,
            queues,
            request_timeout: REQUEST_TIMEOUT,
        }
    });
    let data = Data::new(state);

    server::spawn_rate_limiter_cleanup(data.clone());
    let app = server::router(data);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .map_err(|e| Shutdown::Fatal(e.into()))?;
    tracing::info!(%bind_addr, "listening");

    let serve = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>());
    tokio::select! {
        result = serve => result.map_err(|e| Shutdown::Fatal(e.into())),
        () = shutdown_signal() => Err(Shutdown::Interrupted),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

fn run_embedded_migrations(database_url: &str) -> Result<(), Shutdown> {
    let mut conn = diesel::PgConnection::establish(database_url)
        .map_err(|e| Shutdown::Fatal(anyhow::anyhow!("failed to connect to database: {e}")))?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| Shutdown::Fatal(anyhow::anyhow!("failed to run migrations: {e}")))?;
    Ok(())
}

fn run_migrate(settings: &Settings, direction: MigrateDirection) -> anyhow::Result<()> {
    let mut conn = diesel::PgConnection::establish(&settings.database_url)
        .map_err(|e| anyhow::anyhow!("failed to connect to database: {e}"))?;
    match direction {
        MigrateDirection::Up => {
            conn.run_pending_migrations(MIGRATIONS)
                .map_err(|e| anyhow::anyhow!("failed to run migrations: {e}"))?;
            println!("migrations applied");
        }
        MigrateDirection::Down => {
            conn.revert_last_migration(MIGRATIONS)
                .map_err(|e| anyhow::anyhow!("failed to revert migration: {e}"))?;
            println!("last migration reverted");
        }
    }
    Ok(())
}

/// Writes the JSON application-service registration document the homeserver loads to learn the
/// id/alias namespaces this bridge claims and the tokens it speaks with (§6).
fn write_registration(settings: &Settings, output: &Path) -> anyhow::Result<()> {
    let domain = &settings.local_domain;
    let document = serde_json::json!({
        "id": "fedbridge",
        "url": settings.fed_base_url.as_str(),
        "as_token": settings.appservice_token,
        "hs_token": settings.homeserver_token,
        "sender_localpart": "fedbridge",
        "namespaces": {
            "users": [{ "exclusive": true, "regex": format!("@_ap_.*:{domain}") }],
            "aliases": [{ "exclusive": true, "regex": format!("#_ap_.*:{domain}") }],
        },
        "rate_limited": false,
    });
    std::fs::write(output, serde_json::to_string_pretty(&document)?)
        .map_err(|e| anyhow::anyhow!("failed to write {}: {e}", output.display()))?;
    println!("wrote registration document to {}", output.display());
    Ok(())
}
