//! llm-gateway -- multi-user LLM gateway with an OpenAI-compatible API.
//!
//! This is the application entry point. It wires together all modules:
//!   - Configuration loading
//!   - Database initialization
//!   - Admin user bootstrapping
//!   - Model registry and upstream transport
//!   - Usage accounting worker
//!   - HTTP server
//!   - Registry reload on SIGHUP and graceful shutdown on SIGTERM / SIGINT

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use llm_gateway::AppState;
use llm_gateway::accounting::{UsageAccountant, spawn_usage_worker};
use llm_gateway::api;
use llm_gateway::auth::users::bootstrap_admin;
use llm_gateway::config::{CONFIG_ENV, Config};
use llm_gateway::db::Database;
use llm_gateway::providers::{HttpTransport, ModelRegistry};

/// How long shutdown waits for the usage worker to drain.
const ACCOUNTING_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// CLI argument parsing (minimal, no clap dependency)
// ---------------------------------------------------------------------------

struct CliArgs {
    config_path: Option<PathBuf>,
}

fn parse_args() -> CliArgs {
    let mut args = std::env::args().skip(1);
    let mut config_path = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                if let Some(path) = args.next() {
                    config_path = Some(PathBuf::from(path));
                } else {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("llm-gateway {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                eprintln!("Run with --help for usage information.");
                std::process::exit(1);
            }
        }
    }

    CliArgs { config_path }
}

fn print_usage() {
    println!(
        "\
llm-gateway {version} -- OpenAI-compatible LLM gateway

USAGE:
    llm-gateway [OPTIONS]

OPTIONS:
    -c, --config <PATH>    Path to configuration file [default: llm-gateway.toml]
    -h, --help             Print this help message
    -V, --version          Print version information

ENVIRONMENT:
    RUST_LOG               Override log level (e.g. RUST_LOG=debug)
    {config_env}     Alternative to --config flag

SIGNALS:
    SIGHUP                 Reload the model registry from the config file
",
        version = env!("CARGO_PKG_VERSION"),
        config_env = CONFIG_ENV,
    );
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Parse CLI arguments
    let cli = parse_args();
    let config_path = Config::resolve_path(cli.config_path);

    // 2. Load configuration
    let config = Config::load(&config_path)?;

    // 3. Initialize tracing/logging
    init_tracing(&config);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        overrides = ?config.env_overrides,
        "Starting llm-gateway"
    );

    // 4. Open database
    let db = Database::open(&config.database.path)?;
    tracing::info!(path = %config.database.path.display(), "Database opened");

    // 5. Bootstrap admin user (creates admin + prints API key on first run)
    match bootstrap_admin(&db, &config.auth.default_admin_name) {
        Ok(Some(result)) => {
            tracing::info!(admin = %result.user.name, "Admin user bootstrapped (first run)");
        }
        Ok(None) => {
            tracing::debug!("Admin bootstrap skipped (users already exist)");
        }
        Err(err) => {
            tracing::error!(error = %err, "Failed to bootstrap admin user");
            return Err(err.into());
        }
    }

    // 6. Model registry and upstream transport
    let registry = Arc::new(ModelRegistry::from_config(&config)?);
    let models = registry.snapshot().len();
    if models == 0 {
        tracing::warn!("No models are routable; check [[models]] and provider credentials");
    }
    tracing::info!(models, generation = registry.generation(), "Model registry loaded");

    let transport = Arc::new(HttpTransport::new(&config.upstream)?);

    // 7. Usage accounting: channel + background worker
    let (accountant, usage_rx) = UsageAccountant::channel();
    let worker = spawn_usage_worker(Arc::new(db.clone()), usage_rx, &config.accounting);
    tracing::debug!("Usage worker spawned");

    // 8. Build shared application state
    let listen_addr = config.listen_addr();
    let state = AppState::new(
        config,
        config_path.clone(),
        db,
        Arc::clone(&registry),
        transport,
        accountant,
    );

    // 9. Reload the registry on SIGHUP
    spawn_reload_on_hangup(Arc::clone(&registry), config_path);

    // 10. Build the router, bind and serve
    let app = build_app(state);
    let listener = TcpListener::bind(&listen_addr).await?;
    tracing::info!(addr = %listen_addr, "Listening");

    println!();
    println!("  llm-gateway v{} is running", env!("CARGO_PKG_VERSION"));
    println!("  API:    http://{listen_addr}/v1/");
    println!("  Health: http://{listen_addr}/health");
    println!();

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 11. Cleanup: the server and its state are gone, so every accountant
    // has been dropped and the worker drains and exits.
    tracing::info!("Shutting down gracefully");
    match tokio::time::timeout(ACCOUNTING_DRAIN_TIMEOUT, worker).await {
        Ok(Ok(())) => tracing::info!("Usage records flushed"),
        Ok(Err(e)) => tracing::error!(error = %e, "Usage worker failed"),
        Err(_) => tracing::error!("Timed out waiting for usage records to flush"),
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

fn build_app(state: AppState) -> Router {
    let cors = build_cors_layer(&state.config);

    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();
    let trace = TraceLayer::new_for_http();

    api::build_api_router(state.clone())
        // Global middleware stack (applied to all routes)
        .layer(propagate_id)
        .layer(request_id)
        .layer(trace)
        .layer(cors)
        .with_state(state)
}

/// Build the CORS layer from config.
fn build_cors_layer(config: &Config) -> CorsLayer {
    if config.server.cors_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = config
            .server
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

// ---------------------------------------------------------------------------
// Tracing initialization
// ---------------------------------------------------------------------------

/// Set up the tracing subscriber based on configuration.
fn init_tracing(config: &Config) {
    // RUST_LOG env var takes precedence over config file
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = &config.logging.level;
        EnvFilter::new(format!("llm_gateway={level},tower_http={level},warn"))
    });

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if config.logging.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

#[cfg(unix)]
fn spawn_reload_on_hangup(registry: Arc<ModelRegistry>, config_path: PathBuf) {
    let mut hangup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install SIGHUP handler; reload via /admin/reload only");
            return;
        }
    };
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            tracing::info!("Received SIGHUP, reloading model registry");
            if let Err(e) = registry.reload_from_path(&config_path) {
                tracing::error!(error = %e, "Registry reload failed; keeping current table");
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_on_hangup(_registry: Arc<ModelRegistry>, _config_path: PathBuf) {}

/// Wait for a shutdown signal (SIGTERM or SIGINT / Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl+C)");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_print_usage_does_not_panic() {
        print_usage();
    }

    #[test]
    fn test_build_cors_layer_empty_origins() {
        let config = Config::default();
        let _cors = build_cors_layer(&config);
    }

    #[test]
    fn test_build_cors_layer_with_origins() {
        let mut config = Config::default();
        config.server.cors_origins = vec!["http://localhost:3000".to_string()];
        let _cors = build_cors_layer(&config);
    }
}
