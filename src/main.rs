//! llm-gateway: virtual-key LLM gateway.
//!
//! Startup order:
//!   - Configuration loading
//!   - Usage file preparation
//!   - Audit logger
//!   - HTTP server with graceful shutdown on SIGTERM / SIGINT

use std::path::PathBuf;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use llm_gateway::AppState;
use llm_gateway::api;
use llm_gateway::config::Config;
use llm_gateway::usage::{AuditSink, spawn_audit_logger};

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
llm-gateway {version} -- Virtual-key LLM gateway

USAGE:
    llm-gateway [OPTIONS]

OPTIONS:
    -c, --config <PATH>    Path to configuration file [default: llm-gateway.toml]
    -h, --help             Print this help message
    -V, --version          Print version information

ENVIRONMENT:
    RUST_LOG               Override log filter (e.g. RUST_LOG=debug)
    LLMGW_CONFIG           Alternative to --config flag
    LLMGW_*                Per-setting overrides (see README)
",
        version = env!("CARGO_PKG_VERSION")
    );
}

/// `--config` wins over `LLMGW_CONFIG`, which wins over the default.
fn resolve_config_path(cli: Option<PathBuf>, env: Option<String>) -> PathBuf {
    cli.or_else(|| env.map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("llm-gateway.toml"))
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> anyhow::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    // 1. Parse CLI arguments
    let cli = parse_args();
    let config_path = resolve_config_path(cli.config_path, std::env::var("LLMGW_CONFIG").ok());

    // 2. Load configuration
    let config = Config::load(&config_path)?;

    // 3. Initialize tracing/logging
    init_tracing(&config);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        providers = ?config.providers.keys().collect::<Vec<_>>(),
        window = %config.limits.window,
        "Starting llm-gateway"
    );
    if !config.env_overrides.is_empty() {
        tracing::info!(
            count = config.env_overrides.len(),
            "Settings overridden from LLMGW_* environment"
        );
    }

    // 4. Audit channel + background writer
    let (audit_tx, audit_rx) = tokio::sync::mpsc::unbounded_channel();
    let audit_handle = spawn_audit_logger(AuditSink::from_config(&config.audit), audit_rx);

    // 5. Shared state, then the usage file. A usage file we cannot prepare
    //    is fatal.
    let reset_usage = config.storage.reset_usage_on_startup;
    let state = AppState::from_config(config, audit_tx)?;
    if let Err(e) = state.usage.initialize_async(reset_usage).await {
        tracing::error!(
            path = %state.usage.path().display(),
            error = %e,
            "Failed to initialize usage file"
        );
        return Err(e.into());
    }

    // 6. Bind and serve
    let listen_addr = state.config.listen_addr();
    let app = build_app(state);
    let listener = TcpListener::bind(&listen_addr).await?;
    tracing::info!(addr = %listen_addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 7. Cleanup. Dropping the router dropped the last audit sender, so the
    //    logger drains and exits.
    tracing::info!("Shutting down gracefully");
    if let Err(e) = audit_handle.await {
        tracing::warn!(error = %e, "Audit logger task failed");
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Router assembly
// ---------------------------------------------------------------------------

/// Build the application router with the middleware stack.
fn build_app(state: AppState) -> Router {
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();
    let trace = TraceLayer::new_for_http();

    api::build_api_router()
        .layer(propagate_id)
        .layer(request_id)
        .layer(trace)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Tracing initialization
// ---------------------------------------------------------------------------

fn init_tracing(config: &Config) {
    // RUST_LOG env var takes precedence over config file
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = &config.logging.level;
        EnvFilter::new(format!("llm_gateway={level},tower_http={level},warn"))
    });

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false);

    if config.logging.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

/// Wait for a shutdown signal (SIGTERM or SIGINT / Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
    fn test_resolve_config_path_precedence() {
        assert_eq!(
            resolve_config_path(Some("a.toml".into()), Some("b.toml".into())),
            PathBuf::from("a.toml")
        );
        assert_eq!(
            resolve_config_path(None, Some("b.toml".into())),
            PathBuf::from("b.toml")
        );
        assert_eq!(resolve_config_path(None, None), PathBuf::from("llm-gateway.toml"));
    }

    #[tokio::test]
    async fn test_build_app() {
        let (audit_tx, _audit_rx) = tokio::sync::mpsc::unbounded_channel();
        let state = AppState::from_config(Config::default(), audit_tx).unwrap();
        let _app = build_app(state);
    }
}
