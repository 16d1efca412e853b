//! mcp-transport-bridge: network transports for stdio MCP servers
//!
//! Serves WebSocket and SSE clients, giving each session its own backend
//! process that speaks MCP over stdio.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use mcp_transport_bridge::bridge::Bridge;
use mcp_transport_bridge::config::{self, Config};
use mcp_transport_bridge::error::ConfigError;

/// Bridges WebSocket and SSE clients to a stdio MCP backend.
///
/// Every client session gets its own backend process; JSON-RPC messages are
/// relayed between the two unchanged.
#[derive(Parser, Debug)]
#[command(name = "mcp-transport-bridge")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(value_name = "CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Increase logging verbosity (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease logging verbosity (only show errors)
    #[arg(short, long)]
    quiet: bool,

    /// WebSocket listener port (overrides config and MCP_WS_PORT)
    #[arg(long, value_name = "PORT")]
    ws_port: Option<u16>,

    /// SSE listener port (overrides config and MCP_SSE_PORT)
    #[arg(long, value_name = "PORT")]
    http_port: Option<u16>,
}

/// Determines the log level from CLI arguments.
#[allow(clippy::match_same_arms)] // Explicit "warn" arm for clarity
fn get_log_level(verbose: u8, quiet: bool, config_level: &str) -> Level {
    if quiet {
        return Level::ERROR;
    }

    match verbose {
        0 => match config_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        },
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Initialises the tracing subscriber for logging.
fn init_tracing(level: Level) {
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Loads the configuration and applies CLI port overrides.
fn load(args: &Args) -> Result<Config, ConfigError> {
    let mut cfg = config::load_config(args.config.as_deref())?;
    if args.ws_port.is_none() && args.http_port.is_none() {
        return Ok(cfg);
    }
    if let Some(port) = args.ws_port {
        cfg.duplex.port = port;
    }
    if let Some(port) = args.http_port {
        cfg.streaming.port = port;
    }
    cfg.validate()?;
    Ok(cfg)
}

/// Entry point for the mcp-transport-bridge server.
fn main() -> ExitCode {
    let args = Args::parse();

    let cfg = match load(&args) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            if args.config.is_none() {
                if let Some(default_path) = config::default_config_path() {
                    eprintln!("\nExpected config at: {}", default_path.display());
                    eprintln!("Create one based on config/example-config.json");
                }
            }
            return ExitCode::FAILURE;
        }
    };

    let log_level = get_log_level(args.verbose, args.quiet, &cfg.logging.level);
    init_tracing(log_level);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        backend = %cfg.backend.command,
        "Starting mcp-transport-bridge"
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to create Tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(Bridge::new(cfg).run());

    match result {
        Ok(()) => {
            info!("Server shut down gracefully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Server error");
            ExitCode::FAILURE
        }
    }
}
