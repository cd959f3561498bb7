//! The `conduit` binary: serves MCP over stdio or streamable HTTP.

mod config;
mod handler;

use clap::{Parser, Subcommand};
use conduit_core::Implementation;
use conduit_gateway::GatewayServer;
use conduit_mcp::{ClientConfig, McpClient, ProtocolEngine, StdioTransport};
use config::{ConduitConfig, ConfigSource, LogFormat, LoggingConfig};
use handler::BuiltinHandler;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conduit", about = "MCP transport and session engine")]
struct Cli {
    #[arg(short, long, default_value = "conduit.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve one session over stdin/stdout
    Stdio,
    /// Serve the streamable HTTP endpoint
    Http {
        #[arg(long)]
        host: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
        #[arg(long)]
        stateless: bool,
    },
    /// Spawn a stdio server, run the handshake and print its tools
    Inspect {
        /// Seconds to wait for each response
        #[arg(long, default_value_t = 30)]
        timeout: u64,
        command: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

fn init_logging(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));
    // stdout carries protocol frames in stdio mode.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match config.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.with_ansi(false).init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("Termination signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (config, source) = ConduitConfig::load(&cli.config).await?;
    init_logging(&config.logging);
    match source {
        ConfigSource::File => info!(path = %cli.config.display(), "Loaded config"),
        ConfigSource::Defaults => {
            info!(path = %cli.config.display(), "Config file not found, using defaults");
        }
    }

    let engine = Arc::new(
        ProtocolEngine::new(config.server.descriptor(), Arc::new(BuiltinHandler::new()))
            .with_drain_timeout(config.shutdown.drain_timeout()),
    );

    match cli.command {
        Commands::Stdio => {
            info!(server = %config.server.name, "Serving over stdio");
            let exit =
                conduit_mcp::serve(StdioTransport::stdio(), engine, shutdown_signal()).await?;
            info!(reason = ?exit, "Stdio transport finished");
        }
        Commands::Http {
            host,
            port,
            stateless,
        } => {
            let mut http = config.http;
            if let Some(host) = host {
                http.host = host;
            }
            if let Some(port) = port {
                http.port = port;
            }
            http.stateless |= stateless;
            http.validate()?;

            let listener = tokio::net::TcpListener::bind(http.bind_addr()).await?;
            info!(
                addr = %listener.local_addr()?,
                path = %http.path,
                stateless = http.stateless,
                "Serving streamable HTTP"
            );
            GatewayServer::new(engine, http)
                .serve(listener, shutdown_signal())
                .await?;
        }
        Commands::Inspect {
            timeout,
            command,
            args,
        } => {
            let client_config = ClientConfig::new(command)
                .args(args)
                .request_timeout(Duration::from_secs(timeout));
            let mut client = McpClient::connect(client_config).await?;
            let server = client
                .initialize(&Implementation::new("conduit-inspect", env!("CARGO_PKG_VERSION")))
                .await?
                .clone();
            let tools = client.list_tools().await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "server": server,
                    "tools": tools,
                }))?
            );
            client.shutdown().await?;
        }
    }

    Ok(())
}
