use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use herald_config::McpTransport;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "herald", version, about = "Telegram approval bridge for MCP agents")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the bridge.
    Serve {
        #[arg(long, default_value = "./config/example-config.yaml")]
        config: String,
        /// Overrides `mcp.transport`.
        #[arg(long, value_enum)]
        transport: Option<TransportArg>,
    },
    /// Validate a config file and exit.
    CheckConfig {
        #[arg(long, default_value = "./config/example-config.yaml")]
        config: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum TransportArg {
    Stdio,
    Http,
}

impl From<TransportArg> for McpTransport {
    fn from(value: TransportArg) -> Self {
        match value {
            TransportArg::Stdio => McpTransport::Stdio,
            TransportArg::Http => McpTransport::Http,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match cli.command {
        Command::CheckConfig { config } => {
            let cfg = herald_config::load_and_validate(&config)
                .with_context(|| format!("failed to load config {config}"))?;
            println!(
                "config ok: {} authorized chat(s), transport {:?}",
                cfg.telegram.authorized_chat_ids.len(),
                cfg.mcp.transport
            );
            Ok(())
        }
        Command::Serve { config, transport } => {
            let mut cfg = herald_config::load_and_validate(&config)
                .with_context(|| format!("failed to load config {config}"))?;
            if let Some(transport) = transport {
                cfg.mcp.transport = transport.into();
            }

            // stdout carries MCP frames in stdio mode, so logs always go to stderr.
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| EnvFilter::new(&cfg.logging.level)),
                )
                .with_writer(std::io::stderr)
                .init();
            tracing::info!(config = %config, "configuration loaded");

            herald_server::serve(cfg)
                .await
                .context("bridge exited with error")
        }
    }
}
