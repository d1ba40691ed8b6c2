//! toolgate CLI: list and call tools on a JSON-RPC tool server.

use anyhow::{Context, Result, anyhow, ensure};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;
use toolgate_client::{ConnectionMode, GatewayClient};
use toolgate_config::{CliOverrides, ToolgateConfig};

#[derive(Parser)]
#[command(
    name = "toolgate",
    version,
    about = "Resilient client for JSON-RPC tool servers"
)]
struct Cli {
    /// Config file (default: ~/.toolgate/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Connection mode: owned_process or external_socket
    #[arg(long, global = true)]
    mode: Option<ConnectionMode>,

    /// Host to connect to in external_socket mode
    #[arg(long, global = true)]
    host: Option<String>,

    /// Initial port for the server
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Server command to spawn in owned_process mode
    #[arg(long, global = true)]
    command: Option<String>,

    /// Argument for the server command (repeatable)
    #[arg(long = "server-arg", global = true, allow_hyphen_values = true)]
    server_args: Vec<String>,

    /// Enable verbose/debug logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand)]
enum Action {
    /// List the tools the server exposes
    Tools,
    /// Invoke a tool and print its result
    Call {
        /// Tool name
        name: String,

        /// Tool arguments as a JSON object
        #[arg(long = "args", default_value = "{}")]
        arguments: String,

        /// Give up on the call after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ToolgateConfig::load(CliOverrides {
        config_path: cli.config,
        mode: cli.mode,
        host: cli.host,
        port: cli.port,
        command: cli.command,
        args: (!cli.server_args.is_empty()).then_some(cli.server_args),
        debug: cli.verbose,
    })
    .context("Failed to load configuration")?;

    // Set up logging
    let log_level = if config.gateway.debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(io::stderr)
        .init();

    tracing::debug!(
        "Using {:?} mode, port {} (config dir {})",
        config.gateway.mode,
        config.gateway.port,
        config.config_dir.display()
    );

    let client = GatewayClient::new(config.gateway);
    let outcome = tokio::select! {
        result = run(&client, cli.action) => result,
        _ = tokio::signal::ctrl_c() => Err(anyhow!("Interrupted")),
    };
    client.stop().await;
    outcome
}

async fn run(client: &GatewayClient, action: Action) -> Result<()> {
    client
        .start()
        .await
        .context("Failed to start tool server")?;

    match action {
        Action::Tools => {
            let tools = client.list_tools().await.context("Failed to list tools")?;
            print_json(&serde_json::to_value(&tools)?)
        }
        Action::Call {
            name,
            arguments,
            timeout_ms,
        } => {
            let arguments: Value =
                serde_json::from_str(&arguments).context("--args is not valid JSON")?;
            ensure!(arguments.is_object(), "--args must be a JSON object");

            let call = client.call_tool(&name, arguments);
            let result = match timeout_ms {
                Some(ms) => tokio::time::timeout(Duration::from_millis(ms), call)
                    .await
                    .map_err(|_| anyhow!("Tool '{name}' timed out after {ms}ms"))?,
                None => call.await,
            };
            let value = result.with_context(|| format!("Tool '{name}' failed"))?;
            print_json(&value)
        }
    }
}

fn print_json(value: &Value) -> Result<()> {
    let mut out = io::stdout().lock();
    serde_json::to_writer_pretty(&mut out, value)?;
    writeln!(out)?;
    Ok(())
}
