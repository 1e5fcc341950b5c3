use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{ArgAction, Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use arcane_core::DEFAULT_NAMESPACE;
use arcane_kubehub::{client_for, ConfigReader, ExecConfigReader, FileConfigReader};
use arcane_ops::{KubeDiscoverer, KubeStreamOperator, StreamLifecycle};

#[derive(Parser, Debug)]
#[command(name = "kubectl-arcane", version, about = "Manage Arcane streams")]
struct Cli {
    /// Kubernetes namespace holding the streams
    #[arg(long = "ns", global = true, default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// Kubeconfig path override
    #[arg(long = "kubeconfig", global = true)]
    kubeconfig: Option<PathBuf>,

    /// External command whose stdout is parsed as a kubeconfig
    #[arg(long = "exec-credentials", global = true)]
    exec_credentials: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Stream lifecycle operations
    #[command(subcommand)]
    Stream(StreamCommand),
}

#[derive(Subcommand, Debug)]
enum StreamCommand {
    /// Suspend the given stream
    Suspend {
        /// The ID of the stream to suspend
        id: String,
    },
    /// Resume the given stream
    Resume {
        /// The ID of the stream to resume
        id: String,
        /// The class of the stream to resume
        class: String,
    },
    /// Restart the given stream in the backfill mode
    Backfill {
        /// The ID of the stream to backfill
        id: String,
        /// Stream class to fall back to when the run resource is absent
        #[arg(long = "stream-class")]
        stream_class: Option<String>,
        /// Wait for the backfill to start and complete
        #[arg(long = "watch", action = ArgAction::SetTrue)]
        watch: bool,
    },
    /// Restart the given stream in the streaming mode
    Restart {
        /// The ID of the stream to restart
        id: String,
        /// Wait for the stream to come back to Running
        #[arg(long = "wait", action = ArgAction::SetTrue)]
        wait: bool,
        /// Deadline for the whole operation, e.g. 90s, 5m, 1h30m
        #[arg(long = "deadline", default_value = "1m")]
        deadline: String,
    },
}

impl StreamCommand {
    fn label(&self) -> &'static str {
        match self {
            StreamCommand::Suspend { .. } => "stream suspend",
            StreamCommand::Resume { .. } => "stream resume",
            StreamCommand::Backfill { .. } => "stream backfill",
            StreamCommand::Restart { .. } => "stream restart",
        }
    }
}

fn init_tracing() {
    let env = std::env::var("ARCANE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("ARCANE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid ARCANE_METRICS_ADDR; expected host:port");
        }
    }
}

fn config_reader(cli: &Cli) -> Result<Box<dyn ConfigReader>> {
    if let Some(spec) = &cli.exec_credentials {
        let mut parts = spec.split_whitespace();
        let command = parts
            .next()
            .ok_or_else(|| anyhow!("--exec-credentials requires a command"))?;
        let arguments = parts.map(str::to_string).collect();
        return Ok(Box::new(ExecConfigReader::new(command, arguments)));
    }
    Ok(Box::new(FileConfigReader::new(cli.kubeconfig.clone())))
}

/// Parse a Go-style duration string: one or more `<integer><h|m|s>` parts.
fn parse_deadline(input: &str) -> Result<Duration> {
    let mut total = Duration::ZERO;
    let mut digits = String::new();
    let mut seen_part = false;
    for ch in input.trim().chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let value: u64 = digits
            .parse()
            .map_err(|_| anyhow!("invalid deadline: {input}"))?;
        digits.clear();
        let unit_secs = match ch {
            'h' => 3600,
            'm' => 60,
            's' => 1,
            other => return Err(anyhow!("invalid deadline unit {other:?} in {input}")),
        };
        total += Duration::from_secs(value * unit_secs);
        seen_part = true;
    }
    if !digits.is_empty() || !seen_part {
        return Err(anyhow!("invalid deadline: {input}"));
    }
    Ok(total)
}

async fn run(cli: Cli) -> Result<()> {
    let reader = config_reader(&cli)?;
    let client = client_for(reader.as_ref()).await?;
    let lifecycle = StreamLifecycle::new(
        KubeDiscoverer::new(client.clone()),
        KubeStreamOperator::new(client),
        cli.namespace.clone(),
    );

    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received; cancelling");
                token.cancel();
            }
        });
    }

    let Commands::Stream(command) = cli.command;
    match command {
        StreamCommand::Suspend { id } => {
            info!(id = %id, "suspending stream");
            lifecycle.suspend(&id).await?;
        }
        StreamCommand::Resume { id, class } => {
            lifecycle.resume(&id, &class).await?;
        }
        StreamCommand::Backfill { id, stream_class, watch } => {
            lifecycle.backfill(&token, &id, stream_class.as_deref(), watch).await?;
        }
        StreamCommand::Restart { id, wait, deadline } => {
            let deadline = parse_deadline(&deadline)?;
            let timer = tokio::spawn({
                let token = token.clone();
                async move {
                    tokio::time::sleep(deadline).await;
                    token.cancel();
                }
            });
            let result = lifecycle.restart(&token, &id, wait).await;
            timer.abort();
            result?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let label = match &cli.command {
        Commands::Stream(command) => command.label(),
    };
    if let Err(e) = run(cli).await {
        error!(command = label, error = ?e, "command failed");
        std::process::exit(1);
    }
}
