use std::io::IsTerminal;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;

use pact_store::{client_server, participant, Coordinator, CoordinatorConfig};

#[derive(Parser, Debug)]
#[command(name = "pact-store")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the transaction coordinator.
    Coordinator(CoordinatorArgs),
    /// Run one participant node.
    Participant(ParticipantArgs),
}

#[derive(Parser, Debug)]
struct CoordinatorArgs {
    /// Client listen address, e.g. `127.0.0.1:6000`.
    #[arg(long)]
    listen: SocketAddr,

    /// Comma-separated participant endpoints, e.g.
    /// `127.0.0.1:7101,127.0.0.1:7102`.
    #[arg(long)]
    participants: String,

    /// Path of the append-only transaction journal.
    #[arg(long, default_value = "coordinator.log")]
    log_path: PathBuf,

    /// Per-call participant RPC timeout (ms).
    #[arg(long, env = "PACT_RPC_TIMEOUT_MS", default_value_t = 1000)]
    rpc_timeout_ms: u64,

    /// Heartbeat period (ms).
    #[arg(long, env = "PACT_HEARTBEAT_MS", default_value_t = 1000)]
    heartbeat_ms: u64,
}

#[derive(Parser, Debug)]
struct ParticipantArgs {
    /// RPC listen address, e.g. `127.0.0.1:7101`.
    #[arg(long)]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Coordinator(args) => run_coordinator(args).await,
        Command::Participant(args) => run_participant(args).await,
    }
}

async fn run_coordinator(args: CoordinatorArgs) -> anyhow::Result<()> {
    let participants = parse_endpoints(&args.participants)?;
    anyhow::ensure!(
        !participants.is_empty(),
        "at least one participant must be configured"
    );

    let config = CoordinatorConfig {
        listen: args.listen,
        participants,
        log_path: args.log_path,
        rpc_timeout: Duration::from_millis(args.rpc_timeout_ms),
        heartbeat_interval: Duration::from_millis(args.heartbeat_ms),
    };
    let coordinator = Coordinator::new(config)?;

    // Resolve in-flight transactions before accepting any client.
    coordinator.recovery().await;

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("bind client listener {}", args.listen))?;
    tracing::info!(listen = %args.listen, "coordinator accepting clients");

    tokio::spawn(coordinator.clone().run_heartbeat());
    client_server::run(listener, coordinator).await
}

async fn run_participant(args: ParticipantArgs) -> anyhow::Result<()> {
    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("bind rpc listener {}", args.listen))?;
    tracing::info!(listen = %args.listen, "participant accepting rpc");
    participant::run(listener).await
}

fn parse_endpoints(list: &str) -> anyhow::Result<Vec<SocketAddr>> {
    list.split(',')
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse()
                .with_context(|| format!("invalid participant endpoint `{part}`"))
        })
        .collect()
}
