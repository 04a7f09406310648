//! gatelink - gate and garage controller client

use clap::{Parser, Subcommand, ValueEnum};
use gatelink::automaton::{
    phase_caption, FileSyncStore, GateAutomaton, MemorySyncStore, SyncStore, Thresholds,
    WatchSettings,
};
use gatelink::clock::TokioClock;
use gatelink::config::GateConfig;
use gatelink::messaging::MessagingClient;
use gatelink::observability::{init_default_logging, StatusServer};
use gatelink::protocol::CommandKind;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "gatelink")]
#[command(about = "Gate and garage controller client over MQTT with an HTTP proxy fallback")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and keep the automaton and status server running
    Run {
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Share automaton state with other processes through this file
        #[arg(long, value_name = "FILE")]
        sync_file: Option<PathBuf>,
    },
    /// Publish one command and exit
    Command {
        kind: CliCommand,

        #[arg(short, long, env = "GATELINK_ACTOR")]
        actor: String,

        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
    /// Validate the configuration
    Config {
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliCommand {
    Toggle,
    Auto,
    Garage,
    Stop,
}

impl From<CliCommand> for CommandKind {
    fn from(command: CliCommand) -> Self {
        match command {
            CliCommand::Toggle => CommandKind::Toggle,
            CliCommand::Auto => CommandKind::Auto,
            CliCommand::Garage => CommandKind::Garage,
            CliCommand::Stop => CommandKind::Stop,
        }
    }
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_default_logging() {
        eprintln!("Failed to initialize logging: {e}");
    }

    let result = match cli.command {
        Commands::Run { config, sync_file } => run(config.as_deref(), sync_file).await,
        Commands::Command {
            kind,
            actor,
            config,
        } => send_command(config.as_deref(), kind.into(), &actor).await,
        Commands::Config { config, show } => check_config(config.as_deref(), show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(path: Option<&Path>) -> Result<GateConfig, Box<dyn std::error::Error>> {
    if let Some(path) = path {
        info!("Loading configuration from: {}", path.display());
        return Ok(GateConfig::load_from_file(path)?);
    }

    for candidate in ["gatelink.toml", "config/gatelink.toml"] {
        let path = Path::new(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(GateConfig::load_from_file(path)?);
        }
    }

    Err("No configuration file found. Pass one with --config or create gatelink.toml".into())
}

async fn run(config_path: Option<&Path>, sync_file: Option<PathBuf>) -> CliResult {
    let config = load_configuration(config_path)?;
    info!(client_id = %config.client.id, "Starting gatelink v{}", env!("CARGO_PKG_VERSION"));

    let client = MessagingClient::new(&config);
    client.on_status_change(|status| {
        info!(
            gate = %status.gate_state,
            garage = %status.garage_state,
            connected = status.connected,
            transport = %status.transport,
            "Status changed"
        );
    });
    client.on_external_log(|entry| info!(entry = %entry.id, "External log entry"));

    if let Err(e) = client.connect().await {
        // The automaton and server still come up; a later reconnect restores status
        warn!(error = %e, "Initial connect failed");
    }

    let store: Arc<dyn SyncStore> = match sync_file {
        Some(path) => Arc::new(FileSyncStore::open(path).await?),
        None => Arc::new(MemorySyncStore::new()),
    };
    let automaton = GateAutomaton::start(
        client.subscribe_status(),
        Arc::new(client.clone()),
        Arc::new(WatchSettings::new(Thresholds::from(&config.thresholds))),
        store,
        Arc::new(TokioClock),
    )
    .await;
    automaton.on_notice(|notice| info!(notice = %notice, "Automaton notice"));

    let mut states = automaton.subscribe();
    let caption_task = tokio::spawn(async move {
        let mut last_phase = None;
        while states.changed().await.is_ok() {
            let state = states.borrow_and_update().clone();
            if last_phase != Some(state.phase) {
                if let Some(caption) = phase_caption(&state) {
                    info!(phase = %state.phase, caption = %caption, "Automaton");
                }
                last_phase = Some(state.phase);
            }
        }
    });

    let server_task = config.server.enabled.then(|| {
        let server = Arc::new(StatusServer::new(
            config.server.port,
            client.clone(),
            Some(automaton.clone()),
        ));
        tokio::spawn(server.start())
    });

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
    }

    automaton.shutdown();
    caption_task.abort();
    if let Some(task) = server_task {
        task.abort();
    }
    client.disconnect().await;
    info!("Shutdown complete");
    Ok(())
}

async fn send_command(config_path: Option<&Path>, kind: CommandKind, actor: &str) -> CliResult {
    let config = load_configuration(config_path)?;
    let client = MessagingClient::new(&config);

    client.connect().await?;
    let result = client.publish_command(kind, actor).await;
    client.disconnect().await;
    result?;

    println!("{} ({}) sent as {}", kind.label(), kind.code(), actor);
    Ok(())
}

fn check_config(config_path: Option<&Path>, show: bool) -> CliResult {
    let config = load_configuration(config_path)?;
    config.validate()?;

    if show {
        println!("{}", toml::to_string_pretty(&config)?);
    }
    info!("Configuration is valid");
    Ok(())
}
