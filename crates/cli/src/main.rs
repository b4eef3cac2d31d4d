use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use collaboration::{
    decode, HubTransport, InboundOutcome, LocalHub, PeerId, SyncConfig, SyncSession, WireMessage,
};
use serde::Serialize;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use strategy::{EntityPatch, EntityRecord, StrategyDocument, TargetKind, Task, TaskPatch};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "strategy-sync")]
#[command(about = "Strategy planner sync tools - simulate and inspect collaborative edits")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run two peers through crossing edits on one task and print the result
    Simulate {
        /// Session config file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Room code used to derive peer ids
        #[arg(long, default_value = "DEMO")]
        room: String,
    },

    /// Decode a wire message into an operation
    Decode {
        /// Message file, or - for stdin
        input: String,
    },

    /// Print the default session configuration
    Config,
}

type Session = SyncSession<StrategyDocument, HubTransport>;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PeerReport {
    peer_id: PeerId,
    task: Option<Task>,
    history_len: usize,
    notifications: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let default_filter = if cli.verbose {
        "collaboration=debug,strategy_sync=debug"
    } else {
        "collaboration=info,strategy_sync=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Simulate { config, room } => simulate_command(config, room).await,
        Commands::Decode { input } => decode_command(input).await,
        Commands::Config => config_command(),
    }
}

fn join(hub: &LocalHub, room: &str, config: &SyncConfig) -> (Arc<Session>, mpsc::UnboundedReceiver<WireMessage>) {
    let peer = PeerId::for_room(room);
    let (transport, rx) = hub.join(peer.clone());
    let session = Arc::new(SyncSession::new(peer, StrategyDocument::new(), transport, config.clone()));
    (session, rx)
}

fn pump(session: &Session, rx: &mut mpsc::UnboundedReceiver<WireMessage>) {
    while let Ok(message) = rx.try_recv() {
        if let InboundOutcome::Malformed(reason) = session.handle_inbound(message) {
            warn!("Dropped malformed message: {}", reason);
        }
    }
}

async fn simulate_command(config: Option<PathBuf>, room: String) -> Result<()> {
    let config = match config {
        Some(path) => SyncConfig::load(&path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => SyncConfig::default(),
    };

    let hub = LocalHub::new();
    let (alice, mut alice_rx) = join(&hub, &room, &config);
    let (bob, mut bob_rx) = join(&hub, &room, &config);
    alice.join()?;
    bob.join()?;
    pump(&alice, &mut alice_rx);
    pump(&bob, &mut bob_rx);

    info!("Peer {} creates the task", alice.peer_id());
    let mut task = Task::new("Blacksmith");
    task.category = "Economy".to_string();
    let id = task.id.clone();
    alice.create_entity(EntityRecord::Task(task))?;
    pump(&bob, &mut bob_rx);

    info!("Both peers edit before either edit arrives");
    alice.update_entity(
        TargetKind::Task,
        id.clone(),
        EntityPatch::Task(TaskPatch {
            priority: Some(3),
            ..Default::default()
        }),
    )?;
    bob.update_entity(
        TargetKind::Task,
        id.clone(),
        EntityPatch::Task(TaskPatch {
            category: Some("Armor".to_string()),
            ..Default::default()
        }),
    )?;

    pump(&alice, &mut alice_rx);
    pump(&bob, &mut bob_rx);
    alice.sweep_pending();
    bob.sweep_pending();

    let reports: Vec<PeerReport> = [&alice, &bob]
        .into_iter()
        .map(|session| PeerReport {
            peer_id: session.peer_id().clone(),
            task: session.with_store(|doc| doc.task(&id).cloned()),
            history_len: session.with_engine(|engine| engine.history_len()),
            notifications: session
                .notifications()
                .into_iter()
                .map(|n| n.message)
                .collect(),
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&reports)?);

    let converged = reports[0].task == reports[1].task;
    if converged {
        info!("Peers converged");
    } else {
        warn!("Peers diverged");
    }

    for session in [&alice, &bob] {
        session.leave();
        hub.leave(session.peer_id());
    }
    Ok(())
}

async fn decode_command(input: String) -> Result<()> {
    let json = if input == "-" {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read stdin")?;
        buffer
    } else {
        tokio::fs::read_to_string(&input)
            .await
            .with_context(|| format!("Failed to read {}", input))?
    };

    let message = WireMessage::from_json(&json)?;
    if !message.message_type.is_operation() {
        info!("{} message carries no operation", message.message_type);
        println!("{}", serde_json::to_string_pretty(&message)?);
        return Ok(());
    }

    let operation = decode(&message)?;
    println!("{}", serde_json::to_string_pretty(&operation)?);
    Ok(())
}

fn config_command() -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&SyncConfig::default())?);
    Ok(())
}
