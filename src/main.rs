//! hearth CLI entry point.
//!
//! Provides `start`, `link`, `send`, `pair-token`, and `status` subcommands
//! for running the assistant, linking the WhatsApp device, queueing a
//! proactive message, minting a pairing token, and checking health.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{info, warn};

use hearth::assistant::openai::ChatAssistant;
use hearth::assistant::Assistant;
use hearth::channel::commands::CommandHandler;
use hearth::channel::pairing::{PairingGuard, PairingPolicy};
use hearth::channel::{Channel, MessageSender};
use hearth::config::{config_path, load_config, Config};
use hearth::heartbeat::runner::AssistantTaskRunner;
use hearth::heartbeat::{HeartbeatScheduler, HeartbeatSettings};
use hearth::outbox::poller::OutboxPoller;
use hearth::outbox::OutboxProcessor;
use hearth::store::{OutboxRepository, SqliteStore};
use hearth::whatsapp::adapter::{AdapterDeps, WhatsAppChannel};
use hearth::whatsapp::client::WhatsAppClient;
use hearth::whatsapp::connection::{ConnectionManager, ConnectionSettings};
use hearth::whatsapp::events::CHANNEL_NAME;
use hearth::whatsapp::jid::Jid;
use hearth::whatsapp::setup::{link_device, LinkOutcome};
use hearth::whatsapp::transport::BridgeTransport;

/// Database file inside the data directory.
const DB_FILE: &str = "hearth.db";

/// Length of generated pairing tokens.
const PAIR_TOKEN_LEN: usize = 24;

/// Inbound message buffer between the connection and the adapter.
const INBOUND_CAPACITY: usize = 128;

/// hearth: a personal WhatsApp assistant.
#[derive(Parser)]
#[command(name = "hearth", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run the assistant until Ctrl-C.
    Start,
    /// Start the bridge sidecar and write the device-linking QR code.
    Link {
        /// Where to write the QR code PNG (default: `<data_dir>/whatsapp-qr.png`).
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Queue a proactive message for delivery through the outbox.
    Send {
        /// Recipient phone number or JID.
        user: String,
        /// Message text.
        text: String,
    },
    /// Print a fresh random pairing token.
    PairToken,
    /// Show bridge connectivity and outbox depth.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match cli.command {
        Command::Start => handle_start().await,
        Command::Link { output } => handle_link(output).await,
        Command::Send { user, text } => handle_send(&user, &text).await,
        Command::PairToken => {
            println!("{}", generate_pair_token());
            eprintln!("Set it as pairing.token in config.toml or HEARTH_PAIR_TOKEN.");
            Ok(())
        }
        Command::Status => handle_status().await,
    }
}

fn load() -> anyhow::Result<Config> {
    let path = config_path()?;
    load_config(&path).with_context(|| format!("failed to load {}", path.display()))
}

async fn open_store(config: &Config) -> anyhow::Result<SqliteStore> {
    let db_path = config.data_dir()?.join(DB_FILE);
    let store = SqliteStore::open(&db_path)
        .await
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    Ok(store.with_max_retries(config.outbox.max_retries))
}

fn generate_pair_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PAIR_TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// Run the assistant: connection, inbound handling, outbox, and heartbeat.
async fn handle_start() -> anyhow::Result<()> {
    let config = load()?;
    let data_dir = config.data_dir()?;
    let _logging_guard = hearth::logging::init_production(&data_dir.join("logs"))?;

    let store = Arc::new(open_store(&config).await?);
    let assistant: Arc<dyn Assistant> = Arc::new(ChatAssistant::from_config(
        &config.assistant,
        store.clone(),
        |key| std::env::var(key).ok(),
    ));

    let client = WhatsAppClient::new(&config.whatsapp.bridge_url);
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
    let connection = ConnectionManager::new(
        Arc::new(BridgeTransport::new(client)),
        ConnectionSettings::from(&config.connection),
        inbound_tx,
    );

    let sender: Arc<dyn MessageSender> = Arc::new(connection.clone());
    let processor = Arc::new(OutboxProcessor::from_config(
        store.clone(),
        sender,
        &config.outbox,
    ));
    let poller = OutboxPoller::new(
        CHANNEL_NAME,
        store.clone(),
        processor,
        std::time::Duration::from_secs(config.outbox.poll_interval_secs),
    );

    let pairing = PairingGuard::new(
        config.pairing.token.clone(),
        PairingPolicy::from_config(&config.pairing),
    );
    if !pairing.is_enabled() {
        info!("pairing disabled; only configured allowed_users can talk to the assistant");
    }

    let channel = WhatsAppChannel::new(
        AdapterDeps {
            connection,
            commands: CommandHandler::new(pairing),
            whitelist: store.clone(),
            channels: store.clone(),
            assistant: Arc::clone(&assistant),
            poller,
            allowed_users: config.whatsapp.allowed_users.clone(),
        },
        inbound_rx,
    );

    let heartbeat = config.heartbeat.enabled.then(|| {
        HeartbeatScheduler::new(
            Arc::new(AssistantTaskRunner::new(Arc::clone(&assistant))),
            store.clone(),
            store.clone(),
            HeartbeatSettings::from(&config.heartbeat),
        )
    });

    channel.start().await?;
    if let Some(ref heartbeat) = heartbeat {
        heartbeat.start();
    }
    info!(data_dir = %data_dir.display(), "hearth started");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutdown requested");

    if let Some(ref heartbeat) = heartbeat {
        heartbeat.stop();
    }
    channel.stop().await;
    store.close().await;
    info!("hearth stopped");
    Ok(())
}

/// Ensure the bridge sidecar is running and write its QR code.
async fn handle_link(output: Option<PathBuf>) -> anyhow::Result<()> {
    hearth::logging::init_cli();
    let config = load()?;
    let data_dir = config.data_dir()?;
    let qr_path = output.unwrap_or_else(|| data_dir.join("whatsapp-qr.png"));

    let docker = bollard::Docker::connect_with_local_defaults()
        .context("failed to connect to Docker")?;
    let client = WhatsAppClient::new(&config.whatsapp.bridge_url);

    let outcome = link_device(
        &docker,
        &client,
        &config.whatsapp.sidecar_image,
        &data_dir.join("whatsapp-auth"),
        &qr_path,
    )
    .await
    .context("device linking failed")?;

    match outcome {
        LinkOutcome::AlreadyLinked(phone) => {
            println!(
                "Already linked{}.",
                phone.map(|p| format!(" as {p}")).unwrap_or_default()
            );
        }
        LinkOutcome::QrWritten(path) => {
            println!("QR code written to {}", path.display());
            println!("Open WhatsApp > Linked devices > Link a device, and scan it.");
            println!("Restart `hearth start` once the device is linked.");
        }
    }
    Ok(())
}

/// Queue a message in the outbox.
async fn handle_send(user: &str, text: &str) -> anyhow::Result<()> {
    hearth::logging::init_cli();
    let jid = Jid::parse_direct(user).context("invalid recipient")?;
    let config = load()?;
    let store = open_store(&config).await?;
    let id = store
        .enqueue(CHANNEL_NAME, &jid.to_string(), text)
        .await
        .context("failed to enqueue message")?;
    store.close().await;
    println!("Queued message {id} for {jid}.");
    Ok(())
}

/// Print bridge connectivity and the outbox depth.
async fn handle_status() -> anyhow::Result<()> {
    hearth::logging::init_cli();
    let config = load()?;

    let client = WhatsAppClient::new(&config.whatsapp.bridge_url);
    match client.status().await {
        Ok(status) if status.connected => println!(
            "bridge: connected{}",
            status
                .phone_number
                .map(|p| format!(" ({p})"))
                .unwrap_or_default()
        ),
        Ok(_) => println!("bridge: reachable, not linked (run `hearth link`, then restart)"),
        Err(e) => {
            warn!(error = %e, "bridge status failed");
            println!("bridge: unreachable at {}", client.base_url());
        }
    }

    let store = open_store(&config).await?;
    let pending = store.count_pending(CHANNEL_NAME).await?;
    store.close().await;
    println!("outbox: {pending} pending");
    Ok(())
}
