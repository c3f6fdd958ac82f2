//! Cloudless CLI
//!
//! End-to-end encrypted rooms for chat and file transfer.

mod config;
mod progress;

use clap::{Parser, Subcommand};
use console::style;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use cloudless_core::{
    ChatEntry, EntryBody, FileKeyStore, HttpApi, RoomEvent, RoomInfo, RoomSession,
};
use cloudless_files::{FileChunker, TransferProgress};
use cloudless_transport::{RealtimeClient, TransportStatus, WsConnector};

use config::Config;
use progress::{TransferBar, format_bytes};

/// Cloudless - encrypted rooms over an untrusted relay
#[derive(Parser)]
#[command(name = "cloudless")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Relay server URL (overrides the config file)
    #[arg(long)]
    server: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Create a room and print its join code
    Create {
        /// Room name
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Join a room by code
    Join {
        /// Join code
        #[arg(required = true)]
        code: String,
    },

    /// Chat in a room until `/quit` or end of input
    Chat {
        /// Room ID
        #[arg(required = true)]
        room: String,
    },

    /// Upload a file to a room through the relay
    Send {
        /// Room ID
        #[arg(required = true)]
        room: String,

        /// File to send
        #[arg(required = true)]
        file: PathBuf,

        /// MIME type stored (encrypted) with the file
        #[arg(long)]
        mime: Option<String>,
    },

    /// Download and decrypt a file from a room
    Receive {
        /// Room ID
        #[arg(required = true)]
        room: String,

        /// Transfer ID
        #[arg(required = true)]
        transfer: String,

        /// Output directory
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List transfers in a room
    Transfers {
        /// Room ID
        #[arg(required = true)]
        room: String,
    },

    /// Show the safety number for a room member
    Verify {
        /// Room ID
        #[arg(required = true)]
        room: String,

        /// Member user ID (defaults to the first peer)
        peer: Option<String>,
    },

    /// Leave a room and forget its key
    Leave {
        /// Room ID
        #[arg(required = true)]
        room: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load_or_default(&config_path)?;
    config.apply_env();
    if let Some(server) = cli.server {
        config.server.url = server;
    }

    // Initialize logging
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(level))
        .init();

    // Validate configuration
    config.validate()?;

    match cli.command {
        Commands::Init { force } => init_config(&config_path, force)?,
        Commands::Create { name } => create_room(name.as_deref(), &config).await?,
        Commands::Join { code } => join_room(&code, &config).await?,
        Commands::Chat { room } => chat(&room, &config).await?,
        Commands::Send { room, file, mime } => {
            send_file(&room, &file, mime.as_deref(), &config).await?;
        }
        Commands::Receive {
            room,
            transfer,
            output,
        } => {
            let dir = output.unwrap_or_else(|| config.storage.download_dir.clone());
            receive_file(&room, &transfer, &dir, &config).await?;
        }
        Commands::Transfers { room } => list_transfers(&room, &config).await?,
        Commands::Verify { room, peer } => verify(&room, peer.as_deref(), &config).await?,
        Commands::Leave { room } => leave_room(&room, &config).await?,
    }

    Ok(())
}

/// Build a session against the configured relay
fn open_session(config: &Config) -> anyhow::Result<Arc<RoomSession>> {
    let token = config.token()?;
    let session_config = config.session_config();

    let api = HttpApi::new(&config.server.url, token, &session_config)?;
    let connector = WsConnector::new(&config.server.url, token)?;
    let transport = RealtimeClient::new(Arc::new(connector), session_config.transport.clone());
    let keystore = FileKeyStore::new(&config.storage.key_file);

    let session = RoomSession::new(
        Arc::new(api),
        Arc::new(keystore),
        Arc::new(transport),
        session_config,
    )?;
    Ok(Arc::new(session))
}

fn init_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    Config::default().save(path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn print_room(room: &RoomInfo) {
    println!("Room:    {}", style(&room.id).bold());
    if let Some(name) = &room.name {
        println!("Name:    {name}");
    }
    println!("Code:    {}", style(&room.code).green().bold());
    println!("Members: {}", room.members.len());
    if let Some(expires) = room.expires_at {
        println!("Expires: {}", expires.format("%Y-%m-%d %H:%M UTC"));
    }
}

async fn create_room(name: Option<&str>, config: &Config) -> anyhow::Result<()> {
    let session = open_session(config)?;
    let room = session.create_room(name).await?;
    print_room(&room);
    println!("Share the code with the other participant to start.");
    session.close().await;
    Ok(())
}

async fn join_room(code: &str, config: &Config) -> anyhow::Result<()> {
    let session = open_session(config)?;
    let room = session.join_room(code).await?;
    print_room(&room);
    session.close().await;
    Ok(())
}

fn print_entry(entry: &ChatEntry) {
    let time = entry.timestamp.format("%H:%M");
    let name = if entry.is_own {
        style(entry.sender_name.as_str()).cyan()
    } else {
        style(entry.sender_name.as_str()).magenta()
    };
    match &entry.body {
        EntryBody::Text(text) => println!("[{time}] {name}: {text}"),
        EntryBody::File { transfer_id } => {
            println!("[{time}] {name} shared a file ({transfer_id})");
        }
    }
}

fn print_event(event: &RoomEvent) {
    match event {
        RoomEvent::MessageReceived(entry) if !entry.is_own => print_entry(entry),
        RoomEvent::MemberOnline(user) => {
            println!("{}", style(format!("* {user} is online")).dim());
        }
        RoomEvent::MemberOffline(user) => {
            println!("{}", style(format!("* {user} went offline")).dim());
        }
        RoomEvent::MemberRekeyed(user) => {
            println!(
                "{}",
                style(format!("* {user} has a new key; verify the safety number again")).yellow()
            );
        }
        RoomEvent::TransferChanged(record) if !record.is_own => {
            println!(
                "{}",
                style(format!(
                    "* {} {} ({}) [{}]",
                    record.display_name(),
                    record.status,
                    format_bytes(record.file_size),
                    record.id
                ))
                .dim()
            );
        }
        RoomEvent::DecryptionFailed { sender } => {
            println!(
                "{}",
                style(format!("! message from {sender} could not be decrypted")).red()
            );
        }
        _ => {}
    }
}

async fn chat(room_id: &str, config: &Config) -> anyhow::Result<()> {
    let session = open_session(config)?;
    let mut events = session.events();
    let mut status = session.transport().status_events();
    let room = session.load_room(room_id).await?;

    println!(
        "Chatting in {} ({}). Type /quit to leave.",
        style(room.name.as_deref().unwrap_or(&room.id)).bold(),
        room.code
    );
    for entry in session.messages().await {
        print_entry(&entry);
    }

    let runner = Arc::clone(&session);
    let event_loop = tokio::spawn(async move { runner.run_events().await });

    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "room events lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let text = line.trim();
                if text == "/quit" {
                    break;
                }
                if text.is_empty() {
                    continue;
                }
                match session.send_message(text).await {
                    Ok(entry) => print_entry(&entry),
                    Err(e) => eprintln!("{} {e}", style("send failed:").red()),
                }
            }
            update = status.recv() => match update {
                Ok(TransportStatus::ReconnectScheduled { attempt, delay }) => {
                    eprintln!("{}", style(format!("reconnecting ({attempt}) in {delay:?}")).yellow());
                }
                Ok(TransportStatus::Rejected { code, reason }) => {
                    eprintln!("{} {reason} ({code})", style("rejected by relay:").red());
                    break;
                }
                Ok(TransportStatus::GaveUp { attempts }) => {
                    eprintln!("{}", style(format!("connection lost after {attempts} attempts")).red());
                    break;
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }

    session.close().await;
    event_loop.abort();
    printer.abort();
    Ok(())
}

async fn send_file(
    room_id: &str,
    file: &Path,
    mime: Option<&str>,
    config: &Config,
) -> anyhow::Result<()> {
    let session = open_session(config)?;
    session.load_room(room_id).await?;

    let chunker = FileChunker::with_chunk_size(config.session.chunk_size)?;
    let (metadata, data) = cloudless_files::load_file(file, &chunker).await?;

    println!("Sending: {}", style(&metadata.name).bold());
    println!("Size:    {}", format_bytes(metadata.size));
    println!("Chunks:  {}", metadata.chunk_count);
    println!("BLAKE3:  {}", hex::encode(metadata.hash));

    let bar = TransferBar::new(metadata.size, &metadata.name);
    let result = session
        .send_file(&metadata.name, mime, &data, |p: &TransferProgress| bar.update(p))
        .await;
    session.close().await;

    match result {
        Ok(record) => {
            bar.finish_with_message(format!("Sent {} [{}]", metadata.name, record.id));
            Ok(())
        }
        Err(e) => {
            bar.abandon();
            Err(e.into())
        }
    }
}

/// Strip directories from a decrypted filename
fn safe_file_name(name: &str, fallback: &str) -> String {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty() && *n != "..")
        .unwrap_or(fallback)
        .to_string()
}

async fn receive_file(
    room_id: &str,
    transfer_id: &str,
    output: &Path,
    config: &Config,
) -> anyhow::Result<()> {
    let session = open_session(config)?;
    session.load_room(room_id).await?;

    let record = session
        .refresh_transfers()
        .await?
        .into_iter()
        .find(|t| t.id == transfer_id)
        .ok_or_else(|| anyhow::anyhow!("no transfer {transfer_id} in room {room_id}"))?;

    let bar = TransferBar::new(record.file_size, record.display_name());
    let result = session
        .download(transfer_id, |p: &TransferProgress| bar.update(p))
        .await;
    session.close().await;

    let file = match result {
        Ok(file) => file,
        Err(e) => {
            bar.abandon();
            return Err(e.into());
        }
    };

    tokio::fs::create_dir_all(output).await?;
    let path = output.join(safe_file_name(&file.name, transfer_id));
    tokio::fs::write(&path, &file.data).await?;

    bar.finish_with_message(format!("Received {}", path.display()));
    println!("BLAKE3:  {}", hex::encode(cloudless_crypto::hash::hash(&file.data)));
    Ok(())
}

async fn list_transfers(room_id: &str, config: &Config) -> anyhow::Result<()> {
    let session = open_session(config)?;
    session.load_room(room_id).await?;
    let transfers = session.refresh_transfers().await?;
    session.close().await;

    if transfers.is_empty() {
        println!("No transfers.");
        return Ok(());
    }
    for t in transfers {
        let from = if t.is_own { "you" } else { t.sender_name.as_str() };
        println!(
            "{}  {:<10} {:>10}  {}/{}  {}  (from {from})",
            style(&t.id).bold(),
            t.status.as_str(),
            format_bytes(t.file_size),
            t.uploaded_chunks,
            t.total_chunks,
            t.display_name(),
        );
    }
    Ok(())
}

async fn verify(room_id: &str, peer: Option<&str>, config: &Config) -> anyhow::Result<()> {
    let session = open_session(config)?;
    session.load_room(room_id).await?;

    let peer = match peer {
        Some(peer) => peer.to_string(),
        None => session
            .peer_ids()
            .await
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("nobody else has joined this room yet"))?,
    };
    let info = session.safety_info(&peer).await;
    session.close().await;
    let info = info?;

    println!("Peer:          {} ({})", style(&info.peer_name).bold(), info.peer_id);
    println!("Safety number: {}", style(info.safety_number).green().bold());
    println!("Your key:      {}", info.own_fingerprint.join(" "));
    println!("Their key:     {}", info.peer_fingerprint.join(" "));
    println!("Compare these with your peer over another channel.");
    Ok(())
}

async fn leave_room(room_id: &str, config: &Config) -> anyhow::Result<()> {
    let session = open_session(config)?;
    session.load_room(room_id).await?;
    session.leave().await?;
    println!("Left room {room_id}");
    Ok(())
}
