//! Terminal Chat Peer Example
//!
//! Joins a room on a signaling relay and, once a second peer joins, negotiates
//! a real WebRTC session. Lines typed on stdin go out as chat messages.
//!
//! # Commands
//!
//! - `/send <path>` sends a file
//! - `/love <text>` sends a love note
//! - `/end` ends the call
//! - anything else is sent as chat
//!
//! # Running
//!
//! ```bash
//! cargo run -p duetlink-signaling-server -- serve
//! cargo run --example chat_peer -- --room R1
//! cargo run --example chat_peer -- --room R1   # in a second terminal
//! ```

use clap::Parser;
use duetlink_webrtc::channels::messages::{ChatMessage, LoveNote};
use duetlink_webrtc::transfer::TransferDirection;
use duetlink_webrtc::{
    FileTransfers, Multiplexer, NegotiationState, Negotiator, RtcTransportFactory, SessionConfig,
    SessionController, SignalingClient, SignalingClientConfig, TransferConfig, TransferEvent,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "chat_peer", about = "Two-peer chat over a WebRTC data channel")]
struct Args {
    /// Signaling relay URL
    #[arg(long, env = "SIGNALING_URL", default_value = "ws://localhost:3001")]
    url: String,

    /// Room to join
    #[arg(long, default_value = "lobby")]
    room: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let client = match SignalingClient::connect(SignalingClientConfig::new(&args.url)).await {
        Ok(client) => client,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };
    info!("Connected to {} as {}", args.url, client.peer_id());
    let (relay, events) = client.into_parts();

    let mux = Multiplexer::new();
    mux.subscribe_to::<ChatMessage, _>(|msg| println!("peer> {}", msg.text));
    mux.subscribe_to::<LoveNote, _>(|note| println!("peer <3 {}", note.text));

    let files = FileTransfers::install(&mux, TransferConfig::default())?;
    let mut transfers = files.subscribe();
    let received = Arc::clone(&files);
    tokio::spawn(async move {
        while let Ok(event) = transfers.recv().await {
            match event {
                TransferEvent::Completed(record) if record.direction == TransferDirection::Receiving => {
                    let size = received.take_received(&record.id).map(|b| b.len()).unwrap_or(0);
                    println!("received '{}' ({} bytes)", record.name, size);
                }
                TransferEvent::Failed(record) => {
                    println!("transfer '{}' failed: {}", record.name, record.error.unwrap_or_default());
                }
                _ => {}
            }
        }
    });

    let negotiator = Negotiator::new(
        SessionConfig::default(),
        Arc::new(RtcTransportFactory::new()),
        Arc::new(relay.clone()),
        Arc::clone(&mux),
    )?;
    let controller = Arc::new(SessionController::new(negotiator.clone()));

    let mut states = negotiator.subscribe();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = states.borrow_and_update().state;
            println!("-- {:?}", state);
        }
    });

    let runner = Arc::clone(&controller);
    tokio::spawn(async move { runner.run(events).await });
    relay.join_room(&args.room)?;
    println!("joined '{}'; waiting for a peer", args.room);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "/end" {
                    negotiator.end_call().await?;
                } else if let Some(path) = line.strip_prefix("/send ") {
                    if let Err(e) = files.send_path(path.trim(), None).await {
                        warn!("Sending {} failed: {}", path, e);
                    }
                } else if negotiator.state() != NegotiationState::Connected {
                    println!("not connected yet");
                } else {
                    let sent = match line.strip_prefix("/love ") {
                        Some(text) => mux.send_envelope(&LoveNote { text: text.to_string() }).await,
                        None => mux.send_envelope(&ChatMessage::text(line)).await,
                    };
                    if let Err(e) = sent {
                        warn!("Message not sent: {}", e);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    negotiator.end_call().await?;
    relay.close();
    Ok(())
}
