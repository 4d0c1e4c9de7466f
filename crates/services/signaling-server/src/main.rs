//! Signaling server binary entry point
//!
//! Runs the room-scoped signaling relay that two peers use to exchange
//! offers, answers and ICE candidates before their direct connection exists.
//!
//! # Usage
//!
//! ```bash
//! # Start the relay (default: 0.0.0.0:3001, two peers per room)
//! cargo run -p duetlink-signaling-server -- serve
//!
//! # Allow any number of peers per room, log as JSON
//! RELAY_MAX_ROOM_SIZE=0 cargo run -p duetlink-signaling-server -- --log-format json serve
//!
//! # Check that a relay is reachable
//! cargo run -p duetlink-signaling-server -- probe --url ws://localhost:3001
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use duetlink_webrtc::config::DEFAULT_RELAY_PORT;
use duetlink_webrtc::{Error, RelayConfig, RelayServer, SignalingClient, SignalingClientConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// DuetLink Signaling Server
///
/// Relays negotiation envelopes between the members of a room.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "text", env = "LOG_FORMAT")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay until Ctrl+C (default)
    Serve(ServeArgs),
    /// Connect to a relay once and report whether it is reachable
    Probe(ProbeArgs),
}

#[derive(clap::Args, Debug, Default)]
struct ServeArgs {
    /// Listening host [default: 0.0.0.0]
    #[arg(long, env = "HOST")]
    host: Option<String>,

    /// Listening port; falls back to SIGNALING_PORT, then 3001
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Maximum peers per room, 0 for unbounded [default: 2]
    #[arg(long, env = "RELAY_MAX_ROOM_SIZE")]
    max_room_size: Option<usize>,
}

#[derive(clap::Args, Debug)]
struct ProbeArgs {
    /// Relay URL to probe
    #[arg(long, env = "SIGNALING_URL", default_value = "ws://localhost:3001")]
    url: String,

    /// Connection timeout in milliseconds
    #[arg(long, default_value_t = 10_000)]
    timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("signaling-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> anyhow::Result<()> {
    init_tracing(cli.log_format);

    match cli.command.unwrap_or(Command::Serve(ServeArgs::default())) {
        Command::Serve(args) => {
            let signaling_port = std::env::var("SIGNALING_PORT").ok();
            let config = relay_config(&args, signaling_port.as_deref())?;
            serve(config).await
        }
        Command::Probe(args) => {
            if !probe(&args).await {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

/// Build the relay configuration from CLI/env values
fn relay_config(args: &ServeArgs, signaling_port: Option<&str>) -> anyhow::Result<RelayConfig> {
    let port = match (args.port, signaling_port) {
        (Some(port), _) => port,
        (None, Some(raw)) => raw
            .trim()
            .parse()
            .with_context(|| format!("SIGNALING_PORT is not a valid port: {:?}", raw))?,
        (None, None) => DEFAULT_RELAY_PORT,
    };

    let mut config = RelayConfig::default().with_port(port);
    if let Some(host) = &args.host {
        config = config.with_host(host);
    }
    if let Some(max) = args.max_room_size {
        config = config.with_max_room_size((max > 0).then_some(max));
    }
    config.validate()?;
    Ok(config)
}

async fn serve(config: RelayConfig) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        max_room_size = ?config.max_room_size,
        "DuetLink signaling server starting"
    );

    let handle = RelayServer::new(config)?
        .start()
        .await
        .context("failed to start the signaling relay")?;
    info!("Signaling server running on {}", handle.url());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    info!("Shutdown signal received, stopping relay...");

    handle.shutdown().await;
    info!("Signaling server shut down gracefully");
    Ok(())
}

/// Single connection attempt; prints the outcome
async fn probe(args: &ProbeArgs) -> bool {
    let config = SignalingClientConfig::new(&args.url)
        .with_max_connect_attempts(1)
        .with_connect_timeout_ms(args.timeout_ms);

    match SignalingClient::connect(config).await {
        Ok(client) => {
            println!("Connected to {} (peer id {})", args.url, client.peer_id());
            client.handle().close();
            true
        }
        Err(Error::SignalingError(diagnostic)) => {
            eprintln!("{}", diagnostic);
            false
        }
        Err(e) => {
            eprintln!("Failed to connect to signaling server.\n\nError: {}", e);
            false
        }
    }
}

fn init_tracing(format: LogFormat) {
    // RUST_LOG wins; default to info
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = relay_config(&ServeArgs::default(), None).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, DEFAULT_RELAY_PORT);
        assert_eq!(config.max_room_size, Some(2));
    }

    #[test]
    fn test_port_precedence() {
        let explicit = ServeArgs {
            port: Some(4000),
            ..Default::default()
        };
        assert_eq!(relay_config(&explicit, Some("5000")).unwrap().port, 4000);
        assert_eq!(relay_config(&ServeArgs::default(), Some("5000")).unwrap().port, 5000);
        assert!(relay_config(&ServeArgs::default(), Some("not-a-port")).is_err());
    }

    #[test]
    fn test_zero_room_size_is_unbounded() {
        let args = ServeArgs {
            max_room_size: Some(0),
            ..Default::default()
        };
        assert_eq!(relay_config(&args, None).unwrap().max_room_size, None);

        let args = ServeArgs {
            max_room_size: Some(3),
            host: Some("127.0.0.1".to_string()),
            ..Default::default()
        };
        let config = relay_config(&args, None).unwrap();
        assert_eq!(config.max_room_size, Some(3));
        assert_eq!(config.bind_address(), "127.0.0.1:3001");
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["signaling-server", "--log-format", "json", "probe", "--url", "ws://h:1"])
            .unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
        assert!(matches!(cli.command, Some(Command::Probe(ProbeArgs { ref url, .. })) if url == "ws://h:1"));

        let cli = Cli::try_parse_from(["signaling-server"]).unwrap();
        assert!(cli.command.is_none());
    }
}
