//! headlink CLI
//!
//! Controller/head UDP data link: STUN discovery, hole punching and a stdio
//! signaling session.

mod adapter;
mod config;

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use config::Config;
use headlink_nat::{CandidateGatherer, HolePuncher, StunClient};
use headlink_transport::{Transport, UdpTransport};

/// headlink - direct UDP link between a controller and a head device
#[derive(Parser)]
#[command(name = "headlink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print this host's server-reflexive address
    Stun {
        /// STUN server as host:port (overrides the config file)
        #[arg(short, long)]
        server: Option<String>,
    },

    /// Gather candidates and print them as JSON
    Gather {
        /// Preferred local UDP port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Punch a hole towards a peer
    Punch {
        /// Peer address
        #[arg(short = 'P', long, required = true)]
        peer: SocketAddr,

        /// Local UDP port (0 for ephemeral)
        #[arg(short, long, default_value_t = 0)]
        port: u16,
    },

    /// Run a signaling session over stdin/stdout
    Session {
        /// This endpoint's id
        #[arg(short, long, required = true)]
        uid: String,

        /// Peer to connect to on startup
        #[arg(short, long)]
        initiate: Option<String>,

        /// Stream telemetry on the unreliable channel every N milliseconds
        #[arg(long)]
        telemetry_ms: Option<u64>,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };
    config.validate()?;

    // Initialize logging; stdout belongs to the signaling channel
    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Stun { server } => {
            query_stun(server, &config).await?;
        }
        Commands::Gather { port } => {
            gather_candidates(port, &config).await?;
        }
        Commands::Punch { peer, port } => {
            punch(peer, port, &config).await?;
        }
        Commands::Session {
            uid,
            initiate,
            telemetry_ms,
        } => {
            let session_config = config.session_config(&uid)?;
            let telemetry = telemetry_ms.filter(|&ms| ms > 0).map(Duration::from_millis);
            adapter::run_session(session_config, initiate, telemetry).await?;
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

/// Query the STUN server once
async fn query_stun(server: Option<String>, config: &Config) -> anyhow::Result<()> {
    let mut stun_config = config
        .stun_config()
        .ok_or_else(|| anyhow::anyhow!("STUN is disabled in the configuration"))?;
    if let Some(server) = server {
        stun_config.server = server;
    }

    let transport = UdpTransport::bind(SocketAddr::from(([0, 0, 0, 0], 0))).await?;
    tracing::info!(
        "Querying {} from {}",
        stun_config.server,
        transport.local_addr()?
    );

    let client = StunClient::new(stun_config);
    let mapped = client.query(&transport).await;
    transport.close().await?;

    println!("{}", mapped?);
    Ok(())
}

/// Gather candidates the way a handshake would
async fn gather_candidates(port: Option<u16>, config: &Config) -> anyhow::Result<()> {
    let gatherer = match config.stun_config() {
        Some(stun) => CandidateGatherer::new(Arc::new(StunClient::new(stun))),
        None => CandidateGatherer::host_only(),
    };

    let (transport, candidates) = gatherer
        .gather(&config.local_addresses()?, port.or(config.handshake.udp_port))
        .await?;
    transport.close().await?;

    println!("{}", serde_json::to_string_pretty(&candidates)?);
    Ok(())
}

/// One hole punching attempt from a local port
async fn punch(peer: SocketAddr, port: u16, config: &Config) -> anyhow::Result<()> {
    let transport: Arc<dyn Transport> =
        Arc::new(UdpTransport::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?);
    let local = transport.local_addr()?;

    println!("Punching {} from {}", peer, local);
    let puncher = HolePuncher::new(Arc::clone(&transport), config.punch_config());
    let opened = puncher.punch(peer).await;
    transport.close().await?;

    if !opened {
        anyhow::bail!(
            "No answer from {} after {} probes",
            peer,
            config.punch.max_attempts
        );
    }
    println!("Path to {} is open", peer);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_session_command() {
        let cli = Cli::try_parse_from([
            "headlink",
            "-v",
            "session",
            "--uid",
            "controller",
            "--initiate",
            "head",
            "--telemetry-ms",
            "50",
        ])
        .unwrap();

        assert!(cli.verbose);
        match cli.command {
            Commands::Session {
                uid,
                initiate,
                telemetry_ms,
            } => {
                assert_eq!(uid, "controller");
                assert_eq!(initiate.as_deref(), Some("head"));
                assert_eq!(telemetry_ms, Some(50));
            }
            _ => panic!("expected session command"),
        }
    }

    #[test]
    fn test_punch_requires_peer() {
        assert!(Cli::try_parse_from(["headlink", "punch"]).is_err());
        assert!(Cli::try_parse_from(["headlink", "punch", "--peer", "127.0.0.1:4000"]).is_ok());
    }
}
