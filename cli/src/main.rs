// passage: NAT-to-NAT TCP tunnels over a code-addressed relay
//
// Two peers, each behind NAT, exchange a short code minted by the
// rendezvous service and meet at the relay; a local bridge couples the
// relay connection to whatever is listening on the target port.

mod config;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use config::Config;
use passage_core::bridge::{BridgeStats, BridgeTarget};
use passage_core::gateway::{DisabledGateway, Gateway, GatewayProtocol, PortMapping};
use passage_core::peer::{HostSession, JoinSession, PeerConfig, PeerError};
use passage_core::relay::RelayServer;
use passage_core::rendezvous::{RendezvousClient, RendezvousServer};
use passage_core::{RelayConfig, RendezvousConfig, TlsPaths};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "passage")]
#[command(about = "Passage — NAT-to-NAT TCP tunnels over a code-addressed relay", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the rendezvous HTTP service
    Rendezvous,

    /// Run the relay TCP service
    Relay,

    /// Create a session, print its code and bridge the local target
    Host {
        /// Local target to expose: `host:port` or a bare port
        #[arg(short, long)]
        target: Option<String>,
    },

    /// Redeem a code and bridge the local target to the host's side
    Join {
        /// The code the host shared, e.g. AB12-CD34-EF56
        code: String,

        /// Local target to couple: `host:port` or a bare port
        #[arg(short, long)]
        target: Option<String>,
    },

    /// Show the liveness and expiry of a session
    Status {
        /// Session id returned by `host`
        session_id: String,
    },

    /// Manage the config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the active configuration
    Show,
    /// Write a default config file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\n{}", "Shutting down...".yellow());
            ctrl_c_cancel.cancel();
        }
    });

    match cli.command {
        Commands::Rendezvous => run_rendezvous(cancel).await,
        Commands::Relay => run_relay(cancel).await,
        Commands::Host { target } => run_host(target, cancel).await,
        Commands::Join { code, target } => run_join(code, target, cancel).await,
        Commands::Status { session_id } => run_status(session_id).await,
        Commands::Config { action } => run_config(action),
    }
}

async fn run_rendezvous(cancel: CancellationToken) -> Result<()> {
    let config = Config::load()?;
    let rendezvous_config = RendezvousConfig {
        port: config.server.rendezvous_port,
        secret: config.secret.clone(),
        session_ttl: Duration::from_secs(config.server.session_ttl_secs),
        ..RendezvousConfig::default()
    };

    let server = RendezvousServer::new(rendezvous_config, cancel);
    server.run().await.context("Rendezvous server failed")?;
    Ok(())
}

async fn run_relay(cancel: CancellationToken) -> Result<()> {
    let config = Config::load()?;
    let tls = if config.server.tls_cert.is_empty() || config.server.tls_key.is_empty() {
        None
    } else {
        Some(TlsPaths {
            cert: config.server.tls_cert.clone().into(),
            key: config.server.tls_key.clone().into(),
        })
    };

    let relay_config = RelayConfig {
        port: config.server.relay_port,
        secret: config.secret.clone(),
        pair_timeout: Duration::from_secs(config.server.pair_timeout_secs),
        max_session: Duration::from_secs(config.server.max_session_secs),
        rendezvous_url: Some(config.rendezvous_url.clone()),
        tls,
        ..RelayConfig::default()
    };

    let server = RelayServer::new(relay_config, cancel);
    let listener = server.bind().await.context("Failed to bind relay port")?;
    server.run(listener).await.context("Relay server failed")?;
    Ok(())
}

fn peer_config(config: &Config) -> PeerConfig {
    PeerConfig {
        rendezvous_url: config.rendezvous_url.clone(),
        relay_addr: config.relay_addr.clone(),
        relay_tls: config.relay_tls,
        ..PeerConfig::default()
    }
}

async fn run_host(target: Option<String>, cancel: CancellationToken) -> Result<()> {
    let config = Config::load()?;
    let target = parse_target(target.as_deref().unwrap_or(&config.target))?;

    let _mapping = open_gateway_mapping(&target);

    let mut session = HostSession::open(peer_config(&config))
        .await
        .context("Failed to open a host session")?;

    println!();
    println!("{}", "Session created.".green().bold());
    println!("  Share this code: {}", session.code().cyan().bold());
    println!("  Session id:      {}", session.session_id());
    println!();
    println!("{}", "Connected to relay; waiting for your peer...".green());

    // Announce the joiner once, in the background
    {
        let watcher = session.watcher();
        let watch_cancel = cancel.clone();
        tokio::spawn(async move {
            if watcher.wait(&watch_cancel).await {
                println!("{}", "Peer connected.".green().bold());
            }
        });
    }

    let result = bridge_and_report(session.run_bridge(target, cancel).await);

    // Tidy up the session; best-effort
    let _ = session.close().await;

    result
}

async fn run_join(code: String, target: Option<String>, cancel: CancellationToken) -> Result<()> {
    let config = Config::load()?;
    let target = parse_target(target.as_deref().unwrap_or(&config.target))?;

    let _mapping = open_gateway_mapping(&target);

    let mut session = JoinSession::open(&code, peer_config(&config))
        .await
        .context("Failed to join session")?;

    println!();
    println!("{}", "Joined session.".green().bold());
    println!("  Session id: {}", session.session_id());
    if session.host_connected() {
        println!("  Host is already at the relay.");
    }
    println!();
    println!("{}", "Connected to relay.".green());

    bridge_and_report(session.run_bridge(target, cancel).await)
}

async fn run_status(session_id: String) -> Result<()> {
    let config = Config::load()?;
    let rendezvous = RendezvousClient::new(&config.rendezvous_url);
    let status = rendezvous.session_status(&session_id).await?;

    println!("Session {}", status.session_id);
    println!("  host connected:   {}", yes_no(status.host_connected));
    println!("  joiner connected: {}", yes_no(status.join_connected));
    println!("  expires at:       {} (unix)", status.expires_at);
    Ok(())
}

fn run_config(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = Config::load()?;
            println!("{}", toml::to_string_pretty(&config)?);
            println!("# file: {}", Config::config_path()?.display());
        }
        ConfigAction::Init => {
            let path = Config::config_path()?;
            if path.exists() {
                bail!("{} already exists", path.display());
            }
            Config::default().save()?;
            println!("Wrote {}", path.display());
        }
    }
    Ok(())
}

/// Print the transfer counters once the tunnel ends
fn bridge_and_report(outcome: Result<Arc<BridgeStats>, PeerError>) -> Result<()> {
    let stats = outcome.context("Tunnel failed")?;

    println!(
        "Tunnel closed: {} bytes in, {} bytes out",
        stats.bytes_in(),
        stats.bytes_out()
    );
    if let Some(error) = stats.last_error() {
        println!("  last error: {}", error.red());
    }
    Ok(())
}

/// Best-effort gateway mapping for the target port. The capability is an
/// external collaborator; its absence never stops a flow.
fn open_gateway_mapping(target: &BridgeTarget) -> Option<(u16, DisabledGateway)> {
    let port = match target {
        BridgeTarget::Port(port) => *port,
        BridgeTarget::Addr(addr) => addr.rsplit_once(':')?.1.parse().ok()?,
    };

    let gateway = DisabledGateway;
    let mapping = PortMapping {
        protocol: GatewayProtocol::Tcp,
        external_port: port,
        internal_port: port,
        internal_address: passage_core::gateway::local_ip(),
        description: "Passage tunnel".to_string(),
        ttl: None,
    };

    match gateway.open(&mapping) {
        Ok(()) => {
            println!("Gateway mapping opened for port {port}");
            Some((port, gateway))
        }
        Err(e) => {
            tracing::debug!("No gateway mapping for port {}: {}", port, e);
            None
        }
    }
}

fn parse_target(input: &str) -> Result<BridgeTarget> {
    BridgeTarget::parse(input)
        .with_context(|| format!("Invalid target {input:?}; expected `host:port` or a port"))
}

fn yes_no(value: bool) -> ColoredString {
    if value {
        "yes".green()
    } else {
        "no".red()
    }
}
