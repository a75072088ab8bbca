//! beacond — Beacon discovery tracker and client CLI.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc::UnboundedReceiver;

use beacon_discovery::{Discovery, DiscoveryConfig, DiscoveryEvent};

#[derive(Parser, Debug)]
#[command(name = "beacond")]
#[command(about = "Peer discovery over repurposed DNS")]
#[command(version)]
struct Cli {
    /// Tracker address, `host[:port[,secondaryPort]]`. Repeatable.
    #[arg(long = "tracker", global = true)]
    trackers: Vec<String>,

    /// DNS suffix topics are published under.
    #[arg(long, global = true)]
    domain: Option<String>,

    /// Disable link-local multicast discovery.
    #[arg(long, global = true)]
    no_multicast: bool,

    /// Announce port "0" so trackers use the observed source port.
    #[arg(long, global = true)]
    implied_port: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run as a tracker server.
    Serve {
        /// Listen port. Repeatable; defaults to 53 and 5300.
        #[arg(long = "port")]
        ports: Vec<u16>,
        /// Peer-store entry lifetime in seconds. 0 keeps entries forever.
        #[arg(long)]
        ttl: Option<u64>,
        /// Peer-store size cap across all topics.
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Publish that this host serves a topic on a port.
    Announce {
        topic: String,
        #[arg(long)]
        port: u16,
        /// Seconds to keep printing peers that come back.
        #[arg(long, default_value_t = 2)]
        wait: u64,
    },
    /// Retract a published mapping.
    Unannounce {
        topic: String,
        #[arg(long)]
        port: u16,
    },
    /// Find peers serving a topic.
    Lookup {
        topic: String,
        /// Seconds to wait for answers.
        #[arg(long, default_value_t = 2)]
        wait: u64,
    },
    /// Ask the configured trackers how they see this host.
    Whoami,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = DiscoveryConfig::load().context("failed to load config")?;
    if !cli.trackers.is_empty() {
        config.trackers = cli.trackers.clone();
    }
    if let Some(domain) = &cli.domain {
        config.domain = domain.clone();
    }
    if cli.no_multicast {
        config.multicast = false;
    }
    if cli.implied_port {
        config.implied_port = true;
    }

    match cli.command {
        Command::Serve { ports, ttl, limit } => {
            if let Some(ttl) = ttl {
                config.ttl_secs = ttl;
            }
            if let Some(limit) = limit {
                config.limit = limit;
            }
            serve(config, &ports).await
        }
        Command::Announce { topic, port, wait } => {
            let (discovery, mut events) = Discovery::new(config).await?;
            match discovery.announce(topic.as_str(), port).await {
                Ok(()) => tracing::info!(topic, port, "announced"),
                Err(e) => tracing::warn!(topic, error = %e, "announce incomplete"),
            }
            print_peers(&mut events, wait).await;
            discovery.destroy();
            Ok(())
        }
        Command::Unannounce { topic, port } => {
            let (discovery, _events) = Discovery::new(config).await?;
            discovery
                .unannounce(topic.as_str(), port)
                .await
                .with_context(|| format!("failed to unannounce {topic}"))?;
            tracing::info!(topic, port, "unannounced");
            discovery.destroy();
            Ok(())
        }
        Command::Lookup { topic, wait } => {
            let (discovery, mut events) = Discovery::new(config).await?;
            if let Err(e) = discovery.lookup(topic.as_str()).await {
                tracing::warn!(topic, error = %e, "lookup incomplete");
            }
            print_peers(&mut events, wait).await;
            discovery.destroy();
            Ok(())
        }
        Command::Whoami => {
            let (discovery, _events) = Discovery::new(config).await?;
            let observed = discovery.whoami().await.context("whoami failed")?;
            println!("{observed}");
            discovery.destroy();
            Ok(())
        }
    }
}

async fn serve(config: DiscoveryConfig, ports: &[u16]) -> Result<()> {
    let (discovery, mut events) = Discovery::new(config).await?;
    let bound = discovery
        .listen(ports)
        .await
        .context("failed to bind tracker ports")?;
    tracing::info!(
        instance = discovery.instance_id(),
        ports = ?bound,
        "tracker running"
    );

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(DiscoveryEvent::Peer { topic, peer }) => {
                    tracing::info!(%topic, %peer, "peer registered");
                }
                Some(DiscoveryEvent::Error { message }) => {
                    tracing::warn!(%message, "transport error");
                }
                Some(DiscoveryEvent::Listening) => {
                    tracing::info!("all tracker sockets bound");
                }
                Some(DiscoveryEvent::Close) | None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                discovery.destroy();
                break;
            }
        }
    }
    Ok(())
}

/// Print `topic host:port` lines for peer events until the deadline.
async fn print_peers(events: &mut UnboundedReceiver<DiscoveryEvent>, wait: u64) {
    let deadline = tokio::time::sleep(Duration::from_secs(wait));
    tokio::pin!(deadline);
    let mut seen = HashSet::new();
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Some(DiscoveryEvent::Peer { topic, peer }) => {
                    if seen.insert((topic.clone(), peer)) {
                        println!("{topic} {peer}");
                    }
                }
                Some(_) => {}
                None => break,
            },
        }
    }
}
