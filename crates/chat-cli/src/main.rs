use anyhow::{Context, Result};
use chat_node::{ChatTarget, InboundMessage, Node, NodeConfig, NodeIdentity};
use clap::{Parser, Subcommand};
use libp2p::Multiaddr;
use once_cell::sync::Lazy;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{self, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines, Stdin};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

static LOGGING: Lazy<()> = Lazy::new(|| {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
});

#[derive(Parser, Debug)]
#[command(name = "p2p-chat", version, about = "Peer-to-peer chat over libp2p")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a node and chat with one peer
    Run {
        /// Listen multiaddr; defaults to a random TCP port on all interfaces
        #[arg(long)]
        listen: Vec<String>,
        /// Extra Kademlia bootstrap peer (multiaddr ending in /p2p/<id>)
        #[arg(long)]
        bootstrap: Vec<String>,
        /// Do not use the public IPFS bootstrap peers
        #[arg(long)]
        no_default_bootstrap: bool,
        /// Also listen and dial over QUIC
        #[arg(long)]
        quic: bool,
        /// Serve Prometheus metrics on this socket
        #[arg(long, value_name = "SOCKET")]
        metrics: Option<SocketAddr>,
        /// Seconds to wait for a message to be acknowledged
        #[arg(long, default_value_t = 30)]
        request_timeout: u64,
        #[arg(long, value_name = "PATH")]
        identity: Option<PathBuf>,
        #[arg(long, value_name = "PATH")]
        identity_out: Option<PathBuf>,
        /// Peer to chat with; prompted for on stdin when absent
        #[arg(long)]
        peer: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    Lazy::force(&LOGGING);
    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            listen,
            bootstrap,
            no_default_bootstrap,
            quic,
            metrics,
            request_timeout,
            identity,
            identity_out,
            peer,
        } => {
            let config = build_config(
                listen,
                bootstrap,
                no_default_bootstrap,
                quic,
                metrics,
                request_timeout,
            )?;
            run_chat(config, identity, identity_out, peer).await
        }
    }
}

fn build_config(
    listen: Vec<String>,
    bootstrap: Vec<String>,
    no_default_bootstrap: bool,
    quic: bool,
    metrics: Option<SocketAddr>,
    request_timeout: u64,
) -> Result<NodeConfig> {
    let mut config = NodeConfig::default();
    if !listen.is_empty() {
        config.listen_addrs = parse_addrs(listen).context("parse listen multiaddr")?;
    }
    if no_default_bootstrap {
        config.bootstrap.clear();
    }
    config
        .bootstrap
        .extend(parse_addrs(bootstrap).context("parse bootstrap multiaddr")?);
    config.enable_quic = quic;
    config.metrics_addr = metrics;
    config.request_timeout = Duration::from_secs(request_timeout);
    Ok(config)
}

fn parse_addrs(addrs: Vec<String>) -> Result<Vec<Multiaddr>> {
    Ok(addrs
        .into_iter()
        .map(|addr| addr.parse())
        .collect::<Result<Vec<_>, _>>()?)
}

async fn run_chat(
    config: NodeConfig,
    identity_path: Option<PathBuf>,
    identity_out: Option<PathBuf>,
    peer: Option<String>,
) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "starting chat");

    let identity = if let Some(path) = identity_path {
        let bytes = fs::read(&path).with_context(|| format!("read identity from {path:?}"))?;
        NodeIdentity::from_keypair_bytes(&bytes)?
    } else {
        NodeIdentity::default()
    };

    if let Some(path) = identity_out {
        let bytes = identity.to_keypair_bytes()?;
        fs::write(&path, &bytes).with_context(|| format!("write identity to {path:?}"))?;
    }

    let (node, handle) = Node::new(config, identity).await?;
    println!("My PeerId:{}", node.peer_id());

    let display_task = tokio::spawn(print_inbound(node.subscribe(), io::stdout()));
    let node_task = node.spawn();

    let mut lines = BufReader::new(io::stdin()).lines();
    let raw_target = match peer {
        Some(peer) => peer,
        None => {
            println!("Enter PeerId of other node:");
            read_line(&mut lines).await?.unwrap_or_default()
        }
    };
    let target = ChatTarget::parse(&raw_target)?;
    if let Some(addr) = target.address {
        handle.address_book().add(target.peer_id, addr).await;
    }

    let session = handle.session();
    println!("Type message:");
    while let Some(line) = read_line(&mut lines).await? {
        let message = line.trim_end();
        if let Err(e) = session.send(&target.peer_id, message).await {
            error!(peer_id = ?target.peer_id, error = %e, "message not delivered");
            println!("failed to send: {e}");
        }
    }

    info!("stdin closed, shutting down");
    node_task.abort();
    display_task.abort();
    Ok(())
}

/// Prints inbound messages until the node goes away. Falling behind only
/// loses the skipped messages.
async fn print_inbound<W>(mut inbound: broadcast::Receiver<InboundMessage>, mut out: W)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let msg = match inbound.recv().await {
            Ok(msg) => msg,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "display fell behind, messages dropped");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let line = format!("received msg:{}\n", msg.text);
        if let Err(e) = out.write_all(line.as_bytes()).await {
            error!(?e, "failed to write inbound message");
            break;
        }
        if let Err(e) = out.flush().await {
            error!(?e, "failed to flush stdout");
            break;
        }
    }
}

async fn read_line(lines: &mut Lines<BufReader<Stdin>>) -> Result<Option<String>> {
    lines.next_line().await.context("read stdin")
}
