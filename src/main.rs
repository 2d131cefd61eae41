use anyhow::{bail, Context, Result};
use bitkad::dht::Dht;
use bitkad::peer::{Engine, EngineConfig};
use bitkad::piece::PieceManager;
use bitkad::torrent::file::TorrentFile;
use bitkad::torrent::magnet::MagnetLink;
use bitkad::tracker::{self, AnnounceEvent, AnnounceRequest};
use clap::Parser;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "bitkad", about = "BitTorrent client core: DHT peer discovery and piece exchange")]
struct Cli {
    /// Path to a .torrent file, or a magnet link
    source: String,

    /// TCP listen port for peer connections
    #[clap(short, long, default_value = "6881")]
    port: u16,

    /// UDP port for the DHT node
    #[clap(long, default_value = "6881")]
    dht_port: u16,

    /// DHT bootstrap contact (ip:port); may be given multiple times
    #[clap(short, long)]
    bootstrap: Vec<SocketAddr>,

    /// Skip the HTTP tracker and rely on the DHT alone
    #[clap(long)]
    no_tracker: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Cli::parse();

    if args.source.starts_with("magnet:") {
        return discover_for_magnet(&args).await;
    }
    download(&args).await
}

/// Magnet links only surface the fingerprint in this core; run a DHT lookup for it
/// and report the discovered peers.
async fn discover_for_magnet(args: &Cli) -> Result<()> {
    let magnet = MagnetLink::parse(&args.source).context("parsing magnet link")?;
    tracing::info!(
        info_hash = %hex::encode(magnet.info_hash),
        name = magnet.display_name.as_deref().unwrap_or("<unnamed>"),
        "Parsed magnet link"
    );
    if args.bootstrap.is_empty() {
        bail!("magnet discovery needs at least one --bootstrap contact");
    }

    let dht = Dht::bind(SocketAddr::from(([0, 0, 0, 0], args.dht_port))).await?;
    dht.bootstrap(&args.bootstrap).await;
    let peers = dht.lookup_peers(magnet.info_hash).await;
    for peer in &peers {
        println!("{}", peer);
    }
    tracing::info!(count = peers.len(), "DHT lookup finished");
    dht.shutdown();
    Ok(())
}

async fn download(args: &Cli) -> Result<()> {
    let torrent = TorrentFile::from_file(&args.source).context("parsing torrent file")?;
    tracing::info!(
        name = %torrent.info.name,
        pieces = torrent.num_pieces(),
        total = torrent.total_length(),
        "Loaded torrent"
    );

    let (manager, events) = PieceManager::in_memory(
        torrent.pieces_hash.clone(),
        torrent.info.piece_length as usize,
        torrent.total_length() as u64,
    );
    let pieces = Arc::new(manager);

    let peer_id = tracker::generate_peer_id()?;
    let engine = Engine::new(
        torrent.info_hash,
        peer_id,
        pieces.clone(),
        events,
        EngineConfig {
            listen_port: args.port,
            ..EngineConfig::default()
        },
    );
    engine.listen().await.context("binding peer listener")?;

    // collect candidate peers from the tracker and the DHT
    let mut candidates: Vec<SocketAddr> = Vec::new();

    if !args.no_tracker {
        let client = tracker::Client::with_peer_id(peer_id, args.port);
        let request = AnnounceRequest {
            info_hash: torrent.info_hash,
            uploaded: 0,
            downloaded: 0,
            left: torrent.total_length(),
            event: AnnounceEvent::Started,
            compact: true,
        };
        match client.announce(&torrent.announce, &request).await {
            Ok(response) => {
                tracing::info!(peers = response.peers.len(), "Tracker announce ok");
                candidates.extend(
                    response
                        .peers
                        .iter()
                        .map(|peer| SocketAddr::new(peer.ip, peer.port)),
                );
            }
            Err(e) => tracing::warn!(error = %e, "Tracker announce failed"),
        }
    }

    let dht = Dht::bind(SocketAddr::from(([0, 0, 0, 0], args.dht_port))).await?;
    if !args.bootstrap.is_empty() {
        dht.bootstrap(&args.bootstrap).await;
        let found = dht.announce(torrent.info_hash, args.port).await;
        tracing::info!(peers = found.len(), "DHT lookup ok");
        candidates.extend(found.iter().map(|peer: &SocketAddrV4| SocketAddr::V4(*peer)));
    }

    candidates.sort();
    candidates.dedup();
    tracing::info!(count = candidates.len(), "Dialing candidate peers");
    for addr in candidates {
        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.connect(addr).await {
                tracing::debug!(?addr, error = %e, "Peer connect failed");
            }
        });
    }

    // report progress until the download completes or the operator interrupts
    let mut progress = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, shutting down");
                break;
            }
            _ = progress.tick() => {
                tracing::info!(
                    verified = pieces.verified_count(),
                    total = pieces.num_pieces(),
                    peers = engine.num_peers(),
                    "Progress"
                );
                if pieces.is_complete() {
                    tracing::info!("Download complete, seeding until interrupted");
                }
            }
        }
    }

    engine.shutdown();
    dht.shutdown();
    Ok(())
}
