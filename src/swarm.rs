//! Placeholder downloads backed by a live swarm: peers come from trackers,
//! the DHT and injection, and the first peer that serves verified
//! `ut_metadata` fills the placeholder file.

use crate::augment::DHT_ANNOUNCE_SCHEME;
use crate::bootstrap::{DownloadEvent, PlaceholderDownload, SyntheticTorrent, TransferEngine};
use crate::config::Config;
use crate::dht::{Dht, DhtEvent, ReadFlags};
use crate::hash::InfoHash;
use crate::network::Network;
use crate::verify;
use crate::wire::MetadataPeer;
use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use rbit::peer::PeerId;
use rbit::tracker::{AnnounceParams, TrackerClient, TrackerEvent};
use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{Duration, timeout};
use tokio_util::sync::CancellationToken;

const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(6);
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy)]
struct SwarmParams {
    connect_timeout: Duration,
    max_metadata: u64,
    peer_inflight: usize,
}

pub struct SwarmEngine {
    dht: Option<Arc<dyn Dht>>,
    tracker: Arc<TrackerClient>,
    params: SwarmParams,
}

impl SwarmEngine {
    pub fn new(cfg: &Config, dht: Option<Arc<dyn Dht>>) -> Self {
        Self {
            dht,
            tracker: Arc::new(TrackerClient::new()),
            params: SwarmParams {
                connect_timeout: Duration::from_millis(cfg.peer_connect_timeout_ms),
                max_metadata: cfg.placeholder_size,
                peer_inflight: cfg.dht_contact_inflight.max(1),
            },
        }
    }
}

#[async_trait]
impl TransferEngine for SwarmEngine {
    async fn add_placeholder_download(
        &self,
        torrent: &SyntheticTorrent,
        data_file: &Path,
    ) -> anyhow::Result<(Arc<dyn PlaceholderDownload>, mpsc::Receiver<DownloadEvent>)> {
        let (events_tx, events_rx) = mpsc::channel(64);
        let (download, filled, peers) = SwarmDownload::new(data_file.to_path_buf());
        let download = Arc::new(download);

        let swarm = Swarm {
            torrent: torrent.clone(),
            data_file: data_file.to_path_buf(),
            dht: self.dht.clone(),
            tracker: self.tracker.clone(),
            params: self.params,
            events: events_tx,
            filled,
            injector: download.peers.clone(),
        };
        let stop = download.stop.clone();
        let started = download.started.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = started.notified() => {}
            }
            swarm.run(peers, stop).await;
        });

        Ok((download, events_rx))
    }
}

struct SwarmDownload {
    data_file: PathBuf,
    filled: watch::Receiver<u64>,
    peers: mpsc::UnboundedSender<SocketAddr>,
    started: Arc<Notify>,
    stop: CancellationToken,
}

impl SwarmDownload {
    fn new(
        data_file: PathBuf,
    ) -> (Self, watch::Sender<u64>, mpsc::UnboundedReceiver<SocketAddr>) {
        let (filled_tx, filled_rx) = watch::channel(0u64);
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        let download = Self {
            data_file,
            filled: filled_rx,
            peers: peers_tx,
            started: Arc::new(Notify::new()),
            stop: CancellationToken::new(),
        };
        (download, filled_tx, peers_rx)
    }
}

#[async_trait]
impl PlaceholderDownload for SwarmDownload {
    fn force_start(&self) {
        self.started.notify_one();
    }

    fn add_peer(&self, addr: SocketAddr) {
        let _ = self.peers.send(addr);
    }

    fn read_channel(
        &self,
        offset: u64,
        len: u64,
        max_chunk: usize,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<anyhow::Result<Bytes>> {
        let (tx, rx) = mpsc::channel(8);
        let mut filled = self.filled.clone();
        let path = self.data_file.clone();
        let stop = self.stop.clone();
        tokio::spawn(async move {
            let end = offset + len;
            let ready = tokio::select! {
                _ = cancel.cancelled() => false,
                _ = stop.cancelled() => false,
                r = filled.wait_for(|&have| have >= end) => r.is_ok(),
            };
            if !ready {
                return;
            }
            if let Err(err) = stream_range(&path, offset, len, max_chunk.max(1), &tx, &cancel).await {
                let _ = tx.send(Err(err)).await;
            }
        });
        rx
    }

    async fn remove(&self) {
        self.stop.cancel();
    }
}

async fn stream_range(
    path: &Path,
    offset: u64,
    len: u64,
    max_chunk: usize,
    tx: &mpsc::Sender<anyhow::Result<Bytes>>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("open {}", path.display()))?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;

    let mut left = len;
    while left > 0 {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let n = (max_chunk as u64).min(left) as usize;
        let mut buf = vec![0u8; n];
        file.read_exact(&mut buf).await?;
        if tx.send(Ok(Bytes::from(buf))).await.is_err() {
            return Ok(());
        }
        left -= n as u64;
    }
    Ok(())
}

struct Swarm {
    torrent: SyntheticTorrent,
    data_file: PathBuf,
    dht: Option<Arc<dyn Dht>>,
    tracker: Arc<TrackerClient>,
    params: SwarmParams,
    events: mpsc::Sender<DownloadEvent>,
    filled: watch::Sender<u64>,
    injector: mpsc::UnboundedSender<SocketAddr>,
}

impl Swarm {
    async fn run(self, mut peers: mpsc::UnboundedReceiver<SocketAddr>, stop: CancellationToken) {
        let target = self.torrent.target;
        let discovery = stop.child_token();
        let _discovery_guard = discovery.clone().drop_guard();
        if self.torrent.networks.contains(Network::Public) {
            self.discover(discovery.clone());
        }

        let mut seen: HashSet<SocketAddr> = HashSet::new();
        let mut pending: VecDeque<SocketAddr> = VecDeque::new();
        let mut attempts: JoinSet<(SocketAddr, anyhow::Result<Vec<u8>>)> = JoinSet::new();
        let mut failures_logged = 0usize;

        loop {
            while attempts.len() < self.params.peer_inflight {
                let Some(addr) = pending.pop_front() else { break };
                attempts.spawn(attempt_peer(addr, target, self.params, self.events.clone()));
            }

            tokio::select! {
                _ = stop.cancelled() => break,
                addr = peers.recv() => {
                    let Some(addr) = addr else { break };
                    let net = Network::classify_host(&addr.ip().to_string());
                    if self.torrent.networks.contains(net) && seen.insert(addr) {
                        pending.push_back(addr);
                    }
                }
                Some(joined) = attempts.join_next(), if !attempts.is_empty() => {
                    let Ok((addr, result)) = joined else { continue };
                    let err = match result {
                        Ok(bytes) => match self.fill(&bytes).await {
                            Ok(()) => {
                                let len = bytes.len() as u64;
                                tracing::debug!(hash = %target, peer = %addr, bytes = len, "swarm: metadata filled");
                                discovery.cancel();
                                self.filled.send_replace(len);
                                break;
                            }
                            Err(err) => format!("{err:#}"),
                        },
                        Err(err) => format!("{err:#}"),
                    };
                    if failures_logged < 2 {
                        tracing::debug!(hash = %target, peer = %addr, err = %err, "swarm: peer failed");
                        failures_logged += 1;
                    } else {
                        tracing::trace!(hash = %target, peer = %addr, err = %err, "swarm: peer failed");
                    }
                }
            }
        }

        attempts.abort_all();
        // Keep the event stream open until the owner removes the download.
        stop.cancelled().await;
    }

    /// Verifies `info` against the target and writes it at offset 0.
    async fn fill(&self, info: &[u8]) -> anyhow::Result<()> {
        verify::check_info_hash(info, &self.torrent.target)?;
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&self.data_file)
            .await
            .with_context(|| format!("open {}", self.data_file.display()))?;
        file.write_all(info).await?;
        file.flush().await?;
        Ok(())
    }

    fn discover(&self, stop: CancellationToken) {
        let key = self.torrent.target.dht_key();

        for url in self.torrent.trackers.iter().filter(|t| !t.starts_with(DHT_ANNOUNCE_SCHEME)) {
            let tracker = self.tracker.clone();
            let url = url.clone();
            let injector = self.injector.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                let peers = tokio::select! {
                    _ = stop.cancelled() => return,
                    p = announce_peers(&tracker, &url, key) => p,
                };
                for p in peers {
                    let _ = injector.send(p);
                }
            });
        }

        if let Some(dht) = self.dht.clone().filter(|d| d.is_available()) {
            let injector = self.injector.clone();
            tokio::spawn(async move {
                let flags = ReadFlags {
                    exhaustive: true,
                    high_priority: false,
                };
                let mut rx = match dht.read(key, DISCOVERY_TIMEOUT, flags).await {
                    Ok(rx) => rx,
                    Err(err) => {
                        tracing::debug!(%err, "swarm: dht discovery failed");
                        return;
                    }
                };
                loop {
                    let ev = tokio::select! {
                        _ = stop.cancelled() => return,
                        ev = rx.recv() => ev,
                    };
                    match ev {
                        Some(DhtEvent::ValueRead(contact)) => {
                            let _ = injector.send(contact.address());
                        }
                        Some(DhtEvent::Complete) | Some(DhtEvent::TimedOut) | None => return,
                    }
                }
            });
        }
    }
}

async fn attempt_peer(
    addr: SocketAddr,
    target: InfoHash,
    params: SwarmParams,
    events: mpsc::Sender<DownloadEvent>,
) -> (SocketAddr, anyhow::Result<Vec<u8>>) {
    let result = async {
        let peer = MetadataPeer::connect(addr, target.dht_key(), params.connect_timeout).await?;
        let _ = events.send(DownloadEvent::PeerAdded(addr)).await;
        let declared = peer.metadata_size();
        if declared.is_some() {
            let _ = events
                .send(DownloadEvent::PeerTransferring {
                    peer: addr,
                    metadata_size: declared,
                })
                .await;
        }
        let bytes = peer.fetch(params.max_metadata, FETCH_TIMEOUT).await?;
        if declared.is_none() {
            let _ = events
                .send(DownloadEvent::PeerTransferring {
                    peer: addr,
                    metadata_size: Some(bytes.len() as u64),
                })
                .await;
        }
        Ok(bytes)
    }
    .await;
    (addr, result)
}

async fn announce_peers(tracker: &TrackerClient, url: &str, key: [u8; 20]) -> Vec<SocketAddr> {
    let Ok(info_hash) = rbit::metainfo::InfoHash::from_hex(&hex::encode(key)) else {
        return Vec::new();
    };
    let peer_id = *PeerId::generate().as_bytes();
    let params = AnnounceParams {
        url,
        info_hash: &info_hash,
        peer_id: &peer_id,
        port: 6881,
        uploaded: 0,
        downloaded: 0,
        left: 1,
        event: TrackerEvent::Started,
    };
    match timeout(ANNOUNCE_TIMEOUT, tracker.announce(params)).await {
        Ok(Ok(resp)) => resp.peers.into_iter().chain(resp.peers6).collect(),
        Ok(Err(err)) => {
            tracing::debug!(%err, tracker = %url, "swarm: announce failed");
            Vec::new()
        }
        Err(_) => Vec::new(),
    }
}
