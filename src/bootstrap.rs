use crate::augment::DHT_ANNOUNCE_SCHEME;
use crate::benc;
use crate::budget::Budget;
use crate::config::Config;
use crate::error::ResolveError;
use crate::hash::InfoHash;
use crate::network::{Network, NetworkSet};
use crate::progress::Reporter;
use crate::verify;
use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use sha1::{Digest, Sha1};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Piece length of the placeholder torrent.
pub const PLACEHOLDER_PIECE_LENGTH: u64 = 16 * 1024;

const FILL_BLOCK: usize = 512 * 1024;

/// Transfer-engine events for one placeholder download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEvent {
    PeerAdded(SocketAddr),
    /// A peer started transferring. `metadata_size` is the info-dict size the
    /// peer advertised in its extension handshake, if any.
    PeerTransferring {
        peer: SocketAddr,
        metadata_size: Option<u64>,
    },
    Removed,
    Failed(String),
}

#[async_trait]
pub trait PlaceholderDownload: Send + Sync {
    fn force_start(&self);

    fn add_peer(&self, addr: SocketAddr);

    /// Reads `[offset, offset + len)` in chunks of at most `max_chunk`
    /// bytes. The channel closes after the last chunk or on `cancel`.
    fn read_channel(
        &self,
        offset: u64,
        len: u64,
        max_chunk: usize,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<anyhow::Result<Bytes>>;

    async fn remove(&self);
}

#[async_trait]
pub trait TransferEngine: Send + Sync {
    async fn add_placeholder_download(
        &self,
        torrent: &SyntheticTorrent,
        data_file: &Path,
    ) -> anyhow::Result<(Arc<dyn PlaceholderDownload>, mpsc::Receiver<DownloadEvent>)>;
}

#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub scratch_root: PathBuf,
    pub placeholder_size: u64,
    pub read_chunk_size: usize,
    pub inject_delay: Duration,
    pub extra_trackers: Vec<String>,
    pub enabled_networks: NetworkSet,
}

impl From<&Config> for BootstrapConfig {
    fn from(cfg: &Config) -> Self {
        Self {
            scratch_root: cfg.scratch_root(),
            placeholder_size: cfg.placeholder_size,
            read_chunk_size: cfg.read_chunk_size,
            inject_delay: Duration::from_secs(cfg.peer_inject_delay_secs),
            extra_trackers: cfg.extra_trackers.clone(),
            enabled_networks: cfg.enabled_networks.clone(),
        }
    }
}

/// Single-file torrent over the placeholder file, swarming under the target
/// hash rather than its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticTorrent {
    pub target: InfoHash,
    pub name: String,
    pub length: u64,
    pub announce: String,
    pub trackers: Vec<String>,
    pub networks: NetworkSet,
}

impl SyntheticTorrent {
    /// Bencoded form, written next to the placeholder file.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut info = Vec::new();
        info.push(b'd');
        benc::put_bytes(&mut info, b"length");
        info.extend_from_slice(format!("i{}e", self.length).as_bytes());
        benc::put_bytes(&mut info, b"name");
        benc::put_bytes(&mut info, self.name.as_bytes());
        benc::put_bytes(&mut info, b"piece length");
        info.extend_from_slice(format!("i{PLACEHOLDER_PIECE_LENGTH}e").as_bytes());
        benc::put_bytes(&mut info, b"pieces");
        benc::put_bytes(&mut info, &placeholder_pieces(self.length));
        info.push(b'e');

        let mut out = Vec::with_capacity(info.len() + 256);
        out.push(b'd');
        benc::put_bytes(&mut out, b"announce");
        benc::put_bytes(&mut out, self.announce.as_bytes());
        if !self.trackers.is_empty() {
            benc::put_bytes(&mut out, b"announce-list");
            out.push(b'l');
            for t in &self.trackers {
                out.push(b'l');
                benc::put_bytes(&mut out, t.as_bytes());
                out.push(b'e');
            }
            out.push(b'e');
        }
        benc::put_bytes(&mut out, b"info");
        out.extend_from_slice(&info);
        out.push(b'e');
        out
    }
}

/// `dht://<HEX>.dht/announce`
pub fn decentralised_announce(hash: &InfoHash) -> String {
    format!("{DHT_ANNOUNCE_SCHEME}{}.dht/announce", hash.to_hex().to_ascii_uppercase())
}

fn placeholder_pieces(length: u64) -> Vec<u8> {
    let full = Sha1::digest(vec![0xffu8; PLACEHOLDER_PIECE_LENGTH as usize]);
    let count = length.div_ceil(PLACEHOLDER_PIECE_LENGTH);
    let mut out = Vec::with_capacity(count as usize * 20);
    for i in 0..count {
        let remaining = length - i * PLACEHOLDER_PIECE_LENGTH;
        if remaining >= PLACEHOLDER_PIECE_LENGTH {
            out.extend_from_slice(&full);
        } else {
            out.extend_from_slice(&Sha1::digest(vec![0xffu8; remaining as usize]));
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Started,
    PeerAttached,
    SizeKnown,
    Reading,
    Complete,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapOutcome {
    pub torrent: Vec<u8>,
    pub peers: Vec<SocketAddr>,
    pub peer_networks: NetworkSet,
}

/// One peer-wire metadata attempt for one hash.
pub struct BootstrapSession {
    engine: Arc<dyn TransferEngine>,
    cfg: BootstrapConfig,
    hash: InfoHash,
    networks: NetworkSet,
    trackers: Vec<String>,
    sources: Vec<String>,
    state: SessionState,
    expected_size: u64,
    buffer: Vec<u8>,
    peers: Vec<SocketAddr>,
    peer_networks: NetworkSet,
}

impl BootstrapSession {
    pub fn new(
        engine: Arc<dyn TransferEngine>,
        cfg: BootstrapConfig,
        hash: InfoHash,
        networks: NetworkSet,
        trackers: Vec<String>,
        sources: Vec<String>,
    ) -> Self {
        Self {
            engine,
            cfg,
            hash,
            networks,
            trackers,
            sources,
            state: SessionState::Idle,
            expected_size: 0,
            buffer: Vec::new(),
            peers: Vec::new(),
            peer_networks: NetworkSet::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.cfg.scratch_root.join(self.hash.to_hex())
    }

    /// Drives the session to a terminal state. `Ok(None)` means the budget
    /// ran out first. The placeholder download and scratch directory are
    /// released on every outcome.
    pub async fn run(
        &mut self,
        budget: Budget,
        cancel: CancellationToken,
        reporter: Reporter,
    ) -> Result<Option<BootstrapOutcome>, ResolveError> {
        self.state = SessionState::Started;
        let reads = cancel.child_token();

        let result = match self.setup().await {
            Ok((download, events)) => {
                let r = self
                    .drive(&*download, events, budget, &cancel, &reads, &reporter)
                    .await;
                reads.cancel();
                download.remove().await;
                r
            }
            Err(err) => Err(ResolveError::transport(format!("{err:#}"))),
        };

        self.state = match &result {
            Ok(Some(_)) => SessionState::Complete,
            Ok(None) | Err(ResolveError::Cancelled) => SessionState::Cancelled,
            Err(_) => SessionState::Failed,
        };

        let dir = self.scratch_dir();
        if let Err(err) = tokio::fs::remove_dir_all(&dir).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(dir = %dir.display(), %err, "bootstrap: failed removing scratch dir");
            }
        }

        match &result {
            Ok(Some(o)) => {
                tracing::debug!(hash = %self.hash, bytes = o.torrent.len(), "bootstrap: complete")
            }
            Ok(None) => tracing::debug!(hash = %self.hash, state = ?self.state, "bootstrap: nothing found"),
            Err(ResolveError::Fatal(msg)) => {
                tracing::warn!(hash = %self.hash, expected = self.expected_size, err = %msg, "bootstrap: fatal")
            }
            Err(err) => tracing::debug!(hash = %self.hash, %err, "bootstrap: failed"),
        }
        result
    }

    async fn setup(
        &mut self,
    ) -> anyhow::Result<(Arc<dyn PlaceholderDownload>, mpsc::Receiver<DownloadEvent>)> {
        let dir = self.scratch_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("create {}", dir.display()))?;

        let hex = self.hash.to_hex();
        let data_file = dir.join(format!("{hex}.torrent"));
        ensure_placeholder(&data_file, self.cfg.placeholder_size).await?;

        let synthetic = self.synthetic_torrent();
        tokio::fs::write(dir.join(format!("{hex}.metatorrent")), synthetic.to_bytes())
            .await
            .context("write metatorrent")?;

        let (download, events) = self
            .engine
            .add_placeholder_download(&synthetic, &data_file)
            .await?;
        download.force_start();
        Ok((download, events))
    }

    /// Trackers consistent with the request's networks, decentralised announce first.
    pub fn synthetic_torrent(&self) -> SyntheticTorrent {
        let announce = decentralised_announce(&self.hash);
        let mut trackers: Vec<String> = self.trackers.clone();

        for extra in &self.cfg.extra_trackers {
            if trackers.contains(extra) {
                continue;
            }
            let Some(host) = Url::parse(extra).ok().and_then(|u| u.host_str().map(str::to_string))
            else {
                continue;
            };
            let net = Network::classify_host(&host);
            let admit = if net == Network::Public {
                self.networks.is_empty() || self.networks.contains(Network::Public)
            } else {
                self.networks.contains(net)
            };
            if admit {
                trackers.push(extra.clone());
            }
        }
        if !trackers.is_empty() {
            trackers.insert(0, announce.clone());
        }

        SyntheticTorrent {
            target: self.hash,
            name: self.hash.to_hex(),
            length: self.cfg.placeholder_size,
            announce,
            trackers,
            networks: self.download_networks(),
        }
    }

    /// Networks the placeholder download may use. No hint (or only public)
    /// opens every network; a globally disabled public network is always closed.
    fn download_networks(&self) -> NetworkSet {
        let mut set = if self.networks.is_empty() || self.networks == NetworkSet::only(Network::Public) {
            Network::ALL.into_iter().collect()
        } else {
            self.networks.clone()
        };
        if !self.cfg.enabled_networks.contains(Network::Public) {
            set.remove(Network::Public);
        }
        set
    }

    fn injectable_sources(&self, networks: &NetworkSet) -> Vec<SocketAddr> {
        self.sources
            .iter()
            .filter(|s| networks.contains(Network::classify_source(s)))
            .filter_map(|s| s.parse().ok())
            .collect()
    }

    async fn drive(
        &mut self,
        download: &dyn PlaceholderDownload,
        mut events: mpsc::Receiver<DownloadEvent>,
        budget: Budget,
        cancel: &CancellationToken,
        reads: &CancellationToken,
        reporter: &Reporter,
    ) -> Result<Option<BootstrapOutcome>, ResolveError> {
        let inject = self.injectable_sources(&self.download_networks());
        let mut injected = inject.is_empty();
        let inject_timer = tokio::time::sleep(self.cfg.inject_delay);
        tokio::pin!(inject_timer);

        let mut chunks: Option<mpsc::Receiver<anyhow::Result<Bytes>>> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ResolveError::Cancelled),
                _ = budget.expired() => return Ok(None),
                _ = &mut inject_timer, if !injected => {
                    injected = true;
                    for addr in &inject {
                        download.add_peer(*addr);
                    }
                }
                ev = events.recv() => match ev {
                    Some(DownloadEvent::PeerAdded(addr)) => {
                        if self.state == SessionState::Started {
                            self.state = SessionState::PeerAttached;
                        }
                        if !self.peers.contains(&addr) {
                            self.peers.push(addr);
                            self.peer_networks.insert(Network::classify_host(&addr.ip().to_string()));
                        }
                    }
                    Some(DownloadEvent::PeerTransferring { peer, metadata_size }) => {
                        if self.expected_size > 0 {
                            continue;
                        }
                        // Only a non-zero report is trusted; keep waiting for one.
                        let Some(size) = metadata_size.filter(|&n| n > 0) else {
                            continue;
                        };
                        if size > self.cfg.placeholder_size {
                            return Err(ResolveError::fatal(format!(
                                "metadata size {size} exceeds placeholder size {}",
                                self.cfg.placeholder_size
                            )));
                        }
                        self.expected_size = size;
                        self.state = SessionState::SizeKnown;
                        reporter.size(size);
                        reporter.completeness(0);
                        tracing::debug!(hash = %self.hash, peer = %peer, size, "bootstrap: size known");

                        chunks = Some(download.read_channel(0, size, self.cfg.read_chunk_size, reads.clone()));
                        self.buffer = Vec::with_capacity(size as usize);
                        self.state = SessionState::Reading;
                    }
                    Some(DownloadEvent::Removed) | None => {
                        return Err(ResolveError::transport("placeholder download removed"));
                    }
                    Some(DownloadEvent::Failed(msg)) => {
                        return Err(ResolveError::transport(format!("placeholder download failed: {msg}")));
                    }
                },
                chunk = recv_chunk(&mut chunks) => match chunk {
                    Some(Ok(bytes)) => {
                        self.buffer.extend_from_slice(&bytes);
                        let have = self.buffer.len() as u64;
                        if have > self.expected_size {
                            return Err(ResolveError::fatal(format!(
                                "read {have} bytes past expected metadata size {}",
                                self.expected_size
                            )));
                        }
                        reporter.completeness((have * 100 / self.expected_size) as u8);
                        if have == self.expected_size {
                            let torrent = verify::verify_metadata(&self.buffer, &self.hash)?;
                            return Ok(Some(BootstrapOutcome {
                                torrent,
                                peers: self.peers.clone(),
                                peer_networks: self.peer_networks.clone(),
                            }));
                        }
                    }
                    Some(Err(err)) => {
                        return Err(ResolveError::transport(format!("placeholder read failed: {err:#}")));
                    }
                    None => {
                        return Err(ResolveError::transport("placeholder read ended early"));
                    }
                },
            }
        }
    }
}

async fn recv_chunk(
    chunks: &mut Option<mpsc::Receiver<anyhow::Result<Bytes>>>,
) -> Option<anyhow::Result<Bytes>> {
    match chunks {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Creates (or reuses, when already the right size) a placeholder file filled with 0xff.
async fn ensure_placeholder(path: &Path, size: u64) -> anyhow::Result<()> {
    if let Ok(meta) = tokio::fs::metadata(path).await {
        if meta.len() == size {
            return Ok(());
        }
    }

    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("create {}", path.display()))?;
    let block = vec![0xffu8; FILL_BLOCK];
    let mut written = 0u64;
    while written < size {
        let n = (size - written).min(FILL_BLOCK as u64) as usize;
        file.write_all(&block[..n]).await?;
        written += n as u64;
    }
    file.flush().await?;
    Ok(())
}
