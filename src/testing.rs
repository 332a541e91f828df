//! Scriptable collaborators for unit tests.

use crate::bootstrap::{DownloadEvent, PlaceholderDownload, SyntheticTorrent, TransferEngine};
use crate::dht::{Dht, DhtContact, DhtEvent, ReadFlags, TransferType};
use crate::direct::LinkFetcher;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

type ReadLog = Arc<Mutex<Vec<SocketAddr>>>;

// ---------------------------------------------------------------- DHT

#[derive(Default)]
pub struct FakeDht {
    script: Mutex<Vec<(Duration, Arc<FakeContact>)>>,
    importable: Mutex<HashMap<SocketAddr, Arc<FakeContact>>>,
    imports: Mutex<Vec<SocketAddr>>,
    hold_open: AtomicBool,
    keys: Mutex<Vec<[u8; 20]>>,
    read_log: ReadLog,
}

impl FakeDht {
    /// Contacts returned by every read, each after its delay.
    pub fn script(&self, contacts: Vec<(Duration, Arc<FakeContact>)>) {
        for (_, c) in &contacts {
            c.attach_log(self.read_log.clone());
        }
        *self.script.lock() = contacts;
    }

    pub fn importable(&self, contact: Arc<FakeContact>) {
        contact.attach_log(self.read_log.clone());
        self.importable.lock().insert(contact.addr, contact);
    }

    /// Never report the lookup as complete.
    pub fn hold_open(&self) {
        self.hold_open.store(true, Ordering::SeqCst);
    }

    pub fn reads(&self) -> usize {
        self.keys.lock().len()
    }

    /// Keys of every lookup, in issue order.
    pub fn read_keys(&self) -> Vec<[u8; 20]> {
        self.keys.lock().clone()
    }

    pub fn imports(&self) -> Vec<SocketAddr> {
        self.imports.lock().clone()
    }

    /// Contacts in the order their metadata was requested.
    pub fn read_order(&self) -> Vec<SocketAddr> {
        self.read_log.lock().clone()
    }
}

#[async_trait]
impl Dht for FakeDht {
    fn is_available(&self) -> bool {
        true
    }

    async fn read(
        &self,
        key: [u8; 20],
        _timeout: Duration,
        _flags: ReadFlags,
    ) -> anyhow::Result<mpsc::Receiver<DhtEvent>> {
        self.keys.lock().push(key);
        let script = self.script.lock().clone();
        let hold = self.hold_open.load(Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            for (delay, contact) in script {
                tokio::time::sleep(delay).await;
                if tx.send(DhtEvent::ValueRead(contact)).await.is_err() {
                    return;
                }
            }
            if hold {
                tx.closed().await;
            } else {
                let _ = tx.send(DhtEvent::Complete).await;
            }
        });
        Ok(rx)
    }

    fn import_contact(&self, addr: SocketAddr) -> Option<Arc<dyn DhtContact>> {
        self.imports.lock().push(addr);
        let c = self.importable.lock().get(&addr).cloned()?;
        Some(c)
    }
}

struct ContactScript {
    ping_delay: Duration,
    alive: bool,
    payload: Option<Vec<u8>>,
    read_delay: Duration,
}

pub struct FakeContact {
    addr: SocketAddr,
    script: Mutex<ContactScript>,
    pings: AtomicUsize,
    tunnels: AtomicUsize,
    log: Mutex<Option<ReadLog>>,
}

impl FakeContact {
    pub fn new(addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            addr,
            script: Mutex::new(ContactScript {
                ping_delay: Duration::ZERO,
                alive: true,
                payload: None,
                read_delay: Duration::ZERO,
            }),
            pings: AtomicUsize::new(0),
            tunnels: AtomicUsize::new(0),
            log: Mutex::new(None),
        })
    }

    pub fn ping(self: Arc<Self>, delay: Duration, alive: bool) -> Arc<Self> {
        {
            let mut s = self.script.lock();
            s.ping_delay = delay;
            s.alive = alive;
        }
        self
    }

    pub fn payload(self: Arc<Self>, bytes: Vec<u8>) -> Arc<Self> {
        self.script.lock().payload = Some(bytes);
        self
    }

    pub fn read_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        self.script.lock().read_delay = delay;
        self
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn tunnels(&self) -> usize {
        self.tunnels.load(Ordering::SeqCst)
    }

    fn attach_log(&self, log: ReadLog) {
        *self.log.lock() = Some(log);
    }
}

#[async_trait]
impl DhtContact for FakeContact {
    fn address(&self) -> SocketAddr {
        self.addr
    }

    async fn is_alive(&self, timeout: Duration) -> bool {
        self.pings.fetch_add(1, Ordering::SeqCst);
        let (delay, alive) = {
            let s = self.script.lock();
            (s.ping_delay, s.alive)
        };
        if delay > timeout {
            tokio::time::sleep(timeout).await;
            return false;
        }
        tokio::time::sleep(delay).await;
        alive
    }

    async fn open_tunnel(&self) -> anyhow::Result<()> {
        self.tunnels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read(
        &self,
        _transfer: TransferType,
        _key: &[u8],
        _timeout: Duration,
    ) -> anyhow::Result<Option<Vec<u8>>> {
        if let Some(log) = self.log.lock().as_ref() {
            log.lock().push(self.addr);
        }
        let (delay, payload) = {
            let s = self.script.lock();
            (s.read_delay, s.payload.clone())
        };
        tokio::time::sleep(delay).await;
        Ok(payload)
    }
}

// ---------------------------------------------------------------- direct links

#[derive(Debug, Clone)]
pub enum LinkBehaviour {
    Hang,
    Fail,
    After(Duration, Vec<u8>),
}

#[derive(Default)]
pub struct FakeFetcher {
    links: Mutex<HashMap<String, LinkBehaviour>>,
    cancelled: Arc<Mutex<HashSet<String>>>,
    calls: AtomicUsize,
}

impl FakeFetcher {
    pub fn set(&self, url: &Url, behaviour: LinkBehaviour) {
        self.links.lock().insert(url.to_string(), behaviour);
    }

    /// True if the fetch for `url` was dropped before it finished.
    pub fn was_cancelled(&self, url: &Url) -> bool {
        self.cancelled.lock().contains(url.as_str())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

struct DropFlag {
    url: String,
    set: Arc<Mutex<HashSet<String>>>,
    armed: bool,
}

impl Drop for DropFlag {
    fn drop(&mut self) {
        if self.armed {
            self.set.lock().insert(self.url.clone());
        }
    }
}

#[async_trait]
impl LinkFetcher for FakeFetcher {
    async fn fetch(&self, url: &Url, _timeout: Duration) -> anyhow::Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let behaviour = self
            .links
            .lock()
            .get(url.as_str())
            .cloned()
            .unwrap_or(LinkBehaviour::Fail);
        let mut flag = DropFlag {
            url: url.to_string(),
            set: self.cancelled.clone(),
            armed: true,
        };
        match behaviour {
            LinkBehaviour::Hang => std::future::pending().await,
            LinkBehaviour::Fail => {
                flag.armed = false;
                anyhow::bail!("connection refused")
            }
            LinkBehaviour::After(delay, body) => {
                tokio::time::sleep(delay).await;
                flag.armed = false;
                Ok(body)
            }
        }
    }
}

// ---------------------------------------------------------------- transfer engine

#[derive(Debug, Clone, Default)]
pub struct EngineScript {
    /// Bytes served by the placeholder's read channel.
    pub metadata: Vec<u8>,
    pub events: Vec<DownloadEvent>,
    /// Wait before the first event.
    pub delay: Duration,
}

#[derive(Default)]
struct EngineLog {
    adds: AtomicUsize,
    removed: AtomicBool,
    force_started: AtomicBool,
    reads: Mutex<Vec<(u64, u64)>>,
    injected: Mutex<Vec<SocketAddr>>,
    torrents: Mutex<Vec<SyntheticTorrent>>,
}

pub struct FakeEngine {
    script: EngineScript,
    log: Arc<EngineLog>,
}

impl FakeEngine {
    pub fn new(script: EngineScript) -> Self {
        Self {
            script,
            log: Arc::new(EngineLog::default()),
        }
    }

    pub fn adds(&self) -> usize {
        self.log.adds.load(Ordering::SeqCst)
    }

    pub fn removed(&self) -> bool {
        self.log.removed.load(Ordering::SeqCst)
    }

    pub fn force_started(&self) -> bool {
        self.log.force_started.load(Ordering::SeqCst)
    }

    pub fn read_requests(&self) -> Vec<(u64, u64)> {
        self.log.reads.lock().clone()
    }

    pub fn injected(&self) -> Vec<SocketAddr> {
        self.log.injected.lock().clone()
    }

    pub fn torrents(&self) -> Vec<SyntheticTorrent> {
        self.log.torrents.lock().clone()
    }
}

#[async_trait]
impl TransferEngine for FakeEngine {
    async fn add_placeholder_download(
        &self,
        torrent: &SyntheticTorrent,
        _data_file: &Path,
    ) -> anyhow::Result<(Arc<dyn PlaceholderDownload>, mpsc::Receiver<DownloadEvent>)> {
        self.log.adds.fetch_add(1, Ordering::SeqCst);
        self.log.torrents.lock().push(torrent.clone());

        let (tx, rx) = mpsc::channel(64);
        let events = self.script.events.clone();
        let delay = self.script.delay;
        let feed = tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            for ev in events {
                if feed.send(ev).await.is_err() {
                    return;
                }
            }
        });

        let download = FakeDownload {
            metadata: Bytes::from(self.script.metadata.clone()),
            log: self.log.clone(),
            events: Mutex::new(Some(tx)),
        };
        Ok((Arc::new(download), rx))
    }
}

struct FakeDownload {
    metadata: Bytes,
    log: Arc<EngineLog>,
    // Held so the event stream stays open until removal.
    events: Mutex<Option<mpsc::Sender<DownloadEvent>>>,
}

#[async_trait]
impl PlaceholderDownload for FakeDownload {
    fn force_start(&self) {
        self.log.force_started.store(true, Ordering::SeqCst);
    }

    fn add_peer(&self, addr: SocketAddr) {
        self.log.injected.lock().push(addr);
    }

    fn read_channel(
        &self,
        offset: u64,
        len: u64,
        max_chunk: usize,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<anyhow::Result<Bytes>> {
        self.log.reads.lock().push((offset, len));
        let (tx, rx) = mpsc::channel(8);
        let start = (offset as usize).min(self.metadata.len());
        let end = ((offset + len) as usize).min(self.metadata.len());
        let data = self.metadata.slice(start..end);
        tokio::spawn(async move {
            let mut at = 0;
            while at < data.len() {
                if cancel.is_cancelled() {
                    return;
                }
                let n = max_chunk.min(data.len() - at);
                if tx.send(Ok(data.slice(at..at + n))).await.is_err() {
                    return;
                }
                at += n;
            }
        });
        rx
    }

    async fn remove(&self) {
        self.log.removed.store(true, Ordering::SeqCst);
        self.events.lock().take();
    }
}
