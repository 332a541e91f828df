use crate::budget::Budget;
use crate::config::Config;
use crate::hash::InfoHash;
use crate::network::Network;
use crate::progress::Reporter;
use crate::verify;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinSet;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// Upper bound on a single DHT read or contact read when the budget is unbounded.
pub const DHT_READ_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    Torrent,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadFlags {
    pub exhaustive: bool,
    pub high_priority: bool,
}

pub enum DhtEvent {
    ValueRead(Arc<dyn DhtContact>),
    Complete,
    TimedOut,
}

#[async_trait]
pub trait DhtContact: Send + Sync {
    fn address(&self) -> SocketAddr;

    async fn is_alive(&self, timeout: Duration) -> bool;

    /// Opens a relay to a contact that has not been seen alive.
    async fn open_tunnel(&self) -> anyhow::Result<()>;

    async fn read(
        &self,
        transfer: TransferType,
        key: &[u8],
        timeout: Duration,
    ) -> anyhow::Result<Option<Vec<u8>>>;
}

#[async_trait]
pub trait Dht: Send + Sync {
    fn is_available(&self) -> bool;

    /// Starts a keyed read. Contacts arrive on the returned channel; the
    /// lookup is over on `Complete`, `TimedOut` or channel close.
    async fn read(
        &self,
        key: [u8; 20],
        timeout: Duration,
        flags: ReadFlags,
    ) -> anyhow::Result<mpsc::Receiver<DhtEvent>>;

    fn import_contact(&self, addr: SocketAddr) -> Option<Arc<dyn DhtContact>>;
}

#[derive(Debug, Clone)]
pub struct DhtLookupConfig {
    pub liveness_timeout: Duration,
    pub source_delay: Duration,
    pub contact_inflight: usize,
}

impl From<&Config> for DhtLookupConfig {
    fn from(cfg: &Config) -> Self {
        Self {
            liveness_timeout: Duration::from_millis(cfg.dht_liveness_timeout_ms),
            source_delay: Duration::from_secs(cfg.dht_source_delay_secs),
            contact_inflight: cfg.dht_contact_inflight.max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhtHit {
    pub torrent: Vec<u8>,
    pub contact: SocketAddr,
}

struct Candidate {
    contact: Arc<dyn DhtContact>,
    live: bool,
}

/// Contacts waiting to be read, live ones ahead of dead ones.
#[derive(Default)]
struct CandidateQueue {
    entries: VecDeque<Candidate>,
    probing: usize,
    lookup_complete: bool,
}

impl CandidateQueue {
    fn push(&mut self, candidate: Candidate) {
        if candidate.live {
            let at = self
                .entries
                .iter()
                .position(|c| !c.live)
                .unwrap_or(self.entries.len());
            self.entries.insert(at, candidate);
        } else {
            self.entries.push_back(candidate);
        }
    }

    /// Dead contacts wait until every outstanding ping has reported, so a
    /// late live answer still overtakes them.
    fn pop(&mut self) -> Option<Candidate> {
        match self.entries.front() {
            Some(c) if c.live || self.probing == 0 => self.entries.pop_front(),
            _ => None,
        }
    }

    fn drained(&self) -> bool {
        self.lookup_complete && self.entries.is_empty() && self.probing == 0
    }
}

struct Shared {
    queue: Mutex<CandidateQueue>,
    wake: Notify,
}

pub struct DhtLookup {
    dht: Arc<dyn Dht>,
    cfg: DhtLookupConfig,
}

impl DhtLookup {
    pub fn new(dht: Arc<dyn Dht>, cfg: DhtLookupConfig) -> Self {
        Self { dht, cfg }
    }

    /// Looks `hash` up and reads metadata from the best contacts. `None`
    /// means nothing verified before the budget ran out, the contacts were
    /// exhausted, or `cancel` fired.
    pub async fn lookup(
        &self,
        hash: InfoHash,
        sources: &[String],
        budget: Budget,
        cancel: CancellationToken,
        reporter: Reporter,
    ) -> Option<DhtHit> {
        if !self.dht.is_available() {
            tracing::debug!(hash = %hash, "dht: unavailable");
            reporter.activity("DHT unavailable");
            return None;
        }

        let key = hash.dht_key();
        let flags = ReadFlags {
            exhaustive: true,
            high_priority: true,
        };
        reporter.activity("searching");
        let rx = match self.dht.read(key, budget.cap(DHT_READ_TIMEOUT), flags).await {
            Ok(rx) => rx,
            Err(err) => {
                tracing::debug!(hash = %hash, err = %err, "dht: read failed");
                // A closed channel still lets explicit sources through.
                mpsc::channel(1).1
            }
        };

        let shared = Arc::new(Shared {
            queue: Mutex::new(CandidateQueue::default()),
            wake: Notify::new(),
        });

        // Cancelling `feed_stop` on every exit path tears the feeder down.
        let feed_stop = cancel.child_token();
        let _feed_guard = feed_stop.clone().drop_guard();
        let feeder = Feeder {
            dht: self.dht.clone(),
            shared: shared.clone(),
            sources: public_sources(sources),
            liveness_timeout: self.cfg.liveness_timeout,
            budget,
            reporter: reporter.clone(),
        };
        tokio::spawn(feeder.run(rx, self.cfg.source_delay, feed_stop));

        self.dispatch(hash, key, &shared, budget, &cancel, &reporter).await
    }

    async fn dispatch(
        &self,
        hash: InfoHash,
        key: [u8; 20],
        shared: &Shared,
        budget: Budget,
        cancel: &CancellationToken,
        reporter: &Reporter,
    ) -> Option<DhtHit> {
        let mut reads = JoinSet::new();
        let mut failures_logged = 0usize;

        loop {
            while reads.len() < self.cfg.contact_inflight {
                let Some(candidate) = shared.queue.lock().pop() else {
                    break;
                };
                let read_timeout = budget.cap(DHT_READ_TIMEOUT);
                let reporter = reporter.clone();
                reads.spawn(async move {
                    let addr = candidate.contact.address();
                    (addr, read_contact(candidate, key, read_timeout, reporter).await)
                });
            }

            if reads.is_empty() && shared.queue.lock().drained() {
                tracing::debug!(hash = %hash, "dht: contacts exhausted");
                return None;
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = budget.expired() => {
                    tracing::debug!(hash = %hash, "dht: budget exhausted");
                    return None;
                }
                _ = shared.wake.notified() => {}
                Some(joined) = reads.join_next(), if !reads.is_empty() => {
                    let Ok((addr, result)) = joined else {
                        continue;
                    };
                    let err = match result {
                        Ok(Some(data)) => match verify::verify_metadata(&data, &hash) {
                            Ok(torrent) => {
                                tracing::debug!(hash = %hash, peer = %addr, bytes = torrent.len(), "dht: got metadata");
                                reporter.contributor(addr);
                                reads.abort_all();
                                return Some(DhtHit { torrent, contact: addr });
                            }
                            Err(err) => {
                                reporter.activity(format!("torrent invalid ({err})"));
                                err.to_string()
                            }
                        },
                        Ok(None) => "no value".to_string(),
                        Err(err) => format!("{err:#}"),
                    };
                    if failures_logged < 2 {
                        tracing::debug!(hash = %hash, peer = %addr, err = %err, "dht: contact failed");
                        failures_logged += 1;
                    } else {
                        tracing::trace!(hash = %hash, peer = %addr, err = %err, "dht: contact failed");
                    }
                }
            }
        }
    }
}

async fn read_contact(
    candidate: Candidate,
    key: [u8; 20],
    timeout: Duration,
    reporter: Reporter,
) -> anyhow::Result<Option<Vec<u8>>> {
    let contact = candidate.contact;
    if !candidate.live {
        reporter.activity(format!("tunnel to {}", contact.address()));
        contact.open_tunnel().await?;
    }
    reporter.activity(format!("downloading from {}", contact.address()));
    match tokio::time::timeout(timeout, contact.read(TransferType::Torrent, &key, timeout)).await {
        Ok(r) => r,
        Err(_) => anyhow::bail!("contact read timed out"),
    }
}

fn public_sources(sources: &[String]) -> Vec<SocketAddr> {
    sources
        .iter()
        .filter(|s| Network::classify_source(s) == Network::Public)
        .filter_map(|s| s.parse().ok())
        .collect()
}

/// Turns the DHT event stream (plus explicit sources) into pinged candidates.
struct Feeder {
    dht: Arc<dyn Dht>,
    shared: Arc<Shared>,
    sources: Vec<SocketAddr>,
    liveness_timeout: Duration,
    budget: Budget,
    reporter: Reporter,
}

impl Feeder {
    async fn run(
        self,
        mut rx: mpsc::Receiver<DhtEvent>,
        source_delay: Duration,
        stop: CancellationToken,
    ) {
        let mut seen: HashSet<SocketAddr> = HashSet::new();
        let mut pings: JoinSet<(Arc<dyn DhtContact>, bool)> = JoinSet::new();
        let mut sources_added = self.sources.is_empty();
        let mut stream_open = true;
        let source_timer = tokio::time::sleep(source_delay);
        tokio::pin!(source_timer);

        loop {
            if !stream_open && pings.is_empty() {
                break;
            }
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = &mut source_timer, if !sources_added => {
                    sources_added = true;
                    self.add_sources(&mut seen, &mut pings);
                }
                ev = rx.recv(), if stream_open => match ev {
                    Some(DhtEvent::ValueRead(contact)) => {
                        self.contact_found(contact, &mut seen, &mut pings);
                    }
                    Some(DhtEvent::Complete) | Some(DhtEvent::TimedOut) | None => {
                        stream_open = false;
                        if !sources_added {
                            sources_added = true;
                            self.add_sources(&mut seen, &mut pings);
                        }
                        self.reporter.activity(format!("found {} contacts", seen.len()));
                        self.shared.queue.lock().lookup_complete = true;
                        self.shared.wake.notify_one();
                    }
                },
                Some(joined) = pings.join_next(), if !pings.is_empty() => {
                    let mut q = self.shared.queue.lock();
                    q.probing = q.probing.saturating_sub(1);
                    if let Ok((contact, live)) = joined {
                        tracing::trace!(peer = %contact.address(), live, "dht: pinged");
                        q.push(Candidate { contact, live });
                    }
                    drop(q);
                    self.shared.wake.notify_one();
                }
            }
        }
        pings.abort_all();
    }

    fn add_sources(
        &self,
        seen: &mut HashSet<SocketAddr>,
        pings: &mut JoinSet<(Arc<dyn DhtContact>, bool)>,
    ) {
        for addr in &self.sources {
            if let Some(contact) = self.dht.import_contact(*addr) {
                self.contact_found(contact, seen, pings);
            }
        }
    }

    fn contact_found(
        &self,
        contact: Arc<dyn DhtContact>,
        seen: &mut HashSet<SocketAddr>,
        pings: &mut JoinSet<(Arc<dyn DhtContact>, bool)>,
    ) {
        if !seen.insert(contact.address()) {
            return;
        }
        self.shared.queue.lock().probing += 1;
        let timeout = self.budget.cap(self.liveness_timeout);
        pings.spawn(async move {
            let live = contact.is_alive(timeout).await;
            (contact, live)
        });
    }
}
