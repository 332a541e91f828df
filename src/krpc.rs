//! Mainline DHT adapter: BEP-5 `get_peers` over UDP, with peers served
//! as contacts whose metadata is read via `ut_metadata`.

use crate::benc::{self, BencDict};
use crate::config::Config;
use crate::dht::{Dht, DhtContact, DhtEvent, ReadFlags, TransferType};
use crate::wire;
use anyhow::Context;
use async_trait::async_trait;
use rbit::peer::PeerId;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, timeout};

const RECV_SLICE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
struct LookupParams {
    bind: String,
    bootstrap: Vec<String>,
    query_timeout: Duration,
    inflight: usize,
    max_queries: usize,
    max_peers: usize,
}

#[derive(Debug, Clone, Copy)]
struct ContactParams {
    connect_timeout: Duration,
    max_metadata: u64,
}

pub struct KrpcDht {
    lookup: LookupParams,
    contact: ContactParams,
}

impl KrpcDht {
    pub fn new(cfg: &Config) -> Self {
        Self {
            lookup: LookupParams {
                bind: cfg.dht_bind.clone(),
                bootstrap: cfg.dht_bootstrap.clone(),
                query_timeout: Duration::from_millis(cfg.dht_query_timeout_ms),
                inflight: cfg.dht_inflight,
                max_queries: cfg.dht_max_queries,
                max_peers: cfg.dht_max_peers,
            },
            contact: ContactParams {
                connect_timeout: Duration::from_millis(cfg.peer_connect_timeout_ms),
                max_metadata: cfg.placeholder_size,
            },
        }
    }
}

#[async_trait]
impl Dht for KrpcDht {
    fn is_available(&self) -> bool {
        !self.lookup.bootstrap.is_empty()
    }

    async fn read(
        &self,
        key: [u8; 20],
        within: Duration,
        flags: ReadFlags,
    ) -> anyhow::Result<mpsc::Receiver<DhtEvent>> {
        let sockets = Sockets::bind(&self.lookup.bind).await?;
        let bootstrap = resolve_bootstrap(&self.lookup.bootstrap).await;
        if bootstrap.is_empty() {
            anyhow::bail!("no DHT bootstrap nodes resolved");
        }

        let (tx, rx) = mpsc::channel(64);
        let params = self.lookup.clone();
        let contact = self.contact;
        tokio::spawn(async move {
            let deadline = Instant::now() + within;
            let last = match get_peers(&sockets, &params, bootstrap, key, deadline, flags, contact, &tx).await {
                LookupEnd::Deadline => DhtEvent::TimedOut,
                LookupEnd::Exhausted => DhtEvent::Complete,
                LookupEnd::Stopped => return,
            };
            let _ = tx.send(last).await;
        });
        Ok(rx)
    }

    fn import_contact(&self, addr: SocketAddr) -> Option<Arc<dyn DhtContact>> {
        Some(Arc::new(PeerContact::new(addr, self.contact)))
    }
}

/// A swarm peer reachable over plain TCP.
struct PeerContact {
    addr: SocketAddr,
    params: ContactParams,
}

impl PeerContact {
    fn new(addr: SocketAddr, params: ContactParams) -> Self {
        Self { addr, params }
    }
}

#[async_trait]
impl DhtContact for PeerContact {
    fn address(&self) -> SocketAddr {
        self.addr
    }

    async fn is_alive(&self, within: Duration) -> bool {
        matches!(timeout(within, TcpStream::connect(self.addr)).await, Ok(Ok(_)))
    }

    async fn open_tunnel(&self) -> anyhow::Result<()> {
        // Directly reachable; nothing to relay through.
        Ok(())
    }

    async fn read(
        &self,
        transfer: TransferType,
        key: &[u8],
        within: Duration,
    ) -> anyhow::Result<Option<Vec<u8>>> {
        let TransferType::Torrent = transfer;
        let info_hash: [u8; 20] = key.try_into().context("metadata key must be 20 bytes")?;
        let bytes = wire::fetch_ut_metadata(
            self.addr,
            info_hash,
            self.params.connect_timeout.min(within),
            self.params.max_metadata,
            within,
        )
        .await?;
        Ok(Some(bytes))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LookupEnd {
    Exhausted,
    Deadline,
    Stopped,
}

/// Iterative `get_peers`, closest nodes first. Each new peer is sent on
/// `events` as a contact; a dropped receiver stops the lookup.
#[allow(clippy::too_many_arguments)]
async fn get_peers(
    sockets: &Sockets,
    params: &LookupParams,
    bootstrap: Vec<SocketAddr>,
    info_hash: [u8; 20],
    deadline: Instant,
    flags: ReadFlags,
    contact: ContactParams,
    events: &mpsc::Sender<DhtEvent>,
) -> LookupEnd {
    let node_id = *PeerId::generate().as_bytes();

    let mut q: BinaryHeap<(Reverse<[u8; 20]>, SocketAddr)> = BinaryHeap::new();
    let mut seen_nodes: HashSet<SocketAddr> = HashSet::new();
    for addr in bootstrap {
        push_node_seed(addr, &mut q, &mut seen_nodes);
    }

    let max_peers = if flags.exhaustive { params.max_peers } else { params.max_peers.min(8) };
    let mut seen_peers: HashSet<SocketAddr> = HashSet::new();
    let mut tx: u16 = 0;
    let mut buf4 = vec![0u8; 4096];
    let mut buf6 = vec![0u8; 4096];
    let mut queries = 0usize;
    let mut inflight: HashMap<[u8; 2], (SocketAddr, Instant)> = HashMap::new();

    loop {
        if Instant::now() >= deadline {
            return LookupEnd::Deadline;
        }
        if seen_peers.len() >= max_peers {
            return LookupEnd::Exhausted;
        }

        let now = Instant::now();
        inflight.retain(|_, (_, sent_at)| now.saturating_duration_since(*sent_at) <= params.query_timeout);

        while inflight.len() < params.inflight && queries < params.max_queries {
            let Some((_, addr)) = q.pop() else { break };
            tx = tx.wrapping_add(1);
            let txid = tx.to_be_bytes();
            let msg = make_get_peers(txid, &node_id, &info_hash);
            let _ = sockets.send(&msg, addr).await;
            inflight.insert(txid, (addr, Instant::now()));
            queries += 1;
        }

        if inflight.is_empty() && (q.is_empty() || queries >= params.max_queries) {
            return LookupEnd::Exhausted;
        }

        let slice = RECV_SLICE.min(deadline.saturating_duration_since(Instant::now()));
        let Some((n, fam)) = sockets.recv(&mut buf4, &mut buf6, slice).await else {
            continue;
        };
        let raw = if fam == 4 { &buf4[..n] } else { &buf6[..n] };
        let Some(resp) = KrpcResponse::decode(raw) else {
            continue;
        };
        if inflight.remove(&resp.tx).is_none() {
            continue;
        }

        if let Some(nodes) = resp.nodes {
            for node in parse_compact_nodes_v4(nodes) {
                push_node(node, &info_hash, &mut q, &mut seen_nodes);
            }
        }
        if let Some(nodes6) = resp.nodes6 {
            for node in parse_compact_nodes_v6(nodes6) {
                push_node(node, &info_hash, &mut q, &mut seen_nodes);
            }
        }
        let found = resp
            .values
            .iter()
            .filter_map(|v| parse_compact_peer_v4(v))
            .chain(resp.values6.iter().filter_map(|v| parse_compact_peer_v6(v)));
        let fresh: Vec<SocketAddr> = found.filter(|p| seen_peers.insert(*p)).collect();
        for peer in fresh {
            let c: Arc<dyn DhtContact> = Arc::new(PeerContact::new(peer, contact));
            if events.send(DhtEvent::ValueRead(c)).await.is_err() {
                return LookupEnd::Stopped;
            }
        }
    }
}

/// Separate IPv4 and IPv6 sockets so both families work regardless of the
/// OS dual-stack setting.
struct Sockets {
    v4: UdpSocket,
    v6: Option<UdpSocket>,
}

impl Sockets {
    async fn bind(bind_v4: &str) -> anyhow::Result<Self> {
        let v4 = UdpSocket::bind(bind_v4)
            .await
            .with_context(|| format!("bind dht socket {bind_v4}"))?;
        let v6 = match UdpSocket::bind("[::]:0").await {
            Ok(s) => Some(s),
            Err(err) => {
                tracing::debug!(%err, "dht: ipv6 udp bind failed; continuing with ipv4 only");
                None
            }
        };
        Ok(Self { v4, v6 })
    }

    async fn send(&self, msg: &[u8], addr: SocketAddr) -> std::io::Result<usize> {
        match (addr.ip(), &self.v6) {
            (IpAddr::V4(_), _) => self.v4.send_to(msg, addr).await,
            (IpAddr::V6(_), Some(v6)) => v6.send_to(msg, addr).await,
            (IpAddr::V6(_), None) => Ok(0),
        }
    }

    async fn recv(&self, buf4: &mut [u8], buf6: &mut [u8], within: Duration) -> Option<(usize, u8)> {
        let r = tokio::select! {
            _ = tokio::time::sleep(within) => return None,
            r = self.v4.recv_from(buf4) => (r, 4u8),
            r = async {
                match &self.v6 {
                    Some(v6) => v6.recv_from(buf6).await,
                    None => std::future::pending().await,
                }
            } => (r, 6u8),
        };
        match r {
            (Ok((n, _)), fam) if n > 0 => Some((n, fam)),
            _ => None,
        }
    }
}

async fn resolve_bootstrap(hosts: &[String]) -> Vec<SocketAddr> {
    let mut out = Vec::new();
    for host in hosts {
        match tokio::net::lookup_host(host.as_str()).await {
            Ok(iter) => out.extend(iter),
            Err(err) => tracing::debug!(%err, host = %host, "dht: bootstrap resolve failed"),
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DhtNode {
    id: [u8; 20],
    addr: SocketAddr,
}

fn xor_distance(a: &[u8; 20], b: &[u8; 20]) -> [u8; 20] {
    let mut out = [0u8; 20];
    for (o, (x, y)) in out.iter_mut().zip(a.iter().zip(b)) {
        *o = x ^ y;
    }
    out
}

// Seeds carry no id; they go first.
fn push_node_seed(
    addr: SocketAddr,
    q: &mut BinaryHeap<(Reverse<[u8; 20]>, SocketAddr)>,
    set: &mut HashSet<SocketAddr>,
) {
    if filter_addr(addr) && set.insert(addr) {
        q.push((Reverse([0u8; 20]), addr));
    }
}

fn push_node(
    node: DhtNode,
    target: &[u8; 20],
    q: &mut BinaryHeap<(Reverse<[u8; 20]>, SocketAddr)>,
    set: &mut HashSet<SocketAddr>,
) {
    if filter_addr(node.addr) && set.insert(node.addr) {
        q.push((Reverse(xor_distance(&node.id, target)), node.addr));
    }
}

fn filter_addr(addr: SocketAddr) -> bool {
    if addr.port() == 0 {
        return false;
    }
    match addr.ip() {
        IpAddr::V4(v4) => !(v4.is_private() || v4.is_loopback() || v4.is_unspecified()),
        IpAddr::V6(v6) => !(v6.is_loopback() || v6.is_unspecified() || v6.is_unique_local()),
    }
}

fn parse_compact_peer_v4(bytes: &[u8]) -> Option<SocketAddr> {
    let b: &[u8; 6] = bytes.try_into().ok()?;
    let ip = Ipv4Addr::new(b[0], b[1], b[2], b[3]);
    Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be_bytes([b[4], b[5]])))
}

fn parse_compact_peer_v6(bytes: &[u8]) -> Option<SocketAddr> {
    let b: &[u8; 18] = bytes.try_into().ok()?;
    let mut ip = [0u8; 16];
    ip.copy_from_slice(&b[..16]);
    Some(SocketAddr::new(
        IpAddr::V6(Ipv6Addr::from(ip)),
        u16::from_be_bytes([b[16], b[17]]),
    ))
}

// 26 bytes per node: id, IPv4, port.
fn parse_compact_nodes_v4(nodes: &[u8]) -> Vec<DhtNode> {
    nodes
        .chunks_exact(26)
        .filter_map(|c| {
            let mut id = [0u8; 20];
            id.copy_from_slice(&c[..20]);
            Some(DhtNode {
                id,
                addr: parse_compact_peer_v4(&c[20..])?,
            })
        })
        .collect()
}

// 38 bytes per node: id, IPv6, port.
fn parse_compact_nodes_v6(nodes: &[u8]) -> Vec<DhtNode> {
    nodes
        .chunks_exact(38)
        .filter_map(|c| {
            let mut id = [0u8; 20];
            id.copy_from_slice(&c[..20]);
            Some(DhtNode {
                id,
                addr: parse_compact_peer_v6(&c[20..])?,
            })
        })
        .collect()
}

fn make_get_peers(tx: [u8; 2], id: &[u8; 20], info_hash: &[u8; 20]) -> Vec<u8> {
    let mut out = Vec::with_capacity(120);
    out.push(b'd');

    benc::put_bytes(&mut out, b"a");
    out.push(b'd');
    benc::put_bytes(&mut out, b"id");
    benc::put_bytes(&mut out, id);
    benc::put_bytes(&mut out, b"info_hash");
    benc::put_bytes(&mut out, info_hash);
    out.push(b'e');

    benc::put_bytes(&mut out, b"q");
    benc::put_bytes(&mut out, b"get_peers");
    benc::put_bytes(&mut out, b"t");
    benc::put_bytes(&mut out, &tx);
    benc::put_bytes(&mut out, b"y");
    benc::put_bytes(&mut out, b"q");

    out.push(b'e');
    out
}

struct KrpcResponse<'a> {
    tx: [u8; 2],
    nodes: Option<&'a [u8]>,
    nodes6: Option<&'a [u8]>,
    values: Vec<&'a [u8]>,
    values6: Vec<&'a [u8]>,
}

impl<'a> KrpcResponse<'a> {
    fn decode(raw: &'a [u8]) -> Option<Self> {
        let msg = BencDict::parse(raw)?;
        if msg.get_bytes(b"y")? != b"r" {
            return None;
        }
        let tx: [u8; 2] = msg.get_bytes(b"t")?.try_into().ok()?;
        let r = msg.get_dict(b"r")?;
        Some(Self {
            tx,
            nodes: r.get_bytes(b"nodes"),
            nodes6: r.get_bytes(b"nodes6"),
            values: r.get_list_bytes(b"values").unwrap_or_default(),
            values6: r.get_list_bytes(b"values6").unwrap_or_default(),
        })
    }
}
