use crate::benc;
use crate::error::ResolveError;
use crate::hints::MagnetHints;
use crate::network::NetworkSet;
use crate::verify;
use bytes::Bytes;
use rbit::bencode::{self, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use url::Url;

/// Top-level key of the auxiliary dictionary. Lives outside `info`, so the
/// info hash is untouched.
pub const AUX_KEY: &[u8] = b"lodestone";

/// Scheme of the decentralised announce placed on placeholder torrents.
pub const DHT_ANNOUNCE_SCHEME: &str = "dht://";

/// Everything merged into resolved metadata on its way back to the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Augmentation {
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
    pub web_seeds: Vec<String>,
    pub networks: NetworkSet,
    pub tags: Vec<String>,
    pub metadata: BTreeMap<String, String>,
    pub primary_file_index: Option<u32>,
    pub peers: Vec<SocketAddr>,
}

impl Augmentation {
    pub fn from_hints(hints: &MagnetHints) -> Self {
        Self {
            display_name: hints.display_name.clone(),
            trackers: hints.trackers.clone(),
            web_seeds: hints.web_seeds.clone(),
            tags: hints.tags.clone(),
            primary_file_index: hints.primary_file_index,
            ..Self::default()
        }
    }
}

/// Merges `aug` into a full torrent. Returns the input unchanged when there
/// is nothing new to add, so augmenting twice is byte-identical.
pub fn augment(torrent: &[u8], aug: &Augmentation) -> Result<Vec<u8>, ResolveError> {
    let info_raw = verify::info_slice(torrent)
        .ok_or_else(|| ResolveError::fatal("augment: torrent has no info dictionary"))?;
    let mut root = bencode::decode(torrent)
        .ok()
        .and_then(Value::into_dict)
        .ok_or_else(|| ResolveError::fatal("augment: torrent does not decode"))?;

    let mut changed = strip_dht_announce(&mut root);
    changed |= merge_trackers(&mut root, &aug.trackers);
    changed |= merge_web_seeds(&mut root, &aug.web_seeds);
    changed |= merge_peers(&mut root, &aug.peers);

    let info_name = root.get(&b"info"[..]).and_then(info_name);
    let mut aux = match root.remove(AUX_KEY) {
        Some(Value::Dict(d)) => d,
        _ => BTreeMap::new(),
    };
    let before = aux.clone();

    if let Some(dn) = &aug.display_name {
        if !aux.contains_key(&b"display-name"[..]) && info_name.as_deref() != Some(dn.as_str()) {
            aux.insert(key("display-name"), Value::string(dn));
        }
        aux.insert(key("content-title"), Value::string(dn));
    }
    if !aug.networks.is_empty() {
        let names = aug.networks.iter().map(|n| Value::string(n.as_str())).collect();
        aux.insert(key("networks"), Value::List(names));
    }
    if !aug.tags.is_empty() {
        let mut tags = aux
            .get(&b"tags"[..])
            .map(string_list)
            .unwrap_or_default();
        for t in &aug.tags {
            if !tags.contains(t) {
                tags.push(t.clone());
            }
        }
        aux.insert(key("tags"), Value::List(tags.iter().map(|t| Value::string(t)).collect()));
    }
    if !aug.metadata.is_empty() {
        let mut meta = match aux.remove(&b"metadata"[..]) {
            Some(Value::Dict(d)) => d,
            _ => BTreeMap::new(),
        };
        for (k, v) in &aug.metadata {
            meta.insert(key(k), Value::string(v));
        }
        aux.insert(key("metadata"), Value::Dict(meta));
    }
    if let Some(pfi) = aug.primary_file_index {
        aux.insert(key("primary-file-index"), Value::Integer(i64::from(pfi)));
    }

    changed |= aux != before;
    if !aux.is_empty() {
        root.insert(key_bytes(AUX_KEY), Value::Dict(aux));
    }

    if !changed {
        return Ok(torrent.to_vec());
    }
    encode_with_info(&root, info_raw)
}

/// Display name for callers: the embedded one if set, else the info name.
pub fn display_name(torrent: &[u8]) -> Option<String> {
    let root = bencode::decode(torrent).ok()?;
    root.get(AUX_KEY)
        .and_then(|a| a.get(b"display-name"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| root.get(b"info").and_then(info_name))
}

/// Every tracker URL of the torrent, `announce` first.
pub fn trackers(torrent: &[u8]) -> Vec<String> {
    match bencode::decode(torrent).ok().and_then(Value::into_dict) {
        Some(root) => all_trackers(&root),
        None => Vec::new(),
    }
}

pub fn web_seeds(torrent: &[u8]) -> Vec<String> {
    bencode::decode(torrent)
        .ok()
        .and_then(|root| root.get(b"url-list").map(string_list))
        .unwrap_or_default()
}

/// Peers cached under `tracker_peers`.
pub fn tracker_peers(torrent: &[u8]) -> Vec<SocketAddr> {
    let Some(root) = bencode::decode(torrent).ok() else {
        return Vec::new();
    };
    let Some(list) = root.get(b"tracker_peers").and_then(Value::as_list) else {
        return Vec::new();
    };
    list.iter()
        .filter_map(|p| {
            let ip = p.get(b"ip")?.as_str()?.parse().ok()?;
            let port = u16::try_from(p.get(b"port")?.as_integer()?).ok()?;
            Some(SocketAddr::new(ip, port))
        })
        .collect()
}

/// Entries of the auxiliary dictionary, for inspection.
pub fn aux(torrent: &[u8]) -> Option<BTreeMap<Bytes, Value>> {
    bencode::decode(torrent)
        .ok()?
        .get(AUX_KEY)?
        .as_dict()
        .cloned()
}

fn info_name(info: &Value) -> Option<String> {
    info.get(b"name.utf-8")
        .or_else(|| info.get(b"name"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn all_trackers(root: &BTreeMap<Bytes, Value>) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(a) = root.get(&b"announce"[..]).and_then(Value::as_str) {
        out.push(a.to_string());
    }
    if let Some(tiers) = root.get(&b"announce-list"[..]).and_then(Value::as_list) {
        for tier in tiers {
            for t in tier.as_list().map(|l| l.as_slice()).unwrap_or_default() {
                if let Some(s) = t.as_str() {
                    if !out.iter().any(|o| same_url(o, s)) {
                        out.push(s.to_string());
                    }
                }
            }
        }
    }
    out
}

fn strip_dht_announce(root: &mut BTreeMap<Bytes, Value>) -> bool {
    let mut changed = false;
    if let Some(Value::List(tiers)) = root.get_mut(&b"announce-list"[..]) {
        for tier in tiers.iter_mut() {
            if let Value::List(urls) = tier {
                let before = urls.len();
                urls.retain(|u| !u.as_str().is_some_and(is_dht_announce));
                changed |= urls.len() != before;
            }
        }
        let before = tiers.len();
        tiers.retain(|t| !t.as_list().is_some_and(|l| l.is_empty()));
        changed |= tiers.len() != before;
    }
    if matches!(root.get(&b"announce-list"[..]), Some(Value::List(l)) if l.is_empty()) {
        root.remove(&b"announce-list"[..]);
    }

    let announce_is_dht = root
        .get(&b"announce"[..])
        .and_then(Value::as_str)
        .is_some_and(is_dht_announce);
    if announce_is_dht {
        changed = true;
        root.remove(&b"announce"[..]);
        if let Some(first) = all_trackers(root).into_iter().next() {
            root.insert(key("announce"), Value::string(&first));
        }
    }
    changed
}

fn merge_trackers(root: &mut BTreeMap<Bytes, Value>, trackers: &[String]) -> bool {
    let existing = all_trackers(root);
    let mut fresh: Vec<&String> = Vec::new();
    for t in trackers {
        if is_dht_announce(t) {
            continue;
        }
        if !existing.iter().chain(fresh.iter().copied()).any(|e| same_url(e, t)) {
            fresh.push(t);
        }
    }
    if fresh.is_empty() {
        return false;
    }

    let mut tiers = match root.remove(&b"announce-list"[..]) {
        Some(Value::List(l)) => l,
        _ => Vec::new(),
    };
    let announce = root
        .get(&b"announce"[..])
        .and_then(Value::as_str)
        .map(str::to_string);
    match announce {
        Some(a) => {
            if tiers.is_empty() {
                tiers.push(Value::List(vec![Value::string(&a)]));
            }
        }
        None => {
            root.insert(key("announce"), Value::string(fresh[0]));
        }
    }
    for t in fresh {
        tiers.push(Value::List(vec![Value::string(t)]));
    }
    root.insert(key("announce-list"), Value::List(tiers));
    true
}

fn merge_web_seeds(root: &mut BTreeMap<Bytes, Value>, seeds: &[String]) -> bool {
    if seeds.is_empty() {
        return false;
    }
    let mut existing = root
        .get(&b"url-list"[..])
        .map(string_list)
        .unwrap_or_default();
    let mut update = false;
    for s in seeds {
        if !existing.iter().any(|e| same_url(e, s)) {
            existing.push(s.clone());
            update = true;
        }
    }
    if update {
        let list = existing.iter().map(|s| Value::string(s)).collect();
        root.insert(key("url-list"), Value::List(list));
    }
    update
}

fn merge_peers(root: &mut BTreeMap<Bytes, Value>, peers: &[SocketAddr]) -> bool {
    if peers.is_empty() {
        return false;
    }
    let mut list = match root.remove(&b"tracker_peers"[..]) {
        Some(Value::List(l)) => l,
        _ => Vec::new(),
    };
    let known: Vec<(String, i64)> = list
        .iter()
        .filter_map(|p| {
            let ip = p.get(b"ip")?.as_str()?.to_string();
            Some((ip, p.get(b"port")?.as_integer()?))
        })
        .collect();

    let mut update = false;
    for peer in peers {
        let ip = peer.ip().to_string();
        let port = i64::from(peer.port());
        if known.iter().any(|(i, p)| *i == ip && *p == port) {
            continue;
        }
        let mut entry = BTreeMap::new();
        entry.insert(key("ip"), Value::string(&ip));
        entry.insert(key("port"), Value::Integer(port));
        list.push(Value::Dict(entry));
        update = true;
    }
    root.insert(key("tracker_peers"), Value::List(list));
    update
}

/// Re-encodes `root` with the original info bytes spliced in at `info`.
fn encode_with_info(root: &BTreeMap<Bytes, Value>, info_raw: &[u8]) -> Result<Vec<u8>, ResolveError> {
    let mut out = Vec::with_capacity(info_raw.len() + 256);
    out.push(b'd');
    for (k, v) in root {
        benc::put_bytes(&mut out, k);
        if k.as_ref() == b"info" {
            out.extend_from_slice(info_raw);
        } else {
            let encoded = bencode::encode(v)
                .map_err(|e| ResolveError::fatal(format!("augment: encode failed: {e}")))?;
            out.extend_from_slice(&encoded);
        }
    }
    out.push(b'e');
    Ok(out)
}

fn string_list(v: &Value) -> Vec<String> {
    match v {
        Value::Bytes(_) => v.as_str().map(|s| vec![s.to_string()]).unwrap_or_default(),
        Value::List(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn is_dht_announce(url: &str) -> bool {
    url.to_ascii_lowercase().starts_with(DHT_ANNOUNCE_SCHEME)
}

fn same_url(a: &str, b: &str) -> bool {
    match (Url::parse(a), Url::parse(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn key(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

fn key_bytes(s: &[u8]) -> Bytes {
    Bytes::copy_from_slice(s)
}
