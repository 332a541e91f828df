use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Routing fabric a request may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Network {
    Public,
    I2p,
    Tor,
}

impl Network {
    pub const ALL: [Network; 3] = [Network::Public, Network::I2p, Network::Tor];

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Public => "Public",
            Network::I2p => "I2P",
            Network::Tor => "Tor",
        }
    }

    /// Case-insensitive lookup of a network name (`net=` hint, config lists).
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|n| n.as_str().eq_ignore_ascii_case(name))
    }

    /// Classifies a host name or literal address.
    pub fn classify_host(host: &str) -> Self {
        let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
        if host.ends_with(".i2p") {
            Network::I2p
        } else if host.ends_with(".onion") {
            Network::Tor
        } else {
            Network::Public
        }
    }

    /// Classifies a `host:port` source string.
    pub fn classify_source(source: &str) -> Self {
        let host = match source.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
            _ => source,
        };
        Self::classify_host(host.trim_start_matches('[').trim_end_matches(']'))
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of overlays a request is allowed to use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSet(BTreeSet<Network>);

impl NetworkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn only(network: Network) -> Self {
        let mut set = Self::new();
        set.insert(network);
        set
    }

    pub fn insert(&mut self, network: Network) -> bool {
        self.0.insert(network)
    }

    pub fn remove(&mut self, network: Network) -> bool {
        self.0.remove(&network)
    }

    pub fn contains(&self, network: Network) -> bool {
        self.0.contains(&network)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = Network> + '_ {
        self.0.iter().copied()
    }

    pub fn extend(&mut self, other: &NetworkSet) {
        self.0.extend(other.iter());
    }

    pub fn names(&self) -> Vec<String> {
        self.iter().map(|n| n.as_str().to_string()).collect()
    }
}

impl FromIterator<Network> for NetworkSet {
    fn from_iter<T: IntoIterator<Item = Network>>(iter: T) -> Self {
        NetworkSet(iter.into_iter().collect())
    }
}
