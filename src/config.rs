use crate::network::{Network, NetworkSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Upper bound on resolvable metadata size; also the placeholder file length.
pub const DEFAULT_PLACEHOLDER_SIZE: u64 = 64 * 1024 * 1024;

/// Largest chunk handed out by a placeholder read channel.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 16 * 1024;

pub const DEFAULT_EXTRA_TRACKER: &str = "udp://tracker.opentrackr.org:1337/announce";

#[derive(Clone, Debug)]
pub struct Config {
    pub data_dir: PathBuf,

    // Web
    pub http_addr: SocketAddr,

    // Resolution
    pub default_timeout_secs: u64,
    pub enabled_networks: NetworkSet,

    // DHT
    pub dht_enabled: bool,
    pub dht_bind: String,
    pub dht_bootstrap: Vec<String>,
    pub dht_liveness_timeout_ms: u64,
    pub dht_source_delay_secs: u64,
    pub dht_contact_inflight: usize,
    pub dht_query_timeout_ms: u64,
    pub dht_inflight: usize,
    pub dht_max_queries: usize,
    pub dht_max_peers: usize,

    // Peer-wire bootstrap
    pub peer_bootstrap_enabled: bool,
    pub peer_bootstrap_delay_secs: u64,
    pub peer_inject_delay_secs: u64,
    pub extra_trackers: Vec<String>,
    pub placeholder_size: u64,
    pub read_chunk_size: usize,
    pub peer_connect_timeout_ms: u64,

    // Direct links
    pub direct_link_max_bytes: u64,

    // Recovery
    pub recovery_enabled: bool,
    pub recovery_concurrency: usize,
    pub recovery_stagger_ms: u64,

    // Cleanup
    pub scratch_ttl_secs: u64,
    pub cleanup_every_secs: u64,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        // If a .env file exists, load it. If not, keep going.
        // Precedence: process env > .env > code defaults.
        let _ = dotenvy::dotenv();
        Self::build(&|name| std::env::var(name).ok())
    }

    /// Code defaults, ignoring the environment.
    pub fn defaults() -> anyhow::Result<Self> {
        Self::build(&|_| None)
    }

    fn build(get: &dyn Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let env = Env { get };

        let data_dir = PathBuf::from(env.string("LODESTONE_DATA_DIR", "data"));

        let http_addr = SocketAddr::from_str(&env.string("LODESTONE_ADDR", "127.0.0.1:3000"))
            .map_err(|e| anyhow::anyhow!("parse LODESTONE_ADDR: {e}"))?;

        let default_timeout_secs = env.u64("LODESTONE_TIMEOUT_SECS", 0);
        let mut enabled_networks = NetworkSet::new();
        for name in env.csv("LODESTONE_NETWORKS", &["public", "i2p", "tor"]) {
            let net = Network::from_name(&name)
                .ok_or_else(|| anyhow::anyhow!("parse LODESTONE_NETWORKS: unknown network {name:?}"))?;
            enabled_networks.insert(net);
        }

        let dht_enabled = env.enabled("LODESTONE_DHT", true);
        let dht_bind = env.string("LODESTONE_DHT_BIND", "0.0.0.0:0");
        let dht_bootstrap = env.csv(
            "LODESTONE_DHT_BOOTSTRAP",
            &[
                "router.bittorrent.com:6881",
                "dht.transmissionbt.com:6881",
                "router.utorrent.com:6881",
            ],
        );
        let dht_liveness_timeout_ms = env.u64("LODESTONE_DHT_LIVENESS_TIMEOUT_MS", 20_000);
        let dht_source_delay_secs = env.u64("LODESTONE_DHT_SOURCE_DELAY_SECS", 10);
        let dht_contact_inflight = env.usize("LODESTONE_DHT_CONTACT_INFLIGHT", 4).max(1);
        let dht_query_timeout_ms = env.u64("LODESTONE_DHT_QUERY_TIMEOUT_MS", 900);
        let dht_inflight = env.usize("LODESTONE_DHT_INFLIGHT", 8).max(1);
        let dht_max_queries = env.usize("LODESTONE_DHT_MAX_QUERIES", 64);
        let dht_max_peers = env.usize("LODESTONE_DHT_MAX_PEERS", 64);

        let peer_bootstrap_enabled = env.enabled("LODESTONE_PEER_BOOTSTRAP", true);
        let peer_bootstrap_delay_secs = env.u64("LODESTONE_PEER_BOOTSTRAP_DELAY_SECS", 0);
        let peer_inject_delay_secs = env.u64("LODESTONE_PEER_INJECT_DELAY_SECS", 5);
        let extra_trackers = env.csv("LODESTONE_EXTRA_TRACKERS", &[DEFAULT_EXTRA_TRACKER]);
        let placeholder_size = env.u64("LODESTONE_PLACEHOLDER_SIZE", DEFAULT_PLACEHOLDER_SIZE);
        let read_chunk_size = env
            .usize("LODESTONE_READ_CHUNK_SIZE", DEFAULT_READ_CHUNK_SIZE)
            .max(1);
        let peer_connect_timeout_ms = env.u64("LODESTONE_PEER_CONNECT_TIMEOUT_MS", 5_000);

        let direct_link_max_bytes =
            env.u64("LODESTONE_DIRECT_LINK_MAX_BYTES", DEFAULT_PLACEHOLDER_SIZE);

        let recovery_enabled = env.enabled("LODESTONE_RECOVERY", true);
        let recovery_concurrency = env.usize("LODESTONE_RECOVERY_CONCURRENCY", 32).clamp(8, 512);
        let recovery_stagger_ms = env.u64("LODESTONE_RECOVERY_STAGGER_MS", 500);

        let scratch_ttl_secs = env.u64("LODESTONE_SCRATCH_TTL_SECS", 24 * 60 * 60);
        let cleanup_every_secs = env.u64("LODESTONE_CLEANUP_EVERY_SECS", 60 * 60);

        Ok(Self {
            data_dir,
            http_addr,

            default_timeout_secs,
            enabled_networks,

            dht_enabled,
            dht_bind,
            dht_bootstrap,
            dht_liveness_timeout_ms,
            dht_source_delay_secs,
            dht_contact_inflight,
            dht_query_timeout_ms,
            dht_inflight,
            dht_max_queries,
            dht_max_peers,

            peer_bootstrap_enabled,
            peer_bootstrap_delay_secs,
            peer_inject_delay_secs,
            extra_trackers,
            placeholder_size,
            read_chunk_size,
            peer_connect_timeout_ms,

            direct_link_max_bytes,

            recovery_enabled,
            recovery_concurrency,
            recovery_stagger_ms,

            scratch_ttl_secs,
            cleanup_every_secs,
        })
    }

    pub fn public_enabled(&self) -> bool {
        self.enabled_networks.contains(Network::Public)
    }

    /// Timeout applied when a request does not carry one. `None` is unbounded.
    pub fn default_timeout(&self) -> Option<Duration> {
        (self.default_timeout_secs > 0).then(|| Duration::from_secs(self.default_timeout_secs))
    }

    /// Root of per-hash scratch directories used by bootstrap sessions.
    pub fn scratch_root(&self) -> PathBuf {
        self.data_dir.join("md")
    }
}

struct Env<'a> {
    get: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
    fn opt_string(&self, name: &str) -> Option<String> {
        (self.get)(name)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn string(&self, name: &str, default: &str) -> String {
        self.opt_string(name).unwrap_or_else(|| default.to_string())
    }

    fn u64(&self, name: &str, default: u64) -> u64 {
        self.opt_string(name)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(default)
    }

    fn usize(&self, name: &str, default: usize) -> usize {
        self.opt_string(name)
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(default)
    }

    fn csv(&self, name: &str, defaults: &[&str]) -> Vec<String> {
        if let Some(s) = self.opt_string(name) {
            let v: Vec<String> = s
                .split(',')
                .map(|x| x.trim().to_string())
                .filter(|x| !x.is_empty())
                .collect();
            if !v.is_empty() {
                return v;
            }
        }
        defaults.iter().map(|s| s.to_string()).collect()
    }

    fn enabled(&self, name: &str, default: bool) -> bool {
        match self.opt_string(name) {
            None => default,
            Some(v) => {
                let v = v.to_ascii_lowercase();
                if matches!(v.as_str(), "0" | "false" | "off" | "no") {
                    return false;
                }
                if matches!(v.as_str(), "1" | "true" | "on" | "yes") {
                    return true;
                }
                default
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn with(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::build(&move |name| map.get(name).cloned())
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::defaults().unwrap();
        assert_eq!(cfg.placeholder_size, 64 * 1024 * 1024);
        assert_eq!(cfg.read_chunk_size, 16 * 1024);
        assert_eq!(cfg.recovery_concurrency, 32);
        assert_eq!(cfg.dht_liveness_timeout_ms, 20_000);
        assert_eq!(cfg.extra_trackers, vec![DEFAULT_EXTRA_TRACKER]);
        assert!(cfg.public_enabled());
        assert_eq!(cfg.default_timeout(), None);
        assert_eq!(cfg.scratch_root(), PathBuf::from("data").join("md"));
    }

    #[test]
    fn env_overrides_and_clamps() {
        let cfg = with(&[
            ("LODESTONE_RECOVERY_CONCURRENCY", "2"),
            ("LODESTONE_NETWORKS", "i2p, tor"),
            ("LODESTONE_DHT", "off"),
            ("LODESTONE_TIMEOUT_SECS", "30"),
            ("LODESTONE_DHT_LIVENESS_TIMEOUT_MS", "garbage"),
        ])
        .unwrap();
        assert_eq!(cfg.recovery_concurrency, 8);
        assert!(!cfg.public_enabled());
        assert!(cfg.enabled_networks.contains(Network::Tor));
        assert!(!cfg.dht_enabled);
        assert_eq!(cfg.default_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(cfg.dht_liveness_timeout_ms, 20_000);

        let cfg = with(&[("LODESTONE_RECOVERY_CONCURRENCY", "100000")]).unwrap();
        assert_eq!(cfg.recovery_concurrency, 512);
    }

    #[test]
    fn rejects_bad_addr_and_unknown_network() {
        assert!(with(&[("LODESTONE_ADDR", "nope")]).is_err());
        assert!(with(&[("LODESTONE_NETWORKS", "public,carrier")]).is_err());
    }
}
