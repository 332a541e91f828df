use crate::network::{Network, NetworkSet};
use percent_encoding::percent_decode_str;
use url::Url;

/// Legacy single-token prefix that pins a reference to the I2P overlay.
pub const LEGACY_OVERLAY_PREFIX: &str = "maggot_sha1";

/// Direct-download candidates beyond this many are ignored.
pub const MAX_DIRECT_LINKS: usize = 3;

/// Hints carried by the query part of a magnet reference.
///
/// Parsing never fails: entries that do not decode or do not form a usable
/// URL are skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MagnetHints {
    pub trackers: Vec<String>,
    pub web_seeds: Vec<String>,
    pub display_name: Option<String>,
    pub tags: Vec<String>,
    pub explicit_networks: NetworkSet,
    pub direct_links: Vec<Url>,
    pub extra_sources: Vec<String>,
    pub primary_file_index: Option<u32>,
    pub legacy_overlay: bool,
    host_networks: NetworkSet,
}

impl MagnetHints {
    pub fn parse(args: &str) -> Self {
        let mut hints = Self::default();

        for bit in args.split('&') {
            if bit.starts_with(LEGACY_OVERLAY_PREFIX) {
                hints.legacy_overlay = true;
                continue;
            }
            let Some((key, raw)) = bit.split_once('=') else {
                continue;
            };
            if raw.contains('=') {
                continue;
            }
            let Some(value) = decode_value(raw) else {
                tracing::trace!(key, "hints: undecodable value skipped");
                continue;
            };

            match key.to_ascii_lowercase().as_str() {
                "tr" => {
                    if let Some(host) = url_host(&value) {
                        hints.host_networks.insert(Network::classify_host(&host));
                        hints.trackers.push(value);
                    }
                }
                "ws" => {
                    if url_host(&value).is_some() {
                        hints.web_seeds.push(value);
                    }
                }
                "dn" => {
                    if !value.trim().is_empty() {
                        hints.display_name = Some(value);
                    }
                }
                "tag" => {
                    if !value.trim().is_empty() && !hints.tags.contains(&value) {
                        hints.tags.push(value);
                    }
                }
                "net" => {
                    if let Some(net) = Network::from_name(&value) {
                        hints.explicit_networks.insert(net);
                    }
                }
                "fl" | "xs" | "as" => {
                    if let Ok(url) = Url::parse(&value) {
                        if let Some(host) = url.host_str() {
                            hints.host_networks.insert(Network::classify_host(host));
                            hints.direct_links.push(url);
                        }
                    }
                }
                "x.pe" => hints.extra_sources.push(value),
                "pfi" => hints.primary_file_index = value.trim().parse().ok(),
                _ => {}
            }
        }

        if hints.legacy_overlay {
            hints.direct_links.clear();
        }
        hints
    }

    /// Networks the request may use.
    ///
    /// An explicit `net=` hint decides alone. Otherwise the hosts of trackers
    /// and direct links decide; with no inferable host the public network is
    /// used if it is enabled globally. A disabled public network is always
    /// removed from inferred sets.
    pub fn networks(&self, public_enabled: bool) -> NetworkSet {
        if self.legacy_overlay {
            return NetworkSet::only(Network::I2p);
        }
        if !self.explicit_networks.is_empty() {
            return self.explicit_networks.clone();
        }

        let mut set = self.host_networks.clone();
        if public_enabled {
            if set.is_empty() {
                set.insert(Network::Public);
            }
        } else {
            set.remove(Network::Public);
        }
        set
    }

    /// Direct links that may be fetched for the given network set.
    pub fn usable_direct_links(&self, networks: &NetworkSet) -> Vec<Url> {
        self.direct_links
            .iter()
            .take(MAX_DIRECT_LINKS)
            .filter(|u| {
                u.host_str()
                    .is_some_and(|h| networks.contains(Network::classify_host(h)))
            })
            .cloned()
            .collect()
    }
}

fn decode_value(raw: &str) -> Option<String> {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8()
        .ok()
        .map(|s| s.into_owned())
}

fn url_host(value: &str) -> Option<String> {
    Url::parse(value).ok()?.host_str().map(|h| h.to_string())
}
