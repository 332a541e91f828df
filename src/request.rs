use crate::error::ResolveError;
use crate::hash::InfoHash;
use crate::hints::MagnetHints;
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Behaviour switches carried by a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveFlags {
    pub disable_peer_bootstrap: bool,
    /// Start the peer-wire path without its configured delay (recovery replay).
    pub skip_startup_delay: bool,
}

/// One resolution request. Built once, never mutated by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionRequest {
    pub hash: InfoHash,
    pub hints: String,
    pub sources: Vec<String>,
    pub tags: Vec<String>,
    pub metadata: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
    pub flags: ResolveFlags,
    pub enqueued_at_ms: u64,
}

impl ResolutionRequest {
    pub fn new(hash: InfoHash) -> Self {
        Self {
            hash,
            hints: String::new(),
            sources: Vec::new(),
            tags: Vec::new(),
            metadata: BTreeMap::new(),
            timeout: None,
            flags: ResolveFlags::default(),
            enqueued_at_ms: now_ms(),
        }
    }

    /// Parses `magnet:?xt=urn:btih:<hash>&...`. Everything but `xt` is kept
    /// as the hint string in its original order.
    pub fn from_magnet(uri: &str) -> Result<Self, ResolveError> {
        let uri = uri.trim();
        let query = uri
            .strip_prefix("magnet:?")
            .or_else(|| uri.strip_prefix("magnet:"))
            .ok_or_else(|| ResolveError::InvalidReference("missing magnet: scheme".into()))?;

        let mut hash = None;
        let mut rest = Vec::new();
        for bit in query.split('&') {
            let lower = bit.to_ascii_lowercase();
            if let Some(v) = lower.strip_prefix("xt=urn:btih:") {
                if hash.is_none() {
                    hash = Some(InfoHash::parse(v)?);
                }
            } else if let Some(v) = lower.strip_prefix("xt=urn:btmh:") {
                // multihash: 0x12 0x20 prefix for sha2-256
                if hash.is_none() {
                    let digest = v.strip_prefix("1220").ok_or_else(|| {
                        ResolveError::InvalidReference("unsupported multihash".into())
                    })?;
                    hash = Some(InfoHash::parse(digest)?);
                }
            } else if !bit.is_empty() {
                rest.push(bit);
            }
        }

        let hash = hash.ok_or_else(|| ResolveError::InvalidReference("missing xt".into()))?;
        Ok(Self::new(hash).with_hints(rest.join("&")))
    }

    pub fn with_hints(mut self, hints: impl Into<String>) -> Self {
        self.hints = hints.into();
        self
    }

    pub fn with_sources(mut self, sources: Vec<String>) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_flags(mut self, flags: ResolveFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_enqueued_at(mut self, enqueued_at_ms: u64) -> Self {
        self.enqueued_at_ms = enqueued_at_ms;
        self
    }

    pub fn parsed_hints(&self) -> MagnetHints {
        MagnetHints::parse(&self.hints)
    }

    /// Tags from the request itself followed by `tag=` hints, deduplicated.
    pub fn all_tags(&self, hints: &MagnetHints) -> Vec<String> {
        let mut out = self.tags.clone();
        for t in &hints.tags {
            if !out.contains(t) {
                out.push(t.clone());
            }
        }
        out
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magnet_keeps_hints_in_order() {
        let req = ResolutionRequest::from_magnet(
            "magnet:?xt=urn:btih:C12FE1C06BBA254A9DC9F519B335AA7C1367A88A&dn=My+File&tr=http://t1/announce",
        )
        .unwrap();
        assert_eq!(req.hash.to_hex(), "c12fe1c06bba254a9dc9f519b335aa7c1367a88a");
        assert_eq!(req.hints, "dn=My+File&tr=http://t1/announce");
        assert_eq!(req.parsed_hints().display_name.as_deref(), Some("My File"));
    }

    #[test]
    fn multihash_v2() {
        let hex64 = "ab".repeat(32);
        let req = ResolutionRequest::from_magnet(&format!("magnet:?xt=urn:btmh:1220{hex64}")).unwrap();
        assert!(matches!(req.hash, InfoHash::V2(_)));
    }

    #[test]
    fn rejects_missing_hash() {
        assert!(ResolutionRequest::from_magnet("magnet:?dn=x").is_err());
        assert!(ResolutionRequest::from_magnet("http://x").is_err());
    }

    #[test]
    fn tags_merge_without_duplicates() {
        let req = ResolutionRequest::new(InfoHash::SENTINEL)
            .with_tags(vec!["a".into()])
            .with_hints("tag=a&tag=b");
        assert_eq!(req.all_tags(&req.parsed_hints()), vec!["a", "b"]);
    }
}
