use crate::error::ResolveError;
use data_encoding::BASE32;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Content identifier of a torrent: SHA-1 of the info dict (v1) or SHA-256 (v2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InfoHash {
    V1([u8; 20]),
    V2([u8; 32]),
}

impl InfoHash {
    /// All-zero v1 hash. Requests for it only run the direct-link path.
    pub const SENTINEL: InfoHash = InfoHash::V1([0u8; 20]);

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ResolveError> {
        match bytes.len() {
            20 => {
                let mut out = [0u8; 20];
                out.copy_from_slice(bytes);
                Ok(InfoHash::V1(out))
            }
            32 => {
                let mut out = [0u8; 32];
                out.copy_from_slice(bytes);
                Ok(InfoHash::V2(out))
            }
            n => Err(ResolveError::InvalidReference(format!(
                "info hash must be 20 or 32 bytes, got {n}"
            ))),
        }
    }

    /// Accepts 40/64 hex chars or 32 base32 chars.
    pub fn parse(s: &str) -> Result<Self, ResolveError> {
        let s = s.trim();
        match s.len() {
            40 | 64 => {
                let bytes = hex::decode(s)
                    .map_err(|e| ResolveError::InvalidReference(format!("bad hex hash: {e}")))?;
                Self::from_bytes(&bytes)
            }
            32 => {
                let bytes = BASE32
                    .decode(s.to_ascii_uppercase().as_bytes())
                    .map_err(|e| ResolveError::InvalidReference(format!("bad base32 hash: {e}")))?;
                Self::from_bytes(&bytes)
            }
            n => Err(ResolveError::InvalidReference(format!(
                "unrecognised info hash length {n}"
            ))),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            InfoHash::V1(b) => b,
            InfoHash::V2(b) => b,
        }
    }

    /// 20-byte form used as the DHT key (v2 hashes are truncated, as BEP-52 does).
    pub fn dht_key(&self) -> [u8; 20] {
        let mut out = [0u8; 20];
        out.copy_from_slice(&self.as_bytes()[..20]);
        out
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    pub fn is_sentinel(&self) -> bool {
        *self == Self::SENTINEL
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
