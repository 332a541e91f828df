use crate::hash::InfoHash;
use serde::Serialize;
use std::net::SocketAddr;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ProgressEvent {
    Activity(String),
    Size(u64),
    Completeness(u8),
    Contributor(SocketAddr),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub hash: String,
    pub event: ProgressEvent,
}

/// Per-resolution handle onto the resolver's progress channel.
#[derive(Clone)]
pub struct Reporter {
    hash: InfoHash,
    tx: Option<broadcast::Sender<Progress>>,
}

impl Reporter {
    pub fn new(hash: InfoHash, tx: broadcast::Sender<Progress>) -> Self {
        Self { hash, tx: Some(tx) }
    }

    pub fn silent(hash: InfoHash) -> Self {
        Self { hash, tx: None }
    }

    pub fn activity(&self, msg: impl Into<String>) {
        self.send(ProgressEvent::Activity(msg.into()));
    }

    pub fn size(&self, bytes: u64) {
        self.send(ProgressEvent::Size(bytes));
    }

    pub fn completeness(&self, percent: u8) {
        self.send(ProgressEvent::Completeness(percent.min(100)));
    }

    pub fn contributor(&self, addr: SocketAddr) {
        self.send(ProgressEvent::Contributor(addr));
    }

    fn send(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            // No subscribers is fine.
            let _ = tx.send(Progress {
                hash: self.hash.to_hex(),
                event,
            });
        }
    }
}
