use crate::config::Config;
use crate::error::ResolveError;
use crate::hash::InfoHash;
use crate::pipeline::ResolvedMetadata;
use crate::request::{ResolutionRequest, ResolveFlags};
use crate::resolver::Resolver;
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Duration;

const ACTIVE_TREE: &[u8] = b"active";
const ACTIVE_RECORD_MAGIC: [u8; 4] = *b"LDA1";

fn bincode_opts() -> impl bincode::Options {
    bincode::DefaultOptions::new()
        .with_varint_encoding()
        .with_limit(4 * 1024 * 1024)
}

/// Durable form of an in-flight resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveResolution {
    pub hash: String,
    pub hints: String,
    pub sources: Vec<String>,
    pub tags: Vec<String>,
    pub metadata: BTreeMap<String, String>,
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub disable_peer_bootstrap: bool,
    pub enqueued_at_ms: u64,
}

impl ActiveResolution {
    pub fn from_request(req: &ResolutionRequest) -> Self {
        Self {
            hash: req.hash.to_hex(),
            hints: req.hints.clone(),
            sources: req.sources.clone(),
            tags: req.tags.clone(),
            metadata: req.metadata.clone(),
            timeout_ms: req.timeout.map(|t| t.as_millis() as u64),
            disable_peer_bootstrap: req.flags.disable_peer_bootstrap,
            enqueued_at_ms: req.enqueued_at_ms,
        }
    }

    /// Rebuilds the request for replay: no startup delay, original enqueue time.
    pub fn to_request(&self) -> Result<ResolutionRequest, ResolveError> {
        let hash = InfoHash::parse(&self.hash)?;
        Ok(ResolutionRequest::new(hash)
            .with_hints(self.hints.clone())
            .with_sources(self.sources.clone())
            .with_tags(self.tags.clone())
            .with_metadata(self.metadata.clone())
            .with_timeout(self.timeout_ms.map(Duration::from_millis))
            .with_flags(ResolveFlags {
                disable_peer_bootstrap: self.disable_peer_bootstrap,
                skip_startup_delay: true,
            })
            .with_enqueued_at(self.enqueued_at_ms))
    }
}

fn encode_record(record: &ActiveResolution) -> anyhow::Result<Vec<u8>> {
    let payload = bincode_opts().serialize(record)?;
    let mut out = Vec::with_capacity(ACTIVE_RECORD_MAGIC.len() + payload.len());
    out.extend_from_slice(&ACTIVE_RECORD_MAGIC);
    out.extend_from_slice(&payload);
    Ok(out)
}

fn decode_record(bytes: &[u8]) -> anyhow::Result<(ActiveResolution, bool)> {
    if let Some(payload) = bytes.strip_prefix(&ACTIVE_RECORD_MAGIC[..]) {
        Ok((bincode_opts().deserialize(payload)?, false))
    } else {
        // Hand-written records are JSON.
        Ok((serde_json::from_slice(bytes)?, true))
    }
}

/// Keyed store for in-flight resolutions. Writes are best-effort.
#[cfg_attr(test, mockall::automock)]
pub trait RecoveryStore: Send + Sync {
    fn put(&self, record: &ActiveResolution) -> anyhow::Result<()>;
    fn remove(&self, hash: &str) -> anyhow::Result<()>;
    fn list(&self) -> anyhow::Result<Vec<ActiveResolution>>;
}

pub struct SledRecoveryStore {
    tree: sled::Tree,
}

impl SledRecoveryStore {
    pub fn open(db: &sled::Db) -> anyhow::Result<Self> {
        Ok(Self {
            tree: db.open_tree(ACTIVE_TREE)?,
        })
    }

    // Mark dirty now, reach disk in the background.
    fn flush_later(&self) {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let tree = self.tree.clone();
            handle.spawn(async move {
                if let Err(err) = tree.flush_async().await {
                    tracing::warn!(%err, "recovery: flush failed");
                }
            });
        }
    }
}

impl RecoveryStore for SledRecoveryStore {
    fn put(&self, record: &ActiveResolution) -> anyhow::Result<()> {
        self.tree.insert(record.hash.as_bytes(), encode_record(record)?)?;
        self.flush_later();
        Ok(())
    }

    fn remove(&self, hash: &str) -> anyhow::Result<()> {
        self.tree.remove(hash.as_bytes())?;
        self.flush_later();
        Ok(())
    }

    fn list(&self) -> anyhow::Result<Vec<ActiveResolution>> {
        let mut out = Vec::new();
        for item in self.tree.iter() {
            let (k, v) = item?;
            match decode_record(&v) {
                Ok((record, was_json)) => {
                    if was_json {
                        match encode_record(&record) {
                            Ok(bytes) => {
                                if let Err(err) = self.tree.insert(&k, bytes) {
                                    tracing::warn!(%err, "recovery: failed migrating record to binary");
                                }
                            }
                            Err(err) => tracing::warn!(%err, "recovery: failed encoding record during migration"),
                        }
                    }
                    out.push(record);
                }
                Err(err) => {
                    tracing::warn!(key = %String::from_utf8_lossy(&k), %err, "recovery: dropping unreadable record");
                    let _ = self.tree.remove(&k);
                }
            }
        }
        Ok(out)
    }
}

pub type ReplayOutcome = (InfoHash, Result<Option<ResolvedMetadata>, ResolveError>);

/// Replays persisted resolutions at startup.
pub struct RecoveryManager {
    store: Arc<dyn RecoveryStore>,
    concurrency: usize,
    stagger: Duration,
}

impl RecoveryManager {
    pub fn new(store: Arc<dyn RecoveryStore>, cfg: &Config) -> Self {
        Self {
            store,
            concurrency: cfg.recovery_concurrency,
            stagger: Duration::from_millis(cfg.recovery_stagger_ms),
        }
    }

    /// Persisted records, oldest first.
    pub fn pending(&self) -> Vec<ActiveResolution> {
        let mut records = match self.store.list() {
            Ok(r) => r,
            Err(err) => {
                tracing::warn!(%err, "recovery: failed listing records");
                return Vec::new();
            }
        };
        records.sort_by(|a, b| {
            a.enqueued_at_ms
                .cmp(&b.enqueued_at_ms)
                .then_with(|| a.hash.cmp(&b.hash))
        });
        records
    }

    /// Launches every pending record through `resolver` in enqueue order,
    /// at most `concurrency` at a time, `stagger` apart. Returns once all
    /// are launched; outcomes arrive on the returned set.
    pub async fn replay(&self, resolver: Arc<Resolver>) -> JoinSet<ReplayOutcome> {
        let records = self.pending();
        let permits = Arc::new(Semaphore::new(self.concurrency.max(1)));
        let mut outcomes = JoinSet::new();

        if !records.is_empty() {
            tracing::info!(count = records.len(), concurrency = self.concurrency, "recovery: replaying");
        }

        for (i, record) in records.iter().enumerate() {
            let req = match record.to_request() {
                Ok(r) => r,
                Err(err) => {
                    tracing::warn!(hash = %record.hash, %err, "recovery: dropping bad record");
                    let _ = self.store.remove(&record.hash);
                    continue;
                }
            };
            if i > 0 {
                tokio::time::sleep(self.stagger).await;
            }
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let resolver = resolver.clone();
            outcomes.spawn(async move {
                let hash = req.hash;
                let outcome = resolver.resolve(req).await;
                drop(permit);
                (hash, outcome)
            });
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::direct::LinkFetcher;
    use crate::pipeline::Pipeline;
    use crate::testing::{FakeDht, FakeFetcher};
    use crate::verify::tests::{sample_info, v1_hash};

    fn record(hash: InfoHash, at: u64) -> ActiveResolution {
        ActiveResolution::from_request(
            &ResolutionRequest::new(hash)
                .with_hints("dn=x")
                .with_tags(vec!["t".into()])
                .with_timeout(Some(Duration::from_secs(9)))
                .with_enqueued_at(at),
        )
    }

    #[test]
    fn sled_store_keeps_records_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let hash = v1_hash(&sample_info("a"));
        {
            let db = sled::open(dir.path().join("sled")).unwrap();
            let store = SledRecoveryStore::open(&db).unwrap();
            store.put(&record(hash, 5)).unwrap();
            db.flush().unwrap();
        }
        let db = sled::open(dir.path().join("sled")).unwrap();
        let store = SledRecoveryStore::open(&db).unwrap();
        let got = store.list().unwrap();
        assert_eq!(got, vec![record(hash, 5)]);

        store.remove(&hash.to_hex()).unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn json_records_are_read_and_migrated() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path().join("sled")).unwrap();
        let store = SledRecoveryStore::open(&db).unwrap();
        let rec = record(v1_hash(&sample_info("j")), 7);
        store
            .tree
            .insert(rec.hash.as_bytes(), serde_json::to_vec(&rec).unwrap())
            .unwrap();

        assert_eq!(store.list().unwrap(), vec![rec.clone()]);
        let raw = store.tree.get(rec.hash.as_bytes()).unwrap().unwrap();
        assert!(raw.starts_with(&ACTIVE_RECORD_MAGIC));
    }

    #[test]
    fn replayed_request_skips_delay_and_keeps_enqueue_time() {
        let rec = record(v1_hash(&sample_info("r")), 1234);
        let req = rec.to_request().unwrap();
        assert!(req.flags.skip_startup_delay);
        assert_eq!(req.enqueued_at_ms, 1234);
        assert_eq!(req.timeout, Some(Duration::from_secs(9)));
        assert_eq!(ActiveResolution::from_request(&req), rec);
    }

    fn resolver(
        cfg: &Arc<Config>,
        dht: Arc<FakeDht>,
        store: Arc<dyn RecoveryStore>,
    ) -> Arc<Resolver> {
        let fetcher: Arc<dyn LinkFetcher> = Arc::new(FakeFetcher::default());
        let pipeline = Pipeline::new(cfg.clone(), fetcher, Some(dht), None);
        Resolver::new(pipeline, Some(store))
    }

    #[tokio::test(start_paused = true)]
    async fn restart_replays_in_enqueue_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::defaults().unwrap();
        cfg.data_dir = dir.path().to_path_buf();
        cfg.peer_bootstrap_enabled = false;
        let cfg = Arc::new(cfg);

        let db = sled::open(dir.path().join("sled")).unwrap();
        let store: Arc<dyn RecoveryStore> = Arc::new(SledRecoveryStore::open(&db).unwrap());

        let hashes: Vec<InfoHash> = ["c", "a", "b"].iter().map(|n| v1_hash(&sample_info(n))).collect();
        let enqueued = [300u64, 100, 200];

        let first_dht = Arc::new(FakeDht::default());
        first_dht.hold_open();
        let first = resolver(&cfg, first_dht, store.clone());
        for (hash, at) in hashes.iter().zip(enqueued) {
            let first = first.clone();
            let req = ResolutionRequest::new(*hash).with_enqueued_at(at);
            tokio::spawn(async move { first.resolve(req).await });
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(first.active_hashes().len(), 3);
        // In-memory state is gone; only the store survives.
        drop(first);

        let second_dht = Arc::new(FakeDht::default());
        second_dht.hold_open();
        let second = resolver(&cfg, second_dht.clone(), store.clone());
        let manager = RecoveryManager::new(store.clone(), &cfg);
        let _outcomes = manager.replay(second.clone()).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let expected: Vec<[u8; 20]> = [1usize, 2, 0].iter().map(|&i| hashes[i].dht_key()).collect();
        assert_eq!(second_dht.read_keys(), expected);

        let mut kept: Vec<u64> = store.list().unwrap().iter().map(|r| r.enqueued_at_ms).collect();
        kept.sort_unstable();
        assert_eq!(kept, vec![100, 200, 300]);
    }

    #[tokio::test(start_paused = true)]
    async fn store_failures_do_not_fail_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::defaults().unwrap();
        cfg.data_dir = dir.path().to_path_buf();
        cfg.peer_bootstrap_enabled = false;
        let cfg = Arc::new(cfg);

        let mut store = MockRecoveryStore::new();
        store
            .expect_put()
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("disk full")));
        store
            .expect_remove()
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("disk full")));

        let dht = Arc::new(FakeDht::default());
        let resolver = resolver(&cfg, dht, Arc::new(store));
        let hash = v1_hash(&sample_info("nowhere"));
        let got = resolver
            .resolve(ResolutionRequest::new(hash).with_timeout(Some(Duration::from_secs(1))))
            .await;
        assert_eq!(got, Ok(None));
    }
}
