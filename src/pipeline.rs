use crate::augment::{self, Augmentation};
use crate::bootstrap::{BootstrapConfig, BootstrapSession, TransferEngine};
use crate::budget::Budget;
use crate::config::Config;
use crate::dht::{Dht, DhtLookup, DhtLookupConfig};
use crate::direct::{self, LinkFetcher};
use crate::error::ResolveError;
use crate::network::{Network, NetworkSet};
use crate::progress::Reporter;
use crate::request::ResolutionRequest;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// Verified, augmented metadata and the networks used to obtain it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMetadata {
    pub torrent: Vec<u8>,
    pub networks: NetworkSet,
}

#[derive(Debug)]
struct Winner {
    path: &'static str,
    torrent: Vec<u8>,
    peers: Vec<SocketAddr>,
    networks: NetworkSet,
}

/// Write-once result holder shared by the racing paths. The first offer
/// wins and fires `done`, which tells every other path to stop.
struct ResultSlot {
    winner: Mutex<Option<Winner>>,
    done: CancellationToken,
}

impl ResultSlot {
    fn offer(&self, winner: Winner) -> bool {
        {
            let mut slot = self.winner.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(winner);
        }
        self.done.cancel();
        true
    }

    fn take(&self) -> Option<Winner> {
        self.winner.lock().take()
    }
}

/// One resolution run: direct links, DHT and peer-wire bootstrap racing
/// against a single budget.
pub struct Pipeline {
    cfg: Arc<Config>,
    fetcher: Arc<dyn LinkFetcher>,
    dht: Option<Arc<dyn Dht>>,
    engine: Option<Arc<dyn TransferEngine>>,
}

impl Pipeline {
    pub fn new(
        cfg: Arc<Config>,
        fetcher: Arc<dyn LinkFetcher>,
        dht: Option<Arc<dyn Dht>>,
        engine: Option<Arc<dyn TransferEngine>>,
    ) -> Self {
        Self {
            cfg,
            fetcher,
            dht,
            engine,
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// `Ok(None)` means nothing verified within the budget.
    pub async fn run(
        &self,
        req: &ResolutionRequest,
        cancel: CancellationToken,
        reporter: Reporter,
    ) -> Result<Option<ResolvedMetadata>, ResolveError> {
        let hash = req.hash;
        let hints = req.parsed_hints();
        let networks = hints.networks(self.cfg.public_enabled());
        let budget = Budget::new(req.timeout.or(self.cfg.default_timeout()));
        let slot = Arc::new(ResultSlot {
            winner: Mutex::new(None),
            done: cancel.child_token(),
        });

        tracing::debug!(
            hash = %hash,
            networks = ?networks.names(),
            timeout = ?budget.remaining(),
            "pipeline: start"
        );

        let mut paths: JoinSet<Result<(), ResolveError>> = JoinSet::new();

        let links = hints.usable_direct_links(&networks);
        if !links.is_empty() {
            let fetcher = self.fetcher.clone();
            let slot = slot.clone();
            paths.spawn(async move {
                let done = slot.done.clone();
                if let Some(torrent) =
                    direct::fetch_first_verified(fetcher, links, hash, budget, done).await
                {
                    slot.offer(Winner {
                        path: "direct",
                        torrent,
                        peers: Vec::new(),
                        networks: NetworkSet::new(),
                    });
                }
                Ok(())
            });
        }

        let mut sources = req.sources.clone();
        for s in &hints.extra_sources {
            if !sources.contains(s) {
                sources.push(s.clone());
            }
        }

        if hash.is_sentinel() {
            // Sentinel hashes only ever use direct links.
            tracing::trace!(hash = %hash, "pipeline: sentinel hash, direct links only");
        } else {
            if let Some(dht) = self.dht.clone().filter(|_| {
                self.cfg.dht_enabled && networks.contains(Network::Public)
            }) {
                let lookup = DhtLookup::new(dht, DhtLookupConfig::from(&*self.cfg));
                let slot = slot.clone();
                let sources = sources.clone();
                let reporter = reporter.clone();
                paths.spawn(async move {
                    let done = slot.done.clone();
                    if let Some(hit) = lookup.lookup(hash, &sources, budget, done, reporter).await {
                        slot.offer(Winner {
                            path: "dht",
                            torrent: hit.torrent,
                            peers: Vec::new(),
                            networks: NetworkSet::only(Network::Public),
                        });
                    }
                    Ok(())
                });
            }

            if let Some(engine) = self.engine.clone().filter(|_| {
                self.cfg.peer_bootstrap_enabled && !req.flags.disable_peer_bootstrap
            }) {
                let delay = if req.flags.skip_startup_delay {
                    Duration::ZERO
                } else {
                    Duration::from_secs(self.cfg.peer_bootstrap_delay_secs)
                };
                let mut session = BootstrapSession::new(
                    engine,
                    BootstrapConfig::from(&*self.cfg),
                    hash,
                    networks.clone(),
                    hints.trackers.clone(),
                    sources,
                );
                let slot = slot.clone();
                let reporter = reporter.clone();
                paths.spawn(async move {
                    let done = slot.done.clone();
                    tokio::select! {
                        _ = done.cancelled() => return Ok(()),
                        _ = budget.expired() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    match session.run(budget, done, reporter).await {
                        Ok(Some(outcome)) => {
                            slot.offer(Winner {
                                path: "bootstrap",
                                torrent: outcome.torrent,
                                peers: outcome.peers,
                                networks: outcome.peer_networks,
                            });
                            Ok(())
                        }
                        Ok(None) | Err(ResolveError::Cancelled) => Ok(()),
                        Err(err) => Err(err),
                    }
                });
            }
        }

        let mut fatal = None;
        loop {
            let joined = tokio::select! {
                _ = slot.done.cancelled() => break,
                _ = budget.expired() => break,
                joined = paths.join_next() => joined,
            };
            let Some(joined) = joined else {
                break;
            };
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(ResolveError::Fatal(msg))) => {
                    tracing::warn!(hash = %hash, err = %msg, "pipeline: fatal path failure");
                    fatal.get_or_insert(ResolveError::Fatal(msg));
                }
                Ok(Err(err)) => tracing::debug!(hash = %hash, %err, "pipeline: path failed"),
                Err(err) => tracing::warn!(hash = %hash, %err, "pipeline: path task panicked"),
            }
        }

        // Stragglers observe `done` and release their resources in the background.
        slot.done.cancel();
        paths.detach_all();

        if let Some(winner) = slot.take() {
            tracing::info!(hash = %hash, via = winner.path, bytes = winner.torrent.len(), "pipeline: resolved");
            let mut resolved = networks.clone();
            resolved.extend(&winner.networks);

            let mut aug = Augmentation::from_hints(&hints);
            aug.networks = resolved.clone();
            aug.tags = req.all_tags(&hints);
            aug.metadata = req.metadata.clone();
            aug.peers = winner.peers;
            let torrent = augment::augment(&winner.torrent, &aug)?;
            return Ok(Some(ResolvedMetadata {
                torrent,
                networks: resolved,
            }));
        }

        if cancel.is_cancelled() {
            tracing::debug!(hash = %hash, "pipeline: cancelled");
            return Err(ResolveError::Cancelled);
        }
        if let Some(err) = fatal {
            return Err(err);
        }

        if hash.is_sentinel() {
            // A sentinel lookup that found nothing still waits out its timeout.
            tokio::select! {
                _ = cancel.cancelled() => return Err(ResolveError::Cancelled),
                _ = budget.expired() => {}
                _ = std::future::ready(()), if budget.deadline().is_none() => {}
            }
        }

        tracing::debug!(hash = %hash, "pipeline: nothing found");
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::DownloadEvent;
    use crate::hash::InfoHash;
    use crate::request::ResolveFlags;
    use crate::testing::{EngineScript, FakeContact, FakeDht, FakeEngine, FakeFetcher, LinkBehaviour};
    use crate::verify::{self, tests::{sample_info, v1_hash}};
    use url::Url;

    fn cfg(root: &std::path::Path) -> Arc<Config> {
        let mut cfg = Config::defaults().unwrap();
        cfg.data_dir = root.to_path_buf();
        cfg.placeholder_size = 1024 * 1024;
        Arc::new(cfg)
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn no_bootstrap() -> ResolveFlags {
        ResolveFlags {
            disable_peer_bootstrap: true,
            skip_startup_delay: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dht_result_is_augmented_with_hints() {
        let dir = tempfile::tempdir().unwrap();
        let info = sample_info("payload");
        let hash = v1_hash(&info);

        let dht = Arc::new(FakeDht::default());
        dht.script(vec![(
            Duration::from_millis(10),
            FakeContact::new(addr("10.0.0.1:6881")).payload(info.clone()),
        )]);

        let pipeline = Pipeline::new(cfg(dir.path()), Arc::new(FakeFetcher::default()), Some(dht), None);
        let req = ResolutionRequest::new(hash)
            .with_hints("dn=My+File&tr=http://t1/announce")
            .with_timeout(Some(Duration::from_secs(30)))
            .with_flags(no_bootstrap());

        let got = pipeline
            .run(&req, CancellationToken::new(), Reporter::silent(hash))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(augment::display_name(&got.torrent).as_deref(), Some("My File"));
        assert!(augment::trackers(&got.torrent).contains(&"http://t1/announce".to_string()));
        assert_eq!(verify::info_slice(&got.torrent), Some(&info[..]));
        assert!(got.networks.contains(Network::Public));
    }

    #[tokio::test(start_paused = true)]
    async fn sentinel_hash_uses_direct_links_only() {
        let dir = tempfile::tempdir().unwrap();
        let dht = Arc::new(FakeDht::default());
        let engine = Arc::new(FakeEngine::new(EngineScript::default()));
        let fetcher = Arc::new(FakeFetcher::default());
        let link = Url::parse("http://files.example/a.torrent").unwrap();
        fetcher.set(&link, LinkBehaviour::Fail);

        let pipeline = Pipeline::new(cfg(dir.path()), fetcher.clone(), Some(dht.clone()), Some(engine.clone()));
        let req = ResolutionRequest::new(InfoHash::SENTINEL)
            .with_hints("fl=http%3A%2F%2Ffiles.example%2Fa.torrent")
            .with_timeout(Some(Duration::from_secs(3)));

        let start = tokio::time::Instant::now();
        let got = pipeline
            .run(&req, CancellationToken::new(), Reporter::silent(InfoHash::SENTINEL))
            .await
            .unwrap();

        assert_eq!(got, None);
        assert_eq!(start.elapsed(), Duration::from_secs(3));
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(dht.reads(), 0);
        assert_eq!(engine.adds(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn direct_hit_short_circuits_other_paths() {
        let dir = tempfile::tempdir().unwrap();
        let info = sample_info("fast");
        let hash = v1_hash(&info);

        let dht = Arc::new(FakeDht::default());
        dht.hold_open();
        let fetcher = Arc::new(FakeFetcher::default());
        let link = Url::parse("http://files.example/fast.torrent").unwrap();
        fetcher.set(&link, LinkBehaviour::After(Duration::from_millis(20), verify::wrap_info(&info)));

        let pipeline = Pipeline::new(cfg(dir.path()), fetcher, Some(dht.clone()), None);
        let req = ResolutionRequest::new(hash)
            .with_hints("xs=http://files.example/fast.torrent")
            .with_timeout(Some(Duration::from_secs(60)))
            .with_flags(no_bootstrap());

        let start = tokio::time::Instant::now();
        let got = pipeline
            .run(&req, CancellationToken::new(), Reporter::silent(hash))
            .await
            .unwrap()
            .unwrap();

        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(verify::info_slice(&got.torrent), Some(&info[..]));
    }

    #[tokio::test(start_paused = true)]
    async fn overlay_only_hints_never_touch_the_dht() {
        let dir = tempfile::tempdir().unwrap();
        let hash = v1_hash(&sample_info("hidden"));
        let dht = Arc::new(FakeDht::default());

        let pipeline = Pipeline::new(cfg(dir.path()), Arc::new(FakeFetcher::default()), Some(dht.clone()), None);
        let req = ResolutionRequest::new(hash)
            .with_hints("tr=http%3A%2F%2Ftracker.i2p%2Fa")
            .with_timeout(Some(Duration::from_secs(2)))
            .with_flags(no_bootstrap());

        let got = pipeline
            .run(&req, CancellationToken::new(), Reporter::silent(hash))
            .await
            .unwrap();
        assert_eq!(got, None);
        assert_eq!(dht.reads(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn bootstrap_result_carries_peers() {
        let dir = tempfile::tempdir().unwrap();
        let info = sample_info("swarm");
        let hash = v1_hash(&info);
        let peer = addr("10.1.1.1:51413");
        let engine = Arc::new(FakeEngine::new(EngineScript {
            metadata: info.clone(),
            events: vec![
                DownloadEvent::PeerAdded(peer),
                DownloadEvent::PeerTransferring {
                    peer,
                    metadata_size: Some(info.len() as u64),
                },
            ],
            ..EngineScript::default()
        }));

        let pipeline = Pipeline::new(cfg(dir.path()), Arc::new(FakeFetcher::default()), None, Some(engine.clone()));
        let req = ResolutionRequest::new(hash).with_timeout(Some(Duration::from_secs(30)));

        let got = pipeline
            .run(&req, CancellationToken::new(), Reporter::silent(hash))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(verify::info_slice(&got.torrent), Some(&info[..]));
        let cached = augment::tracker_peers(&got.torrent);
        assert_eq!(cached, vec![peer]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(engine.removed());
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_bootstrap_failure_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        let hash = v1_hash(&sample_info("broken"));
        let peer = addr("10.1.1.2:51413");
        let engine = Arc::new(FakeEngine::new(EngineScript {
            events: vec![DownloadEvent::PeerTransferring {
                peer,
                metadata_size: Some(2 * 1024 * 1024),
            }],
            ..EngineScript::default()
        }));

        let pipeline = Pipeline::new(cfg(dir.path()), Arc::new(FakeFetcher::default()), None, Some(engine));
        let req = ResolutionRequest::new(hash).with_timeout(Some(Duration::from_secs(30)));

        let err = pipeline
            .run(&req, CancellationToken::new(), Reporter::silent(hash))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Fatal(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_returns_promptly() {
        let dir = tempfile::tempdir().unwrap();
        let hash = v1_hash(&sample_info("slow"));
        let dht = Arc::new(FakeDht::default());
        dht.hold_open();

        let pipeline = Pipeline::new(cfg(dir.path()), Arc::new(FakeFetcher::default()), Some(dht), None);
        let req = ResolutionRequest::new(hash).with_flags(no_bootstrap());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let start = tokio::time::Instant::now();
        let err = pipeline
            .run(&req, cancel, Reporter::silent(hash))
            .await
            .unwrap_err();
        assert_eq!(err, ResolveError::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
