use crate::error::ResolveError;
use crate::pipeline::{Pipeline, ResolvedMetadata};
use crate::progress::{Progress, Reporter};
use crate::recovery::{ActiveResolution, RecoveryStore};
use crate::request::ResolutionRequest;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;

pub type Outcome = Result<Option<ResolvedMetadata>, ResolveError>;

const PROGRESS_CAPACITY: usize = 256;

/// One in-flight pipeline and everyone waiting on it. The result is
/// delivered once: the entry is removed and its waiters drained under the
/// same lock, so no waiter can attach after settling.
struct Flight {
    cancel: CancellationToken,
    waiters: Vec<oneshot::Sender<Outcome>>,
}

/// Single-flight front door: at most one pipeline per hash.
pub struct Resolver {
    pipeline: Arc<Pipeline>,
    recovery: Option<Arc<dyn RecoveryStore>>,
    flights: Mutex<HashMap<String, Flight>>,
    progress: broadcast::Sender<Progress>,
}

impl Resolver {
    pub fn new(pipeline: Pipeline, recovery: Option<Arc<dyn RecoveryStore>>) -> Arc<Self> {
        let (progress, _) = broadcast::channel(PROGRESS_CAPACITY);
        Arc::new(Self {
            pipeline: Arc::new(pipeline),
            recovery,
            flights: Mutex::new(HashMap::new()),
            progress,
        })
    }

    /// Resolves `req`, joining the running pipeline for the same hash if
    /// there is one.
    pub async fn resolve(self: &Arc<Self>, req: ResolutionRequest) -> Outcome {
        let key = req.hash.to_hex();
        let (tx, rx) = oneshot::channel();

        let launch = {
            let mut flights = self.flights.lock();
            match flights.get_mut(&key) {
                Some(flight) => {
                    flight.waiters.push(tx);
                    None
                }
                None => {
                    let cancel = CancellationToken::new();
                    flights.insert(
                        key.clone(),
                        Flight {
                            cancel: cancel.clone(),
                            waiters: vec![tx],
                        },
                    );
                    Some(cancel)
                }
            }
        };

        match launch {
            Some(cancel) => {
                let this = self.clone();
                tokio::spawn(async move { this.fly(key, req, cancel).await });
            }
            None => tracing::debug!(hash = %key, "resolver: joined in-flight resolution"),
        }

        rx.await
            .unwrap_or_else(|_| Err(ResolveError::fatal("resolution ended without a result")))
    }

    async fn fly(self: Arc<Self>, key: String, req: ResolutionRequest, cancel: CancellationToken) {
        self.remember(&req);

        let reporter = Reporter::new(req.hash, self.progress.clone());
        let pipeline = self.pipeline.clone();
        let run = tokio::spawn(async move { pipeline.run(&req, cancel, reporter).await });
        let outcome = match run.await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(hash = %key, %err, "resolver: pipeline task failed");
                Err(ResolveError::fatal(format!("pipeline task failed: {err}")))
            }
        };

        self.forget(&key);

        let waiters = self
            .flights
            .lock()
            .remove(&key)
            .map(|f| f.waiters)
            .unwrap_or_default();
        tracing::debug!(hash = %key, waiters = waiters.len(), ok = outcome.is_ok(), "resolver: settled");
        for waiter in waiters {
            // A caller that gave up is fine.
            let _ = waiter.send(outcome.clone());
        }
    }

    fn remember(&self, req: &ResolutionRequest) {
        if let Some(store) = &self.recovery {
            if let Err(err) = store.put(&ActiveResolution::from_request(req)) {
                tracing::warn!(hash = %req.hash, %err, "recovery: failed recording resolution");
            }
        }
    }

    fn forget(&self, key: &str) {
        if let Some(store) = &self.recovery {
            if let Err(err) = store.remove(key) {
                tracing::warn!(hash = %key, %err, "recovery: failed removing record");
            }
        }
    }

    /// Cancels the in-flight resolution for `hash_hex`. Every waiter gets
    /// `Cancelled`.
    pub fn cancel(&self, hash_hex: &str) -> bool {
        let key = hash_hex.to_ascii_lowercase();
        match self.flights.lock().get(&key) {
            Some(flight) => {
                flight.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_hashes(&self) -> Vec<String> {
        let mut out: Vec<String> = self.flights.lock().keys().cloned().collect();
        out.sort();
        out
    }

    pub fn is_active(&self, hash_hex: &str) -> bool {
        self.flights.lock().contains_key(&hash_hex.to_ascii_lowercase())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Progress> {
        self.progress.subscribe()
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::progress::ProgressEvent;
    use crate::testing::{FakeContact, FakeDht, FakeFetcher};
    use crate::verify::{self, tests::{sample_info, v1_hash}};
    use tokio::time::Duration;

    fn resolver(dht: Arc<FakeDht>) -> Arc<Resolver> {
        let mut cfg = Config::defaults().unwrap();
        cfg.peer_bootstrap_enabled = false;
        let pipeline = Pipeline::new(Arc::new(cfg), Arc::new(FakeFetcher::default()), Some(dht), None);
        Resolver::new(pipeline, None)
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_requests_share_one_lookup() {
        let info = sample_info("shared");
        let hash = v1_hash(&info);
        let dht = Arc::new(FakeDht::default());
        dht.script(vec![(
            Duration::from_millis(200),
            FakeContact::new("10.0.0.9:6881".parse().unwrap()).payload(info.clone()),
        )]);
        let resolver = resolver(dht.clone());

        let mut calls = Vec::new();
        for _ in 0..8 {
            let r = resolver.clone();
            calls.push(tokio::spawn(async move {
                r.resolve(ResolutionRequest::new(hash).with_timeout(Some(Duration::from_secs(30))))
                    .await
            }));
        }

        let mut torrents = Vec::new();
        for call in calls {
            let got = call.await.unwrap().unwrap().unwrap();
            torrents.push(got.torrent);
        }
        assert_eq!(dht.reads(), 1);
        assert!(torrents.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(verify::info_slice(&torrents[0]), Some(&info[..]));
        assert!(resolver.active_hashes().is_empty());

        // Settled entries are gone; the next call starts afresh.
        resolver
            .resolve(ResolutionRequest::new(hash).with_timeout(Some(Duration::from_secs(30))))
            .await
            .unwrap();
        assert_eq!(dht.reads(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_reaches_every_waiter() {
        let hash = v1_hash(&sample_info("stuck"));
        let dht = Arc::new(FakeDht::default());
        dht.hold_open();
        let resolver = resolver(dht);

        let a = {
            let r = resolver.clone();
            tokio::spawn(async move { r.resolve(ResolutionRequest::new(hash)).await })
        };
        let b = {
            let r = resolver.clone();
            tokio::spawn(async move { r.resolve(ResolutionRequest::new(hash)).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(resolver.active_hashes(), vec![hash.to_hex()]);
        assert!(resolver.cancel(&hash.to_hex().to_uppercase()));

        assert_eq!(a.await.unwrap(), Err(ResolveError::Cancelled));
        assert_eq!(b.await.unwrap(), Err(ResolveError::Cancelled));
        assert!(!resolver.is_active(&hash.to_hex()));
        assert!(!resolver.cancel(&hash.to_hex()));
    }

    #[tokio::test(start_paused = true)]
    async fn progress_is_broadcast() {
        let info = sample_info("watched");
        let hash = v1_hash(&info);
        let dht = Arc::new(FakeDht::default());
        dht.script(vec![(
            Duration::ZERO,
            FakeContact::new("10.0.0.7:6881".parse().unwrap()).payload(info),
        )]);
        let resolver = resolver(dht);
        let mut events = resolver.subscribe();

        resolver
            .resolve(ResolutionRequest::new(hash).with_timeout(Some(Duration::from_secs(5))))
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Ok(p) = events.try_recv() {
            assert_eq!(p.hash, hash.to_hex());
            seen.push(p.event);
        }
        assert!(seen.contains(&ProgressEvent::Activity("searching".into())));
    }
}
