use crate::budget::Budget;
use crate::hash::InfoHash;
use crate::verify;
use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Longest a single direct link may take when the request is unbounded.
pub const DIRECT_LINK_TIMEOUT: Duration = Duration::from_secs(120);

#[async_trait]
pub trait LinkFetcher: Send + Sync {
    async fn fetch(&self, url: &Url, timeout: Duration) -> anyhow::Result<Vec<u8>>;
}

pub struct HttpLinkFetcher {
    client: Client,
    max_bytes: u64,
}

impl HttpLinkFetcher {
    pub fn new(max_bytes: u64) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .build()
            .context("build http client")?;
        Ok(Self { client, max_bytes })
    }
}

#[async_trait]
impl LinkFetcher for HttpLinkFetcher {
    async fn fetch(&self, url: &Url, timeout: Duration) -> anyhow::Result<Vec<u8>> {
        let mut resp = self
            .client
            .get(url.clone())
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?;

        if resp.content_length().is_some_and(|n| n > self.max_bytes) {
            anyhow::bail!("response larger than {} bytes", self.max_bytes);
        }

        let mut out = Vec::new();
        while let Some(chunk) = resp.chunk().await? {
            if (out.len() + chunk.len()) as u64 > self.max_bytes {
                anyhow::bail!("response larger than {} bytes", self.max_bytes);
            }
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}

/// Races `links` and returns the first body that verifies against `hash`
/// as a full torrent. Losing fetches are aborted.
pub async fn fetch_first_verified(
    fetcher: Arc<dyn LinkFetcher>,
    links: Vec<Url>,
    hash: InfoHash,
    budget: Budget,
    cancel: CancellationToken,
) -> Option<Vec<u8>> {
    if links.is_empty() {
        return None;
    }

    let mut join_set = JoinSet::new();
    for url in links {
        let fetcher = fetcher.clone();
        let per_link = budget.cap(DIRECT_LINK_TIMEOUT);
        join_set.spawn(async move {
            let r = fetcher.fetch(&url, per_link).await;
            (url, r)
        });
    }

    let mut failures_logged = 0usize;
    loop {
        let joined = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = budget.expired() => break,
            joined = join_set.join_next() => joined,
        };
        let Some(joined) = joined else {
            break;
        };
        let Ok((url, result)) = joined else {
            continue;
        };

        let err = match result {
            Ok(body) => match verify::verify_metadata(&body, &hash) {
                Ok(torrent) => {
                    tracing::debug!(hash = %hash, url = %url, bytes = torrent.len(), "direct: verified");
                    join_set.abort_all();
                    return Some(torrent);
                }
                Err(err) => err.to_string(),
            },
            Err(err) => format!("{err:#}"),
        };

        if failures_logged < 2 {
            tracing::debug!(hash = %hash, url = %url, err = %err, "direct: link failed");
            failures_logged += 1;
        } else {
            tracing::trace!(hash = %hash, url = %url, err = %err, "direct: link failed");
        }
    }

    join_set.abort_all();
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeFetcher, LinkBehaviour};
    use crate::verify::tests::{sample_info, v1_hash};

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn second_link_wins_and_first_is_cancelled() {
        let info = sample_info("payload");
        let hash = v1_hash(&info);
        let fetcher = Arc::new(FakeFetcher::default());
        fetcher.set(&url("http://a.org/1"), LinkBehaviour::Hang);
        fetcher.set(
            &url("http://b.org/2"),
            LinkBehaviour::After(Duration::from_millis(50), verify::wrap_info(&info)),
        );

        let got = fetch_first_verified(
            fetcher.clone(),
            vec![url("http://a.org/1"), url("http://b.org/2")],
            hash,
            Budget::new(Some(Duration::from_secs(30))),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(got, Some(verify::wrap_info(&info)));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(fetcher.was_cancelled(&url("http://a.org/1")));
    }

    #[tokio::test(start_paused = true)]
    async fn mismatching_bodies_yield_nothing() {
        let hash = v1_hash(&sample_info("wanted"));
        let fetcher = Arc::new(FakeFetcher::default());
        fetcher.set(
            &url("http://a.org/1"),
            LinkBehaviour::After(Duration::ZERO, verify::wrap_info(&sample_info("other"))),
        );
        fetcher.set(&url("http://a.org/2"), LinkBehaviour::Fail);

        let got = fetch_first_verified(
            fetcher,
            vec![url("http://a.org/1"), url("http://a.org/2")],
            hash,
            Budget::unbounded(),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(got, None);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_bounds_hanging_links() {
        let fetcher = Arc::new(FakeFetcher::default());
        fetcher.set(&url("http://a.org/1"), LinkBehaviour::Hang);
        let start = tokio::time::Instant::now();
        let got = fetch_first_verified(
            fetcher,
            vec![url("http://a.org/1")],
            InfoHash::SENTINEL,
            Budget::new(Some(Duration::from_secs(5))),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(got, None);
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }
}
