use anyhow::Context;
use lodestone::config::Config;
use lodestone::dht::Dht;
use lodestone::direct::HttpLinkFetcher;
use lodestone::krpc::KrpcDht;
use lodestone::pipeline::Pipeline;
use lodestone::recovery::{RecoveryManager, RecoveryStore, SledRecoveryStore};
use lodestone::resolver::Resolver;
use lodestone::swarm::SwarmEngine;
use lodestone::{bootstrap::TransferEngine, cleanup, web};
use std::path::Path;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = Arc::new(Config::load().context("load config")?);
    std::fs::create_dir_all(&cfg.data_dir).context("create data dir")?;

    let db = sled::open(cfg.data_dir.join("sled")).context("open sled db")?;
    let recovery: Option<Arc<dyn RecoveryStore>> = if cfg.recovery_enabled {
        Some(Arc::new(SledRecoveryStore::open(&db).context("open recovery tree")?))
    } else {
        None
    };

    let fetcher = Arc::new(HttpLinkFetcher::new(cfg.direct_link_max_bytes).context("build http client")?);
    let dht: Option<Arc<dyn Dht>> = cfg
        .dht_enabled
        .then(|| Arc::new(KrpcDht::new(&cfg)) as Arc<dyn Dht>);
    let engine: Option<Arc<dyn TransferEngine>> = cfg
        .peer_bootstrap_enabled
        .then(|| Arc::new(SwarmEngine::new(&cfg, dht.clone())) as Arc<dyn TransferEngine>);

    let pipeline = Pipeline::new(cfg.clone(), fetcher, dht, engine);
    let resolver = Resolver::new(pipeline, recovery.clone());

    // Resolutions interrupted by the last shutdown.
    if let Some(store) = recovery.clone() {
        let manager = RecoveryManager::new(store, &cfg);
        let resolver = resolver.clone();
        let out_dir = cfg.data_dir.join("resolved");
        tokio::spawn(async move {
            let mut outcomes = manager.replay(resolver).await;
            while let Some(joined) = outcomes.join_next().await {
                let Ok((hash, outcome)) = joined else {
                    continue;
                };
                match outcome {
                    Ok(Some(found)) => {
                        if let Err(err) = write_resolved(&out_dir, &hash.to_hex(), &found.torrent).await {
                            tracing::warn!(%hash, %err, "recovery: failed writing torrent");
                        }
                    }
                    Ok(None) => tracing::info!(%hash, "recovery: nothing found"),
                    Err(err) => tracing::info!(%hash, %err, "recovery: resolution failed"),
                }
            }
        });
    }

    tokio::spawn(cleanup::run(cfg.clone(), resolver.clone(), recovery.clone()));

    let addr = cfg.http_addr;
    web::serve(web::AppState { resolver, cfg }, addr).await
}

async fn write_resolved(dir: &Path, hex: &str, torrent: &[u8]) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(format!("{hex}.torrent"));
    tokio::fs::write(&path, torrent).await?;
    tracing::info!(path = %path.display(), "recovery: wrote torrent");
    Ok(())
}
