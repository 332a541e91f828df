use crate::config::Config;
use crate::recovery::RecoveryStore;
use crate::resolver::Resolver;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::interval;

/// Periodically removes stale bootstrap scratch directories.
pub async fn run(cfg: Arc<Config>, resolver: Arc<Resolver>, recovery: Option<Arc<dyn RecoveryStore>>) {
    if cfg.cleanup_every_secs == 0 {
        tracing::info!("cleanup: disabled via LODESTONE_CLEANUP_EVERY_SECS=0");
        return;
    }

    let root = cfg.scratch_root();
    let ttl = Duration::from_secs(cfg.scratch_ttl_secs);
    let mut tick = interval(Duration::from_secs(cfg.cleanup_every_secs));

    loop {
        tick.tick().await;
        if let Some((scanned, deleted)) = sweep_once(&root, ttl, &resolver, recovery.as_deref()).await {
            tracing::debug!(scanned, deleted, "cleanup: sweep");
        }
    }
}

/// One pass that spares in-flight hashes and hashes still awaiting replay.
/// Skipped entirely when the recovery records cannot be listed.
pub async fn sweep_once(
    root: &Path,
    ttl: Duration,
    resolver: &Resolver,
    recovery: Option<&dyn RecoveryStore>,
) -> Option<(usize, usize)> {
    let recovered: HashSet<String> = match recovery.map(|store| store.list()) {
        None => HashSet::new(),
        Some(Ok(records)) => records
            .into_iter()
            .map(|r| r.hash.to_ascii_lowercase())
            .collect(),
        Some(Err(err)) => {
            tracing::warn!(%err, "cleanup: failed listing recovery records; skipping sweep");
            return None;
        }
    };
    Some(sweep(root, ttl, |hex| recovered.contains(hex) || resolver.is_active(hex)).await)
}

// Scratch directories are named by the lowercase hex info-hash.
fn is_hash_name(name: &str) -> bool {
    matches!(name.len(), 40 | 64) && name.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Deletes hash-named directories under `root` older than `ttl` that are not
/// protected. Returns (scanned, deleted).
pub async fn sweep(root: &Path, ttl: Duration, is_protected: impl Fn(&str) -> bool) -> (usize, usize) {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(e) => e,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return (0, 0),
        Err(err) => {
            tracing::warn!(root = %root.display(), %err, "cleanup: failed reading scratch root");
            return (0, 0);
        }
    };

    let now = SystemTime::now();
    let mut scanned = 0usize;
    let mut deleted = 0usize;

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(e)) => e,
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(%err, "cleanup: failed listing scratch root");
                break;
            }
        };
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        if !meta.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_ascii_lowercase();
        if !is_hash_name(&name) {
            continue;
        }
        scanned += 1;

        if is_protected(&name) {
            continue;
        }
        let age = meta
            .modified()
            .ok()
            .and_then(|m| now.duration_since(m).ok())
            .unwrap_or_default();
        if age < ttl {
            continue;
        }

        match tokio::fs::remove_dir_all(entry.path()).await {
            Ok(()) => deleted += 1,
            Err(err) => tracing::debug!(dir = %entry.path().display(), %err, "cleanup: remove failed"),
        }

        if scanned % 50 == 0 {
            tokio::task::yield_now().await;
        }
    }

    (scanned, deleted)
}
