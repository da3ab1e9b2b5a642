//! Periodic cleanup of expired state.
//!
//! One scheduler task drives three jobs:
//!
//! - every `sweep_interval`: purge expired request contexts and unlink the
//!   temp files they reference;
//! - every hour: scan the temp directory for orphaned files older than the
//!   context TTL (uploads whose context vanished without a sweep, e.g.
//!   after a crash) and expire idle SSE channels.
//!
//! All jobs only touch concurrent-safe structures; the TTL store tolerates
//! sweeps racing live mutation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::SseBroker;
use crate::store::{ContextRegistry, RequestContext};

/// Interval of the hourly deep-cleanup pass.
const DEEP_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Periodic sweeper for the context store, temp directory and SSE broker.
pub struct CleanupScheduler {
    registry: Arc<ContextRegistry<RequestContext>>,
    broker: Arc<SseBroker>,
    temp_dir: PathBuf,
    sweep_interval: Duration,
    orphan_age: Duration,
}

impl CleanupScheduler {
    /// Create a scheduler.
    ///
    /// `orphan_age` should be at least the context TTL plus a safety margin
    /// so in-flight uploads are never unlinked.
    pub fn new(
        registry: Arc<ContextRegistry<RequestContext>>,
        broker: Arc<SseBroker>,
        temp_dir: PathBuf,
        sweep_interval: Duration,
        orphan_age: Duration,
    ) -> Self {
        Self {
            registry,
            broker,
            temp_dir,
            sweep_interval,
            orphan_age,
        }
    }

    /// Start the scheduler task. Dropping the handle does not stop it; abort
    /// it at shutdown.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut sweep_tick = tokio::time::interval(self.sweep_interval);
            sweep_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut deep_tick = tokio::time::interval(DEEP_SWEEP_INTERVAL);
            deep_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            // Both intervals fire immediately once; consume the first ticks
            // so startup is quiet.
            sweep_tick.tick().await;
            deep_tick.tick().await;

            loop {
                tokio::select! {
                    _ = sweep_tick.tick() => self.sweep_contexts().await,
                    _ = deep_tick.tick() => self.deep_sweep().await,
                }
            }
        })
    }

    /// Purge expired contexts and unlink their temp files.
    async fn sweep_contexts(&self) {
        let removed = self.registry.sweep_expired().await;
        if removed.is_empty() {
            return;
        }

        let mut unlinked = 0usize;
        for (id, stored) in &removed {
            for path in stored.value.upload_paths() {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => unlinked += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        warn!(id = %id, path = %path.display(), error = %e,
                              "failed to unlink expired upload");
                    }
                }
            }
        }
        info!(
            contexts = removed.len(),
            files = unlinked,
            "swept expired request contexts"
        );
    }

    /// Hourly pass: orphaned temp files and idle SSE channels.
    async fn deep_sweep(&self) {
        let expired_channels = self.broker.sweep().await;
        if expired_channels > 0 {
            debug!(channels = expired_channels, "expired idle event channels");
        }

        let mut dir = match tokio::fs::read_dir(&self.temp_dir).await {
            Ok(dir) => dir,
            Err(e) => {
                warn!(dir = %self.temp_dir.display(), error = %e, "cannot scan temp directory");
                return;
            }
        };

        let mut removed = 0usize;
        loop {
            let entry = match dir.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "temp directory scan aborted");
                    break;
                }
            };
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let age = metadata
                .modified()
                .ok()
                .and_then(|m| m.elapsed().ok())
                .unwrap_or_default();
            if age > self.orphan_age {
                match tokio::fs::remove_file(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        warn!(path = %entry.path().display(), error = %e,
                              "failed to unlink orphaned temp file");
                    }
                }
            }
        }
        if removed > 0 {
            info!(files = removed, "removed orphaned temp files");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{StoredUpload, CONTROLLER_PARAMS};
    use crate::transform::OptimizeOptions;

    fn scheduler(
        registry: Arc<ContextRegistry<RequestContext>>,
        temp_dir: PathBuf,
    ) -> CleanupScheduler {
        CleanupScheduler::new(
            registry,
            Arc::new(SseBroker::new()),
            temp_dir,
            Duration::from_millis(20),
            Duration::from_secs(3600),
        )
    }

    fn context_with_file(path: PathBuf) -> RequestContext {
        RequestContext {
            file: Some(StoredUpload {
                path,
                original_name: "a.png".to_string(),
                size: 3,
            }),
            files: Vec::new(),
            options: OptimizeOptions::default(),
            callbacks: Vec::new(),
            new_file_path: Some("optimized/x.jpeg".to_string()),
            new_file_paths: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_sweep_unlinks_expired_upload() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("upload.png");
        std::fs::write(&file, b"abc").unwrap();

        let registry = Arc::new(ContextRegistry::new(
            CONTROLLER_PARAMS,
            Duration::from_secs(60),
        ));
        registry
            .set_with_ttl("id-1", context_with_file(file.clone()), Duration::from_millis(5))
            .await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler(Arc::clone(&registry), dir.path().to_path_buf())
            .sweep_contexts()
            .await;

        assert!(!file.exists());
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_sweep_keeps_live_contexts() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("upload.png");
        std::fs::write(&file, b"abc").unwrap();

        let registry = Arc::new(ContextRegistry::new(
            CONTROLLER_PARAMS,
            Duration::from_secs(60),
        ));
        registry.set("id-1", context_with_file(file.clone())).await;

        scheduler(Arc::clone(&registry), dir.path().to_path_buf())
            .sweep_contexts()
            .await;

        assert!(file.exists());
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn test_sweep_tolerates_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ContextRegistry::new(
            CONTROLLER_PARAMS,
            Duration::from_secs(60),
        ));
        registry
            .set_with_ttl(
                "id-1",
                context_with_file(dir.path().join("never-existed.png")),
                Duration::from_millis(5),
            )
            .await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        // Must not panic or warn-loop on the missing file.
        scheduler(Arc::clone(&registry), dir.path().to_path_buf())
            .sweep_contexts()
            .await;
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_deep_sweep_removes_orphans_only() {
        let dir = tempfile::tempdir().unwrap();
        let orphan = dir.path().join("orphan.bin");
        std::fs::write(&orphan, b"old").unwrap();
        let fresh = dir.path().join("fresh.bin");
        std::fs::write(&fresh, b"new").unwrap();

        let registry = Arc::new(ContextRegistry::new(
            CONTROLLER_PARAMS,
            Duration::from_secs(60),
        ));
        let scheduler = CleanupScheduler::new(
            registry,
            Arc::new(SseBroker::new()),
            dir.path().to_path_buf(),
            Duration::from_millis(20),
            // Zero age: everything qualifies as an orphan.
            Duration::from_secs(0),
        );
        scheduler.deep_sweep().await;

        assert!(!orphan.exists());
        assert!(!fresh.exists());
    }

    #[tokio::test]
    async fn test_spawned_scheduler_sweeps_periodically() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("upload.png");
        std::fs::write(&file, b"abc").unwrap();

        let registry = Arc::new(ContextRegistry::new(
            CONTROLLER_PARAMS,
            Duration::from_secs(60),
        ));
        registry
            .set_with_ttl("id-1", context_with_file(file.clone()), Duration::from_millis(5))
            .await;

        let handle = scheduler(Arc::clone(&registry), dir.path().to_path_buf()).spawn();
        tokio::time::sleep(Duration::from_millis(120)).await;
        handle.abort();

        assert!(!file.exists());
    }
}
