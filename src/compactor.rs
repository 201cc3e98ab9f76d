use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Compact the engine's WAL whenever `threshold` appends have piled up since
/// the last compaction. Runs until the task is dropped.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_needed(&engine, threshold).await;
    }
}

/// Returns true if a compaction ran and succeeded.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if threshold == 0 || appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!("compacted WAL after {appends} appends");
            true
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("courtbook_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();

        for _ in 0..3 {
            engine.create_coach(Ulid::new(), None).await.unwrap();
        }
        assert!(!compact_if_needed(&engine, 4).await);
        assert_eq!(engine.wal_appends_since_compact().await, 3);

        engine.create_coach(Ulid::new(), None).await.unwrap();
        assert!(compact_if_needed(&engine, 4).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert_eq!(engine.list_coaches().await.len(), 4);
    }

    #[tokio::test]
    async fn zero_threshold_disables() {
        let path = test_wal_path("disabled.wal");
        let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
        engine.create_coach(Ulid::new(), None).await.unwrap();
        assert!(!compact_if_needed(&engine, 0).await);
    }
}
