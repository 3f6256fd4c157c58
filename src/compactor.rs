use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Compact once `threshold` appends have accumulated since the last compaction.
/// Returns whether a compaction ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!("compacted WAL after {appends} appends");
            true
        }
        Err(e) => {
            tracing::error!("WAL compaction failed: {e}");
            false
        }
    }
}

/// Background task that keeps the WAL from growing without bound.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        if !compact_if_due(&engine, threshold).await {
            debug!("compactor: nothing to do");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LedgerOptions;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use crate::wal::Wal;
    use rust_decimal::Decimal;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("cottage_ledger_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new()), LedgerOptions::default()).unwrap();

        let cottage = engine
            .create_cottage(NewCottage {
                name: "Birch".into(),
                category: Category::Standard,
                base_capacity: 2,
                price_per_night: Decimal::new(5000, 2),
            })
            .await
            .unwrap();
        let owner = CallerId::new("owner@example.com");
        for i in 0..3u32 {
            let day: Day = "2025-01-01".parse().unwrap();
            let r = engine
                .admit(
                    ReservationFields {
                        cottage_id: cottage.id,
                        check_in: day + chrono::Days::new(u64::from(i) * 2),
                        check_out: day + chrono::Days::new(u64::from(i) * 2 + 1),
                        customer_name: "Ann".into(),
                        customer_email: "ann@example.com".into(),
                    },
                    owner.clone(),
                )
                .await
                .unwrap();
            engine.cancel(r.id).await.unwrap();
        }

        assert!(!compact_if_due(&engine, 100).await);
        assert_eq!(engine.wal_appends_since_compact().await, 7);

        assert!(compact_if_due(&engine, 5).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert_eq!(Wal::replay(&path).unwrap().events.len(), 1);
    }
}
