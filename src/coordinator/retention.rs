//! Retention manager for cleaning up old probe history.

use crate::db::Store;

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const RETENTION_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

/// Manager for deleting history past the retention period.
pub struct RetentionManager {
    store: Arc<Store>,
    retention: Duration,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl RetentionManager {
    pub fn new(store: Arc<Store>, retention: Duration) -> Self {
        Self {
            store,
            retention,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the retention manager background task.
    pub fn start(&self) {
        let store = self.store.clone();
        let stop = self.stop.clone();
        let retention = self.retention;

        tokio::spawn(async move {
            let (tx, _) = tokio::sync::broadcast::channel(1);
            let mut rx = tx.subscribe();
            {
                let mut stop_guard = stop.lock().await;
                *stop_guard = Some(tx);
            }

            let mut interval = tokio::time::interval(RETENTION_CHECK_INTERVAL);

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        process_retention(&store, retention);
                    }
                }
            }
        });
    }

    /// Stop the retention manager.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }
}

fn process_retention(store: &Store, retention: Duration) {
    let retention = match ChronoDuration::from_std(retention) {
        Ok(r) => r,
        Err(e) => {
            tracing::error!("RetentionManager: Invalid retention period: {}", e);
            return;
        }
    };
    let cutoff = Utc::now() - retention;

    match store.delete_history_before(cutoff) {
        Ok(0) => {}
        Ok(n) => tracing::info!("RetentionManager: Deleted {} history rows older than {}", n, cutoff),
        Err(e) => tracing::error!("RetentionManager: Failed to delete history: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::HistoryRecord;

    fn record(unique_id: &str, age_hours: i64) -> HistoryRecord {
        HistoryRecord {
            time: Utc::now() - ChronoDuration::hours(age_hours),
            unique_id: unique_id.to_string(),
            reachable: true,
            latency_ms: Some(1.0),
            failure: None,
            resolved_ip: None,
        }
    }

    #[test]
    fn test_process_retention_deletes_old_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("retention.db")).unwrap();

        store
            .add_history(&[record("a_TCP_80", 1), record("a_TCP_80", 30), record("b_ICMP_ping", 200)])
            .unwrap();

        process_retention(&store, Duration::from_secs(24 * 3600));

        assert_eq!(store.get_history("a_TCP_80", 10).unwrap().len(), 1);
        assert!(store.get_history("b_ICMP_ping", 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_manager_runs_on_start() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::new(dir.path().join("retention.db")).unwrap());
        store.add_history(&[record("a_TCP_80", 48)]).unwrap();

        let manager = RetentionManager::new(store.clone(), Duration::from_secs(3600));
        manager.start();

        // First tick fires immediately
        tokio::time::sleep(Duration::from_millis(200)).await;
        manager.stop().await;

        assert!(store.get_history("a_TCP_80", 10).unwrap().is_empty());
    }
}
