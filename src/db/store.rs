//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Corrupt row: {0}")]
    Corrupt(String),
    #[error("database lock poisoned")]
    Poisoned,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn()?;

        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        conn.execute_batch(include_str!("../../migrations/000002_probe_history.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 2 failed: {}", e)))?;

        Ok(())
    }

    // --- Config entry ---

    /// Load the config entry, or `None` before the first device was added.
    pub fn load_config(&self) -> Result<Option<IntegrationConfig>, DbError> {
        let conn = self.conn()?;

        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT dns_server, poll_interval FROM integration WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((dns_server, poll_interval)) = row else {
            return Ok(None);
        };

        let dns_server: Ipv4Addr = dns_server
            .parse()
            .map_err(|_| DbError::Corrupt(format!("dns_server {:?}", dns_server)))?;

        let mut stmt = conn.prepare(
            "SELECT host, protocol, port, device_name, alert_group, alert_delay
             FROM targets ORDER BY position ASC",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<u16>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, u32>(5)?,
                ))
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        let mut targets = Vec::with_capacity(rows.len());
        for (host, protocol, port, device_name, alert_group, alert_delay) in rows {
            let protocol: Protocol = protocol.parse().map_err(DbError::Corrupt)?;
            targets.push(Target {
                host,
                protocol,
                port,
                device_name,
                alert_group,
                alert_delay,
            });
        }

        Ok(Some(IntegrationConfig {
            dns_server,
            poll_interval_secs: poll_interval.max(1) as u64,
            targets,
        }))
    }

    /// Replace the stored config entry.
    pub fn save_config(&self, config: &IntegrationConfig) -> Result<(), DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        tx.execute(
            "INSERT INTO integration (id, dns_server, poll_interval) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET
             dns_server=excluded.dns_server, poll_interval=excluded.poll_interval",
            params![config.dns_server.to_string(), config.poll_interval_secs as i64],
        )?;
        tx.execute("DELETE FROM targets", [])?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO targets (position, unique_id, host, protocol, port, device_name, alert_group, alert_delay)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;

            for (position, t) in config.targets.iter().enumerate() {
                stmt.execute(params![
                    position as i64,
                    t.unique_id(),
                    t.host,
                    t.protocol.as_str(),
                    t.port,
                    t.device_name,
                    t.alert_group,
                    t.alert_delay,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    // --- Probe history ---

    /// Add history records in batch.
    pub fn add_history(&self, records: &[HistoryRecord]) -> Result<(), DbError> {
        if records.is_empty() {
            return Ok(());
        }

        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO probe_history (time, unique_id, reachable, latency_ms, failure, resolved_ip)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;

            for r in records {
                stmt.execute(params![
                    r.time.format(TIME_FORMAT).to_string(),
                    r.unique_id,
                    r.reachable,
                    r.latency_ms,
                    r.failure,
                    r.resolved_ip,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Most recent history records for one sensor, newest first.
    pub fn get_history(&self, unique_id: &str, limit: u32) -> Result<Vec<HistoryRecord>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT time, unique_id, reachable, latency_ms, failure, resolved_ip
             FROM probe_history WHERE unique_id = ?1 ORDER BY time DESC LIMIT ?2",
        )?;

        let records = stmt
            .query_map(params![unique_id, limit], |row| {
                let time_str: String = row.get(0)?;
                let time = parse_db_time(&time_str).unwrap_or_else(Utc::now);
                Ok(HistoryRecord {
                    time,
                    unique_id: row.get(1)?,
                    reachable: row.get(2)?,
                    latency_ms: row.get(3)?,
                    failure: row.get(4)?,
                    resolved_ip: row.get(5)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(records)
    }

    /// Delete history older than `cutoff`. Returns the number of rows removed.
    pub fn delete_history_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM probe_history WHERE time < ?1",
            params![cutoff.format(TIME_FORMAT).to_string()],
        )?;
        Ok(n)
    }

    /// Delete all history of the given sensors.
    pub fn delete_history_for(&self, unique_ids: &[String]) -> Result<(), DbError> {
        if unique_ids.is_empty() {
            return Ok(());
        }

        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare("DELETE FROM probe_history WHERE unique_id = ?1")?;
            for id in unique_ids {
                stmt.execute(params![id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [TIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::NamedTempFile;

    fn record(unique_id: &str, time: DateTime<Utc>, reachable: bool) -> HistoryRecord {
        HistoryRecord {
            time,
            unique_id: unique_id.to_string(),
            reachable,
            latency_ms: reachable.then_some(1.25),
            failure: (!reachable).then(|| "timeout".to_string()),
            resolved_ip: Some("10.0.0.1".to_string()),
        }
    }

    #[test]
    fn test_config_absent_until_saved() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        assert!(store.load_config().unwrap().is_none());
    }

    #[test]
    fn test_config_save_and_replace() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        let mut web = Target::new("10.0.0.1", Protocol::Tcp, Some(443));
        web.device_name = "Router".to_string();
        web.alert_group = Some("ops".to_string());
        web.alert_delay = 5;
        let ping = Target::new("10.0.0.1", Protocol::Icmp, Some(80));

        let mut config = IntegrationConfig {
            dns_server: Ipv4Addr::new(9, 9, 9, 9),
            poll_interval_secs: 30,
            targets: vec![web.clone(), ping.clone()],
        };
        store.save_config(&config).unwrap();

        let loaded = store.load_config().unwrap().unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.targets[1].port, None);

        config.targets.remove(0);
        config.poll_interval_secs = 60;
        store.save_config(&config).unwrap();

        let loaded = store.load_config().unwrap().unwrap();
        assert_eq!(loaded.poll_interval_secs, 60);
        assert_eq!(loaded.targets, vec![ping]);
    }

    #[test]
    fn test_history_roundtrip_and_retention() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let now = Utc::now();

        store
            .add_history(&[
                record("a", now - ChronoDuration::hours(48), false),
                record("a", now - ChronoDuration::minutes(1), true),
                record("b", now, true),
            ])
            .unwrap();

        let history = store.get_history("a", 10).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].reachable);
        assert_eq!(history[0].latency_ms, Some(1.25));
        assert_eq!(history[1].failure.as_deref(), Some("timeout"));

        let removed = store
            .delete_history_before(now - ChronoDuration::hours(24))
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.get_history("a", 10).unwrap().len(), 1);

        store.delete_history_for(&["b".to_string()]).unwrap();
        assert!(store.get_history("b", 10).unwrap().is_empty());
    }
}
