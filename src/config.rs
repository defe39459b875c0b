//! Configuration module for connmon.
//!
//! Loads process configuration from environment variables with sensible
//! defaults. The monitored devices themselves live in the database.

use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

use crate::probe::{ProbeTimeouts, DEFAULT_PING_TIMEOUT, DEFAULT_PROBE_TIMEOUT};

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "connmon.db")
    pub db_path: String,
    /// Timeout for TCP, UDP and RPC probes (default: 5s)
    pub probe_timeout: Duration,
    /// Timeout for ICMP echo (default: 2s)
    pub ping_timeout: Duration,
    /// How long probe history is kept (default: 7 days)
    pub history_retention: Duration,
    /// Alert group name to webhook URL.
    pub notify_groups: BTreeMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "connmon.db".to_string(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            history_retention: Duration::from_secs(168 * 3600),
            notify_groups: BTreeMap::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `CONNMON_HTTP_PORT`: HTTP port (default: 8080)
    /// - `CONNMON_DB_PATH`: Database file path (default: "connmon.db")
    /// - `CONNMON_PROBE_TIMEOUT_SECS`: TCP/UDP/RPC timeout (default: 5)
    /// - `CONNMON_PING_TIMEOUT_SECS`: ICMP timeout (default: 2)
    /// - `CONNMON_HISTORY_RETENTION_HOURS`: history retention (default: 168)
    /// - `CONNMON_NOTIFY_GROUPS`: `name=url,name=url` (default: none)
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(port) = get("CONNMON_HTTP_PORT").and_then(|s| s.parse().ok()) {
            cfg.http_port = port;
        }

        if let Some(db_path) = get("CONNMON_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Some(secs) = get("CONNMON_PROBE_TIMEOUT_SECS").and_then(|s| parse_positive_f64(&s)) {
            cfg.probe_timeout = Duration::from_secs_f64(secs);
        }

        if let Some(secs) = get("CONNMON_PING_TIMEOUT_SECS").and_then(|s| parse_positive_f64(&s)) {
            cfg.ping_timeout = Duration::from_secs_f64(secs);
        }

        if let Some(hours) = get("CONNMON_HISTORY_RETENTION_HOURS").and_then(|s| s.parse::<u64>().ok()) {
            if hours > 0 {
                cfg.history_retention = Duration::from_secs(hours * 3600);
            }
        }

        if let Some(groups) = get("CONNMON_NOTIFY_GROUPS") {
            cfg.notify_groups = parse_notify_groups(&groups);
        }

        cfg
    }

    pub fn probe_timeouts(&self) -> ProbeTimeouts {
        ProbeTimeouts {
            connect: self.probe_timeout,
            ping: self.ping_timeout,
        }
    }
}

fn parse_positive_f64(s: &str) -> Option<f64> {
    s.parse::<f64>().ok().filter(|v| v.is_finite() && *v > 0.0)
}

/// Parse `name=url,name=url`. Malformed entries are skipped with a warning.
pub fn parse_notify_groups(s: &str) -> BTreeMap<String, String> {
    let mut groups = BTreeMap::new();

    for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        match entry.split_once('=') {
            Some((name, url)) if !name.trim().is_empty() && !url.trim().is_empty() => {
                groups.insert(name.trim().to_string(), url.trim().to_string());
            }
            _ => tracing::warn!("Ignoring malformed notify group entry: {}", entry),
        }
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.db_path, "connmon.db");
        assert_eq!(cfg.probe_timeout, Duration::from_secs(5));
        assert_eq!(cfg.ping_timeout, Duration::from_secs(2));
        assert_eq!(cfg.history_retention, Duration::from_secs(7 * 24 * 3600));
        assert!(cfg.notify_groups.is_empty());
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("CONNMON_HTTP_PORT", "9090"),
            ("CONNMON_DB_PATH", "/var/lib/connmon/state.db"),
            ("CONNMON_PROBE_TIMEOUT_SECS", "1.5"),
            ("CONNMON_PING_TIMEOUT_SECS", "-3"),
            ("CONNMON_HISTORY_RETENTION_HOURS", "24"),
            ("CONNMON_NOTIFY_GROUPS", "ops=http://hooks.local/ops"),
        ]);
        let cfg = ServerConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.http_port, 9090);
        assert_eq!(cfg.db_path, "/var/lib/connmon/state.db");
        assert_eq!(cfg.probe_timeout, Duration::from_millis(1500));
        // Rejected, default kept
        assert_eq!(cfg.ping_timeout, Duration::from_secs(2));
        assert_eq!(cfg.history_retention, Duration::from_secs(24 * 3600));
        assert_eq!(cfg.notify_groups.get("ops").map(String::as_str), Some("http://hooks.local/ops"));

        let timeouts = cfg.probe_timeouts();
        assert_eq!(timeouts.connect, Duration::from_millis(1500));
    }

    #[test]
    fn test_invalid_port_keeps_default() {
        let cfg = ServerConfig::from_lookup(|k| (k == "CONNMON_HTTP_PORT").then(|| "http".to_string()));
        assert_eq!(cfg.http_port, 8080);
    }

    #[test]
    fn test_parse_notify_groups() {
        let groups = parse_notify_groups(" mobile = http://a/hook , broken, =http://b, pager=http://c?x=1 ,");
        assert_eq!(groups.len(), 2);
        assert_eq!(groups["mobile"], "http://a/hook");
        // Only the first '=' separates name from URL
        assert_eq!(groups["pager"], "http://c?x=1");
    }
}
