//! Device alerting.
//!
//! A device alerts once it has been continuously unreachable for its alert
//! delay, and announces recovery if it alerted.

mod notify;

pub use notify::*;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Down,
    Recovered,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    pub host: String,
    pub device_name: String,
    pub kind: AlertKind,
    /// Start of the outage.
    pub since: DateTime<Utc>,
    pub at: DateTime<Utc>,
}

impl AlertEvent {
    pub fn title(&self) -> String {
        match self.kind {
            AlertKind::Down => format!("{} is unreachable", self.device_name),
            AlertKind::Recovered => format!("{} is reachable again", self.device_name),
        }
    }

    pub fn message(&self) -> String {
        let minutes = (self.at - self.since).num_minutes();
        match self.kind {
            AlertKind::Down => format!(
                "{} ({}) has been unreachable for {} minutes",
                self.device_name, self.host, minutes
            ),
            AlertKind::Recovered => format!(
                "{} ({}) recovered after {} minutes",
                self.device_name, self.host, minutes
            ),
        }
    }
}

#[derive(Debug, Default)]
struct DeviceAlertState {
    down_since: Option<DateTime<Utc>>,
    alerted: bool,
}

/// Tracks outage timers per device host.
#[derive(Debug, Default)]
pub struct AlertTracker {
    devices: HashMap<String, DeviceAlertState>,
}

impl AlertTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one reachability observation for a device.
    pub fn observe(
        &mut self,
        host: &str,
        device_name: &str,
        reachable: bool,
        delay: ChronoDuration,
        now: DateTime<Utc>,
    ) -> Option<AlertEvent> {
        let state = self.devices.entry(host.to_string()).or_default();

        if reachable {
            let since = state.down_since.take();
            let alerted = std::mem::replace(&mut state.alerted, false);
            return match since {
                Some(since) if alerted => Some(AlertEvent {
                    host: host.to_string(),
                    device_name: device_name.to_string(),
                    kind: AlertKind::Recovered,
                    since,
                    at: now,
                }),
                _ => None,
            };
        }

        let since = *state.down_since.get_or_insert(now);
        if state.alerted || now - since < delay {
            return None;
        }

        state.alerted = true;
        Some(AlertEvent {
            host: host.to_string(),
            device_name: device_name.to_string(),
            kind: AlertKind::Down,
            since,
            at: now,
        })
    }

    pub fn forget(&mut self, host: &str) {
        self.devices.remove(host);
    }

    /// Hosts with any tracked state.
    pub fn hosts(&self) -> impl Iterator<Item = &String> {
        self.devices.keys()
    }

    pub fn is_alerting(&self, host: &str) -> bool {
        self.devices.get(host).is_some_and(|s| s.alerted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_no_alert_before_delay() {
        let mut tracker = AlertTracker::new();
        let delay = ChronoDuration::minutes(15);

        assert!(tracker.observe("nas", "NAS", false, delay, t0()).is_none());
        assert!(tracker
            .observe("nas", "NAS", false, delay, t0() + ChronoDuration::minutes(14))
            .is_none());
        assert!(!tracker.is_alerting("nas"));
    }

    #[test]
    fn test_alert_fires_once_after_delay() {
        let mut tracker = AlertTracker::new();
        let delay = ChronoDuration::minutes(15);

        tracker.observe("nas", "NAS", false, delay, t0());
        let event = tracker
            .observe("nas", "NAS", false, delay, t0() + ChronoDuration::minutes(15))
            .unwrap();
        assert_eq!(event.kind, AlertKind::Down);
        assert_eq!(event.since, t0());
        assert!(event.message().contains("15 minutes"));

        assert!(tracker
            .observe("nas", "NAS", false, delay, t0() + ChronoDuration::minutes(30))
            .is_none());
        assert!(tracker.is_alerting("nas"));
    }

    #[test]
    fn test_recovery_resets_timer() {
        let mut tracker = AlertTracker::new();
        let delay = ChronoDuration::minutes(10);

        tracker.observe("nas", "NAS", false, delay, t0());
        // Brief recovery before the delay: no alert and no recovery notice
        assert!(tracker
            .observe("nas", "NAS", true, delay, t0() + ChronoDuration::minutes(9))
            .is_none());
        assert!(tracker
            .observe("nas", "NAS", false, delay, t0() + ChronoDuration::minutes(12))
            .is_none());
        // Only 8 minutes of continuous outage so far
        assert!(tracker
            .observe("nas", "NAS", false, delay, t0() + ChronoDuration::minutes(20))
            .is_none());
        assert!(tracker
            .observe("nas", "NAS", false, delay, t0() + ChronoDuration::minutes(22))
            .is_some());
    }

    #[test]
    fn test_recovered_after_alert() {
        let mut tracker = AlertTracker::new();
        let delay = ChronoDuration::minutes(1);

        tracker.observe("nas", "NAS", false, delay, t0());
        tracker.observe("nas", "NAS", false, delay, t0() + ChronoDuration::minutes(1));
        let event = tracker
            .observe("nas", "NAS", true, delay, t0() + ChronoDuration::minutes(5))
            .unwrap();
        assert_eq!(event.kind, AlertKind::Recovered);
        assert_eq!(event.title(), "NAS is reachable again");
        assert!(!tracker.is_alerting("nas"));
    }

    #[test]
    fn test_devices_are_independent() {
        let mut tracker = AlertTracker::new();
        let delay = ChronoDuration::minutes(1);

        tracker.observe("a", "A", false, delay, t0());
        tracker.observe("b", "B", true, delay, t0());
        assert!(tracker
            .observe("a", "A", false, delay, t0() + ChronoDuration::minutes(2))
            .is_some());
        assert!(!tracker.is_alerting("b"));

        tracker.forget("a");
        assert!(!tracker.is_alerting("a"));
    }
}
