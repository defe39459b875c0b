//! Sensor and device views over targets and their latest probe results.

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::{IntegrationConfig, Protocol, Target};
use crate::probe::{FailureReason, ProbeResult};

pub const DOMAIN: &str = "connectivity_monitor";
pub const MANUFACTURER: &str = "Connectivity Monitor";
pub const MODEL: &str = "Network Monitor";
pub const DEVICE_VERSION: &str = "1.0";
pub const SUGGESTED_AREA: &str = "Network";

const ICON_CONNECTED: &str = "mdi:lan-connect";
const ICON_DISCONNECTED: &str = "mdi:lan-disconnect";
const ICON_PARTIAL: &str = "mdi:lan-pending";

/// Everything the coordinator knows at one instant.
#[derive(Debug, Clone, Default)]
pub struct StateSnapshot {
    pub results: HashMap<String, ProbeResult>,
    pub macs: HashMap<String, String>,
    pub alerting: HashSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SensorState {
    Connected,
    Disconnected,
    #[serde(rename = "Not Connected")]
    NotConnected,
}

impl fmt::Display for SensorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SensorState::Connected => "Connected",
            SensorState::Disconnected => "Disconnected",
            SensorState::NotConnected => "Not Connected",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OverallState {
    Connected,
    #[serde(rename = "Partially Connected")]
    PartiallyConnected,
    Disconnected,
    #[serde(rename = "Not Connected")]
    NotConnected,
}

#[derive(Debug, Clone, Serialize)]
pub struct SensorAttributes {
    pub host: String,
    pub protocol: Protocol,
    pub dns_server: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SensorView {
    pub unique_id: String,
    pub entity_id: String,
    pub name: String,
    pub device: String,
    pub state: SensorState,
    pub icon: &'static str,
    pub attributes: SensorAttributes,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub identifiers: Vec<(String, String)>,
    pub name: String,
    pub manufacturer: &'static str,
    pub model: &'static str,
    pub hw_version: &'static str,
    pub sw_version: &'static str,
    pub configuration_url: String,
    pub suggested_area: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OverallView {
    pub unique_id: String,
    pub entity_id: String,
    pub name: &'static str,
    pub state: OverallState,
    pub icon: &'static str,
    pub connected: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceView {
    pub host: String,
    pub info: DeviceInfo,
    pub overall: OverallView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert_group: Option<String>,
    pub alert_delay: u32,
    pub alerting: bool,
    pub sensors: Vec<SensorView>,
}

/// Lowercase `s` and replace anything not alphanumeric with `_`.
pub fn slugify(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

pub fn sensor_name(target: &Target) -> String {
    match (target.protocol, target.port) {
        (Protocol::Icmp, _) | (_, None) => "ICMP (Ping)".to_string(),
        (protocol, Some(port)) => format!("{} {}", protocol, port),
    }
}

pub fn sensor_entity_id(target: &Target) -> String {
    let host = slugify(&target.host);
    match (target.protocol, target.port) {
        (Protocol::Icmp, _) | (_, None) => format!("sensor.{}_{}_icmp", DOMAIN, host),
        (protocol, Some(port)) => format!(
            "sensor.{}_{}_{}_{}",
            DOMAIN,
            host,
            protocol.as_str().to_ascii_lowercase(),
            port
        ),
    }
}

pub fn sensor_state(result: Option<&ProbeResult>) -> SensorState {
    match result {
        None => SensorState::NotConnected,
        Some(r) if r.reachable => SensorState::Connected,
        Some(_) => SensorState::Disconnected,
    }
}

pub fn build_sensor(target: &Target, result: Option<&ProbeResult>, dns_server: &str) -> SensorView {
    let state = sensor_state(result);

    SensorView {
        unique_id: target.unique_id(),
        entity_id: sensor_entity_id(target),
        name: sensor_name(target),
        device: target.host.clone(),
        state,
        icon: if state == SensorState::Connected { ICON_CONNECTED } else { ICON_DISCONNECTED },
        attributes: SensorAttributes {
            host: target.host.clone(),
            protocol: target.protocol,
            dns_server: dns_server.to_string(),
            port: target.port,
            latency_ms: result.and_then(|r| r.latency_ms),
            resolved_ip: result.and_then(|r| r.resolved_ip).map(|ip| ip.to_string()),
            failure: result.and_then(|r| r.failure),
            last_update: result.map(|r| r.timestamp),
        },
    }
}

/// Aggregate the sensor states of one device.
pub fn overall_state(states: &[SensorState]) -> OverallState {
    let known: Vec<_> = states.iter().filter(|s| **s != SensorState::NotConnected).collect();
    if known.is_empty() {
        return OverallState::NotConnected;
    }

    let connected = known.iter().filter(|s| ***s == SensorState::Connected).count();
    if connected == states.len() {
        OverallState::Connected
    } else if connected > 0 {
        OverallState::PartiallyConnected
    } else {
        OverallState::Disconnected
    }
}

pub fn device_info(host: &str, device_name: &str, mac_address: Option<String>) -> DeviceInfo {
    let name = if device_name.trim().is_empty() { host } else { device_name };

    DeviceInfo {
        identifiers: vec![(DOMAIN.to_string(), host.to_string())],
        name: name.to_string(),
        manufacturer: MANUFACTURER,
        model: MODEL,
        hw_version: DEVICE_VERSION,
        sw_version: DEVICE_VERSION,
        configuration_url: format!("http://{}", host),
        suggested_area: SUGGESTED_AREA,
        mac_address,
    }
}

/// Build every sensor of the config, in config order.
pub fn build_sensors(config: &IntegrationConfig, snapshot: &StateSnapshot) -> Vec<SensorView> {
    let dns = config.dns_server.to_string();
    config
        .targets
        .iter()
        .map(|t| build_sensor(t, snapshot.results.get(&t.unique_id()), &dns))
        .collect()
}

/// Build one view per device host, each with its sensors and overall state.
pub fn build_devices(config: &IntegrationConfig, snapshot: &StateSnapshot) -> Vec<DeviceView> {
    let dns = config.dns_server.to_string();

    config
        .hosts()
        .into_iter()
        .filter_map(|host| {
            let targets: Vec<&Target> = config.device_targets(host).collect();
            let first = targets.first()?;

            let sensors: Vec<SensorView> = targets
                .iter()
                .map(|t| build_sensor(t, snapshot.results.get(&t.unique_id()), &dns))
                .collect();
            let states: Vec<SensorState> = sensors.iter().map(|s| s.state).collect();
            let state = overall_state(&states);

            Some(DeviceView {
                host: host.to_string(),
                info: device_info(host, &first.device_name, snapshot.macs.get(host).cloned()),
                overall: OverallView {
                    unique_id: format!("{}_overall", host),
                    entity_id: format!("sensor.{}_{}_overall", DOMAIN, slugify(host)),
                    name: "Overall Status",
                    state,
                    icon: match state {
                        OverallState::Connected => ICON_CONNECTED,
                        OverallState::PartiallyConnected => ICON_PARTIAL,
                        _ => ICON_DISCONNECTED,
                    },
                    connected: states.iter().filter(|s| **s == SensorState::Connected).count(),
                    total: states.len(),
                },
                alert_group: first.alert_group.clone(),
                alert_delay: first.alert_delay,
                alerting: snapshot.alerting.contains(host),
                sensors,
            })
        })
        .collect()
}
