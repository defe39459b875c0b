//! Setup and reconfiguration steps for the config entry.
//!
//! Each step validates its input and returns the new config; persisting it
//! and restarting probes is the caller's job.

use std::net::Ipv4Addr;

use serde::Deserialize;
use thiserror::Error;

use crate::db::{IntegrationConfig, Protocol, Target, DEFAULT_ALERT_DELAY, DEFAULT_DNS_SERVER, DEFAULT_INTERVAL};
use crate::probe::RPC_DEFAULT_PORT;

pub const DEFAULT_PORT: u16 = 80;
pub const MIN_INTERVAL: u64 = 5;
pub const MAX_INTERVAL: u64 = 300;
pub const MIN_ALERT_DELAY: u32 = 1;
pub const MAX_ALERT_DELAY: u32 = 60;

/// Active Directory domain controller ports and their services.
pub const AD_DC_PORTS: [(u16, &str); 8] = [
    (88, "Kerberos"),
    (139, "NetBIOS"),
    (389, "LDAP"),
    (445, "SMB"),
    (464, "Kerberos Password Change"),
    (636, "LDAPS"),
    (3268, "Global Catalog"),
    (3269, "Global Catalog SSL"),
];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FlowError {
    #[error("host must be a non-empty hostname or IP address")]
    InvalidHost,
    #[error("DNS server must be an IPv4 address")]
    InvalidDnsServer,
    #[error("interval must be between {MIN_INTERVAL} and {MAX_INTERVAL} seconds")]
    InvalidInterval,
    #[error("port must be between 1 and 65535")]
    InvalidPort,
    #[error("alert delay must be between {MIN_ALERT_DELAY} and {MAX_ALERT_DELAY} minutes")]
    InvalidAlertDelay,
    #[error("unknown alert group: {0}")]
    UnknownAlertGroup(String),
    #[error("unknown device: {0}")]
    UnknownDevice(String),
    #[error("unknown sensor: {0}")]
    UnknownSensor(String),
    #[error("every requested sensor is already configured")]
    AlreadyConfigured,
    #[error("integration is not configured yet")]
    NotConfigured,
}

impl FlowError {
    /// Stable error key for API clients.
    pub fn code(&self) -> &'static str {
        match self {
            FlowError::InvalidHost => "invalid_host",
            FlowError::InvalidDnsServer => "invalid_dns_server",
            FlowError::InvalidInterval => "invalid_interval",
            FlowError::InvalidPort => "invalid_port",
            FlowError::InvalidAlertDelay => "invalid_alert_delay",
            FlowError::UnknownAlertGroup(_) => "unknown_alert_group",
            FlowError::UnknownDevice(_) => "unknown_device",
            FlowError::UnknownSensor(_) => "unknown_sensor",
            FlowError::AlreadyConfigured => "already_configured",
            FlowError::NotConfigured => "not_configured",
        }
    }
}

/// Protocol choice in the add-device step. `AD_DC` expands to several TCP sensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceProtocol {
    Tcp,
    Udp,
    Icmp,
    Rpc,
    #[serde(rename = "AD_DC")]
    AdDc,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddDeviceRequest {
    pub host: String,
    #[serde(default)]
    pub device_name: Option<String>,
    pub protocol: DeviceProtocol,
    #[serde(default)]
    pub port: Option<u32>,
    #[serde(default)]
    pub alert_group: Option<String>,
    #[serde(default)]
    pub alert_delay: Option<u32>,
    /// First device only.
    #[serde(default)]
    pub dns_server: Option<String>,
    /// First device only, seconds.
    #[serde(default)]
    pub interval: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertUpdate {
    #[serde(default)]
    pub alert_group: Option<String>,
    pub alert_delay: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SettingsUpdate {
    pub interval: u64,
    pub dns_server: String,
}

pub fn validate_dns_server(s: &str) -> Result<Ipv4Addr, FlowError> {
    s.trim().parse().map_err(|_| FlowError::InvalidDnsServer)
}

pub fn validate_interval(secs: u64) -> Result<u64, FlowError> {
    if (MIN_INTERVAL..=MAX_INTERVAL).contains(&secs) {
        Ok(secs)
    } else {
        Err(FlowError::InvalidInterval)
    }
}

pub fn validate_port(port: u32) -> Result<u16, FlowError> {
    match u16::try_from(port) {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(FlowError::InvalidPort),
    }
}

pub fn validate_alert_delay(minutes: u32) -> Result<u32, FlowError> {
    if (MIN_ALERT_DELAY..=MAX_ALERT_DELAY).contains(&minutes) {
        Ok(minutes)
    } else {
        Err(FlowError::InvalidAlertDelay)
    }
}

pub fn validate_host(host: &str) -> Result<String, FlowError> {
    let host = host.trim();
    if host.is_empty() || host.chars().any(|c| c.is_whitespace() || c == '/') {
        return Err(FlowError::InvalidHost);
    }
    Ok(host.to_string())
}

/// Empty means "no alert group"; anything else must be a known group.
pub fn validate_alert_group(group: Option<&str>, known_groups: &[String]) -> Result<Option<String>, FlowError> {
    match group.map(str::trim) {
        None | Some("") => Ok(None),
        Some(g) if known_groups.iter().any(|k| k == g) => Ok(Some(g.to_string())),
        Some(g) => Err(FlowError::UnknownAlertGroup(g.to_string())),
    }
}

/// Add a device. Creates the config entry when `current` is `None`.
pub fn add_device(
    current: Option<&IntegrationConfig>,
    req: &AddDeviceRequest,
    known_groups: &[String],
) -> Result<IntegrationConfig, FlowError> {
    let host = validate_host(&req.host)?;

    // Fields left out of the request keep the existing device's values
    let existing = current.and_then(|c| c.device_targets(&host).next());
    let alert_group = match (&req.alert_group, existing) {
        (None, Some(t)) => t.alert_group.clone(),
        (group, _) => validate_alert_group(group.as_deref(), known_groups)?,
    };
    let alert_delay = match (req.alert_delay, existing) {
        (None, Some(t)) => t.alert_delay,
        (delay, _) => validate_alert_delay(delay.unwrap_or(DEFAULT_ALERT_DELAY))?,
    };
    let device_name = match req.device_name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => name.to_string(),
        None => existing.map_or_else(|| host.clone(), |t| t.device_name.clone()),
    };

    let mut config = match current {
        Some(existing) => existing.clone(),
        None => IntegrationConfig {
            dns_server: match req.dns_server.as_deref() {
                Some(s) => validate_dns_server(s)?,
                None => DEFAULT_DNS_SERVER,
            },
            poll_interval_secs: validate_interval(req.interval.unwrap_or(DEFAULT_INTERVAL))?,
            targets: Vec::new(),
        },
    };

    let endpoints: Vec<(Protocol, Option<u16>)> = match req.protocol {
        DeviceProtocol::Icmp => vec![(Protocol::Icmp, None)],
        DeviceProtocol::Tcp => vec![(Protocol::Tcp, Some(validate_port(req.port.unwrap_or(DEFAULT_PORT as u32))?))],
        DeviceProtocol::Udp => vec![(Protocol::Udp, Some(validate_port(req.port.unwrap_or(DEFAULT_PORT as u32))?))],
        DeviceProtocol::Rpc => vec![(Protocol::Rpc, Some(validate_port(req.port.unwrap_or(RPC_DEFAULT_PORT as u32))?))],
        DeviceProtocol::AdDc => AD_DC_PORTS.iter().map(|(port, _)| (Protocol::Tcp, Some(*port))).collect(),
    };

    let mut added = 0;
    for (protocol, port) in endpoints {
        let target = Target::new(&host, protocol, port);
        if config.find_target(&target.unique_id()).is_some() {
            tracing::debug!("Skipping already configured sensor {}", target.unique_id());
            continue;
        }
        config.targets.push(target);
        added += 1;
    }

    if added == 0 {
        return Err(FlowError::AlreadyConfigured);
    }

    // Keep device-level settings uniform across the host's sensors
    for target in config.targets.iter_mut().filter(|t| t.host == host) {
        target.device_name = device_name.clone();
        target.alert_group = alert_group.clone();
        target.alert_delay = alert_delay;
    }

    Ok(config)
}

/// Remove every sensor of `host`. Returns the removed unique ids.
pub fn remove_device(config: &mut IntegrationConfig, host: &str) -> Result<Vec<String>, FlowError> {
    let removed: Vec<String> = config.device_targets(host).map(Target::unique_id).collect();
    if removed.is_empty() {
        return Err(FlowError::UnknownDevice(host.to_string()));
    }
    config.targets.retain(|t| t.host != host);
    Ok(removed)
}

/// Remove one sensor by unique id.
pub fn remove_sensor(config: &mut IntegrationConfig, unique_id: &str) -> Result<Target, FlowError> {
    let index = config
        .targets
        .iter()
        .position(|t| t.unique_id() == unique_id)
        .ok_or_else(|| FlowError::UnknownSensor(unique_id.to_string()))?;
    Ok(config.targets.remove(index))
}

/// Set alert group and delay for every sensor of `host`.
pub fn update_alerts(
    config: &mut IntegrationConfig,
    host: &str,
    update: &AlertUpdate,
    known_groups: &[String],
) -> Result<(), FlowError> {
    let alert_group = validate_alert_group(update.alert_group.as_deref(), known_groups)?;
    let alert_delay = validate_alert_delay(update.alert_delay)?;

    let mut found = false;
    for target in config.targets.iter_mut().filter(|t| t.host == host) {
        target.alert_group = alert_group.clone();
        target.alert_delay = alert_delay;
        found = true;
    }

    if found {
        Ok(())
    } else {
        Err(FlowError::UnknownDevice(host.to_string()))
    }
}

/// Change poll interval and DNS server.
pub fn update_settings(config: &mut IntegrationConfig, update: &SettingsUpdate) -> Result<(), FlowError> {
    let interval = validate_interval(update.interval)?;
    let dns_server = validate_dns_server(&update.dns_server)?;
    config.poll_interval_secs = interval;
    config.dns_server = dns_server;
    Ok(())
}
