//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

pub const DEFAULT_DNS_SERVER: Ipv4Addr = Ipv4Addr::new(1, 1, 1, 1);
/// Poll interval in seconds.
pub const DEFAULT_INTERVAL: u64 = 300;
/// Alert delay in minutes.
pub const DEFAULT_ALERT_DELAY: u32 = 15;

/// Transport used to check a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Rpc,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Icmp => "ICMP",
            Protocol::Rpc => "RPC",
        }
    }

    /// Whether probes of this protocol need a port.
    pub fn uses_port(&self) -> bool {
        !matches!(self, Protocol::Icmp)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TCP" => Ok(Protocol::Tcp),
            "UDP" => Ok(Protocol::Udp),
            "ICMP" => Ok(Protocol::Icmp),
            "RPC" => Ok(Protocol::Rpc),
            other => Err(format!("unknown protocol: {}", other)),
        }
    }
}

/// A monitored host/protocol/port combination. Backs exactly one sensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub host: String,
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub device_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_group: Option<String>,
    /// Minutes a device must stay unreachable before alerting.
    pub alert_delay: u32,
}

impl Target {
    pub fn new(host: &str, protocol: Protocol, port: Option<u16>) -> Self {
        Self {
            host: host.to_string(),
            protocol,
            port: if protocol.uses_port() { port } else { None },
            device_name: host.to_string(),
            alert_group: None,
            alert_delay: DEFAULT_ALERT_DELAY,
        }
    }

    /// Stable sensor identifier, `{host}_{PROTOCOL}_{port}` or `{host}_ICMP_ping`.
    pub fn unique_id(&self) -> String {
        match self.port {
            Some(port) => format!("{}_{}_{}", self.host, self.protocol, port),
            None => format!("{}_{}_ping", self.host, self.protocol),
        }
    }
}

/// The persisted config entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationConfig {
    pub dns_server: Ipv4Addr,
    pub poll_interval_secs: u64,
    pub targets: Vec<Target>,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            dns_server: DEFAULT_DNS_SERVER,
            poll_interval_secs: DEFAULT_INTERVAL,
            targets: Vec::new(),
        }
    }
}

impl IntegrationConfig {
    pub fn find_target(&self, unique_id: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.unique_id() == unique_id)
    }

    /// Targets belonging to one device.
    pub fn device_targets<'a>(&'a self, host: &'a str) -> impl Iterator<Item = &'a Target> + 'a {
        self.targets.iter().filter(move |t| t.host == host)
    }

    /// Distinct device hosts in insertion order.
    pub fn hosts(&self) -> Vec<&str> {
        let mut hosts: Vec<&str> = Vec::new();
        for target in &self.targets {
            if !hosts.contains(&target.host.as_str()) {
                hosts.push(&target.host);
            }
        }
        hosts
    }
}

/// One stored probe outcome.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryRecord {
    pub time: DateTime<Utc>,
    pub unique_id: String,
    pub reachable: bool,
    pub latency_ms: Option<f64>,
    pub failure: Option<String>,
    pub resolved_ip: Option<String>,
}
