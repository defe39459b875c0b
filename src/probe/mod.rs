//! Probe module for reachability checks.
//!
//! Supports TCP, UDP, ICMP and ONC RPC probes, plus DNS resolution of
//! target hostnames against the configured server.

mod dns;
mod ping;
mod rpc;
mod tcp;
mod udp;

pub use dns::*;
pub use ping::*;
pub use rpc::*;
pub use tcp::*;
pub use udp::*;

use crate::db::{Protocol, Target};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

/// Default timeout for TCP, UDP and RPC probes.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Default timeout for ICMP echo.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection refused")]
    Refused,
    #[error("DNS resolution failed: {0}")]
    Dns(String),
    #[error("host unreachable: {0}")]
    Unreachable(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("command failed: {0}")]
    Command(String),
}

/// Why a target was reported down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Timeout,
    Refused,
    DnsFailure,
    Unreachable,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Timeout => "timeout",
            FailureReason::Refused => "refused",
            FailureReason::DnsFailure => "dns_failure",
            FailureReason::Unreachable => "unreachable",
        }
    }
}

impl ProbeError {
    pub fn reason(&self) -> FailureReason {
        match self {
            ProbeError::Timeout(_) => FailureReason::Timeout,
            ProbeError::Refused => FailureReason::Refused,
            ProbeError::Dns(_) => FailureReason::DnsFailure,
            ProbeError::Unreachable(_)
            | ProbeError::Network(_)
            | ProbeError::Config(_)
            | ProbeError::Command(_) => FailureReason::Unreachable,
        }
    }

    /// Map a socket error onto the failure taxonomy.
    pub(crate) fn from_io(err: io::Error, timeout: Duration) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset => ProbeError::Refused,
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ProbeError::Timeout(timeout),
            _ => ProbeError::Unreachable(err.to_string()),
        }
    }
}

/// Per-protocol timeouts.
#[derive(Debug, Clone, Copy)]
pub struct ProbeTimeouts {
    pub connect: Duration,
    pub ping: Duration,
}

impl Default for ProbeTimeouts {
    fn default() -> Self {
        Self {
            connect: DEFAULT_PROBE_TIMEOUT,
            ping: DEFAULT_PING_TIMEOUT,
        }
    }
}

/// Probe configuration.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub protocol: Protocol,
    pub port: Option<u16>,
    pub timeout: Duration,
}

impl ProbeConfig {
    pub fn for_target(target: &Target, timeouts: &ProbeTimeouts) -> Self {
        let timeout = match target.protocol {
            Protocol::Icmp => timeouts.ping,
            _ => timeouts.connect,
        };
        Self {
            protocol: target.protocol,
            port: target.port,
            timeout,
        }
    }

    fn port(&self) -> Result<u16, ProbeError> {
        self.port
            .ok_or_else(|| ProbeError::Config(format!("{} probe requires a port", self.protocol)))
    }
}

/// Outcome of one poll of one target.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub unique_id: String,
    pub reachable: bool,
    pub latency_ms: Option<f64>,
    pub failure: Option<FailureReason>,
    pub detail: Option<String>,
    pub resolved_ip: Option<IpAddr>,
    pub timestamp: DateTime<Utc>,
}

/// Run a probe against an already resolved address.
///
/// Returns latency in nanoseconds on success, or `None` when the target
/// accepted the probe without a measurable round trip (silent UDP ports).
pub async fn run_probe(config: &ProbeConfig, ip: IpAddr) -> Result<Option<f64>, ProbeError> {
    // Add jitter to avoid thundering herd
    let jitter = rand::random::<u64>() % 100;
    tokio::time::sleep(Duration::from_millis(jitter)).await;

    let result = match config.protocol {
        Protocol::Tcp => run_tcp_probe(ip, config.port()?, config.timeout).await.map(Some),
        Protocol::Udp => run_udp_probe(ip, config.port()?, config.timeout).await,
        Protocol::Icmp => run_ping_probe(ip, config.timeout).await.map(Some),
        Protocol::Rpc => run_rpc_probe(ip, config.port()?, config.timeout).await.map(Some),
    };

    // Enforce timeout check
    if let Ok(Some(latency)) = &result {
        if *latency >= config.timeout.as_nanos() as f64 {
            return Err(ProbeError::Timeout(config.timeout));
        }
    }

    result
}

/// Resolve and probe one target, folding every failure into the result.
pub async fn probe_target(target: &Target, resolver: &Resolver, timeouts: &ProbeTimeouts) -> ProbeResult {
    let unique_id = target.unique_id();
    let timestamp = Utc::now();

    let ip = match resolver.resolve(&target.host).await {
        Ok(ip) => ip,
        Err(e) => {
            tracing::debug!("Resolution failed for {}: {}", target.host, e);
            return failed(unique_id, timestamp, None, &e);
        }
    };

    let config = ProbeConfig::for_target(target, timeouts);
    match run_probe(&config, ip).await {
        Ok(latency) => ProbeResult {
            unique_id,
            reachable: true,
            latency_ms: latency.map(nanos_to_ms),
            failure: None,
            detail: None,
            resolved_ip: Some(ip),
            timestamp,
        },
        Err(e) => {
            tracing::debug!(
                "Connection failed to {}:{} ({}): {}",
                target.host,
                target.port.map(|p| p.to_string()).unwrap_or_else(|| "N/A".to_string()),
                target.protocol,
                e
            );
            failed(unique_id, timestamp, Some(ip), &e)
        }
    }
}

fn failed(unique_id: String, timestamp: DateTime<Utc>, ip: Option<IpAddr>, err: &ProbeError) -> ProbeResult {
    ProbeResult {
        unique_id,
        reachable: false,
        latency_ms: None,
        failure: Some(err.reason()),
        detail: Some(err.to_string()),
        resolved_ip: ip,
        timestamp,
    }
}

/// Nanoseconds to milliseconds rounded to two decimals.
fn nanos_to_ms(nanos: f64) -> f64 {
    (nanos / 10_000.0).round() / 100.0
}
