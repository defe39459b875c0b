//! DNS resolution against the configured server using raw UDP packets.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::Instant;

use super::ProbeError;

/// Wait per query attempt.
pub const DNS_TRY_TIMEOUT: Duration = Duration::from_secs(2);
/// Total time budget for one resolution.
pub const DNS_LIFETIME: Duration = Duration::from_secs(4);

const TYPE_A: u16 = 1;
const CLASS_IN: u16 = 1;
const RCODE_NXDOMAIN: u8 = 3;

/// Resolves target hostnames through one DNS server.
#[derive(Debug, Clone)]
pub struct Resolver {
    server: SocketAddr,
    timeout: Duration,
    lifetime: Duration,
}

impl Resolver {
    pub fn new(server: SocketAddr) -> Self {
        Self {
            server,
            timeout: DNS_TRY_TIMEOUT,
            lifetime: DNS_LIFETIME,
        }
    }

    /// Resolver for a DNS server on the standard port.
    pub fn for_server(ip: Ipv4Addr) -> Self {
        Self::new(SocketAddr::new(IpAddr::V4(ip), 53))
    }

    #[cfg(test)]
    pub fn with_timeouts(mut self, timeout: Duration, lifetime: Duration) -> Self {
        self.timeout = timeout;
        self.lifetime = lifetime;
        self
    }

    /// Resolve `host` to an address. IP literals are returned as-is.
    pub async fn resolve(&self, host: &str) -> Result<IpAddr, ProbeError> {
        let host = host.trim();
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }

        let deadline = Instant::now() + self.lifetime;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ProbeError::Dns(format!(
                    "no answer for {} from {} within {:?}",
                    host, self.server, self.lifetime
                )));
            }

            match self.query_once(host, self.timeout.min(remaining)).await? {
                Some(ip) => return Ok(IpAddr::V4(ip)),
                None => {
                    tracing::debug!("DNS query for {} to {} timed out, retrying", host, self.server);
                }
            }
        }
    }

    /// One query attempt. `Ok(None)` means the attempt timed out.
    async fn query_once(&self, host: &str, timeout: Duration) -> Result<Option<Ipv4Addr>, ProbeError> {
        let tx_id: u16 = rand::random();
        let packet = build_dns_query(host, tx_id)?;

        let bind_addr = match self.server {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| ProbeError::Dns(format!("failed to bind socket: {}", e)))?;
        socket
            .connect(self.server)
            .await
            .map_err(|e| ProbeError::Dns(format!("failed to connect to {}: {}", self.server, e)))?;
        socket
            .send(&packet)
            .await
            .map_err(|e| ProbeError::Dns(format!("failed to send to {}: {}", self.server, e)))?;

        let deadline = Instant::now() + timeout;
        let mut response = [0u8; 512];

        // Skip stray datagrams until ours arrives or the attempt expires
        loop {
            let n = match tokio::time::timeout_at(deadline, socket.recv(&mut response)).await {
                Err(_) => return Ok(None),
                Ok(Err(e)) => {
                    return Err(ProbeError::Dns(format!("failed to recv from {}: {}", self.server, e)))
                }
                Ok(Ok(n)) => n,
            };

            if n < 12 || u16::from_be_bytes([response[0], response[1]]) != tx_id {
                continue;
            }

            return parse_dns_response(&response[..n])
                .map(Some)
                .map_err(|e| match e {
                    ProbeError::Dns(msg) => ProbeError::Dns(format!("{}: {}", host, msg)),
                    other => other,
                });
        }
    }
}

/// Build a DNS query packet for the A record of `name`.
fn build_dns_query(name: &str, tx_id: u16) -> Result<Vec<u8>, ProbeError> {
    let flags: u16 = 0x0100; // Standard query, recursion desired

    let mut packet = Vec::with_capacity(32 + name.len());
    packet.extend_from_slice(&tx_id.to_be_bytes());
    packet.extend_from_slice(&flags.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    packet.extend_from_slice(&0u16.to_be_bytes()); // ANCOUNT
    packet.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
    packet.extend_from_slice(&0u16.to_be_bytes()); // ARCOUNT

    for label in name.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(ProbeError::Dns(format!("invalid hostname: {}", name)));
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);

    packet.extend_from_slice(&TYPE_A.to_be_bytes());
    packet.extend_from_slice(&CLASS_IN.to_be_bytes());

    Ok(packet)
}

/// Extract the first A record from a response.
fn parse_dns_response(buf: &[u8]) -> Result<Ipv4Addr, ProbeError> {
    if buf.len() < 12 {
        return Err(ProbeError::Dns(format!("response too short: {} bytes", buf.len())));
    }
    if buf[2] & 0x80 == 0 {
        return Err(ProbeError::Dns("response is not a reply".to_string()));
    }

    let rcode = buf[3] & 0x0F;
    if rcode == RCODE_NXDOMAIN {
        return Err(ProbeError::Dns("NXDOMAIN".to_string()));
    }
    if rcode != 0 {
        return Err(ProbeError::Dns(format!("server returned RCODE {}", rcode)));
    }

    let qd_count = u16::from_be_bytes([buf[4], buf[5]]);
    let an_count = u16::from_be_bytes([buf[6], buf[7]]);

    let mut offset = 12;
    for _ in 0..qd_count {
        offset = skip_name(buf, offset)? + 4;
    }

    for _ in 0..an_count {
        offset = skip_name(buf, offset)?;
        let header = buf
            .get(offset..offset + 10)
            .ok_or_else(|| ProbeError::Dns("truncated answer".to_string()))?;
        let rtype = u16::from_be_bytes([header[0], header[1]]);
        let class = u16::from_be_bytes([header[2], header[3]]);
        let rd_len = u16::from_be_bytes([header[8], header[9]]) as usize;
        offset += 10;

        let rdata = buf
            .get(offset..offset + rd_len)
            .ok_or_else(|| ProbeError::Dns("truncated answer".to_string()))?;
        if rtype == TYPE_A && class == CLASS_IN && rd_len == 4 {
            return Ok(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]));
        }
        offset += rd_len;
    }

    Err(ProbeError::Dns("no A record in answer".to_string()))
}

/// Return the offset just past the (possibly compressed) name at `offset`.
fn skip_name(buf: &[u8], mut offset: usize) -> Result<usize, ProbeError> {
    loop {
        let len = *buf
            .get(offset)
            .ok_or_else(|| ProbeError::Dns("truncated name".to_string()))?;
        if len == 0 {
            return Ok(offset + 1);
        }
        if len & 0xC0 == 0xC0 {
            // Compression pointer ends the name
            if offset + 2 > buf.len() {
                return Err(ProbeError::Dns("truncated name".to_string()));
            }
            return Ok(offset + 2);
        }
        offset += 1 + len as usize;
    }
}
