//! ICMP echo probe with native sockets and a `ping` command fallback.
//!
//! Native echo runs on blocking sockets inside spawn_blocking so the
//! round trip is timed without scheduler noise.

use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::ProbeError;

const ICMP_ECHO_REPLY: u8 = 0;
const ICMP_DEST_UNREACHABLE: u8 = 3;
const ICMP_ECHO_REQUEST: u8 = 8;
const ICMPV6_DEST_UNREACHABLE: u8 = 1;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    Native,
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// Identifier/sequence pair so concurrent pings to one host stay apart.
fn next_ping_id() -> (u16, u16) {
    let identifier: u16 = rand::random();
    let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    (identifier, sequence)
}

fn detect_icmp_capability() -> IcmpCapability {
    // RAW needs CAP_NET_RAW or root
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (RAW socket, privileged)");
        return IcmpCapability::Native;
    }

    // DGRAM works unprivileged on macOS and on Linux within ping_group_range
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (DGRAM socket, unprivileged)");
        return IcmpCapability::Native;
    }

    tracing::info!("Ping probe: native ICMP unavailable, using command fallback");
    IcmpCapability::CommandOnly
}

/// Send one ICMP echo request to `ip`.
///
/// Returns round-trip latency in nanoseconds.
pub async fn run_ping_probe(ip: IpAddr, timeout: Duration) -> Result<f64, ProbeError> {
    let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);

    if capability == IcmpCapability::Native {
        let result = tokio::task::spawn_blocking(move || run_blocking_ping(ip, timeout))
            .await
            .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?;

        return match result {
            Err(ProbeError::Network(msg)) if is_permission_error(&msg) => {
                tracing::warn!(
                    "Native ping to {} failed with permission error, falling back to command: {}",
                    ip,
                    msg
                );
                run_ping_command(ip, timeout).await
            }
            other => other,
        };
    }

    run_ping_command(ip, timeout).await
}

fn is_permission_error(msg: &str) -> bool {
    msg.contains("Permission") || msg.contains("Operation not permitted") || msg.contains("denied")
}

fn run_blocking_ping(ip: IpAddr, timeout: Duration) -> Result<f64, ProbeError> {
    let (domain, protocol) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
    };

    // RAW first (privileged), then DGRAM (unprivileged)
    let socket = Socket::new(domain, Type::RAW, Some(protocol))
        .or_else(|_| Socket::new(domain, Type::DGRAM, Some(protocol)))
        .map_err(|e| ProbeError::Network(format!("Failed to create ICMP socket: {}", e)))?;

    socket
        .set_read_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;
    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;
    socket
        .connect(&SocketAddr::new(ip, 0).into())
        .map_err(|e| ProbeError::Network(format!("Failed to connect: {}", e)))?;

    let (identifier, sequence) = next_ping_id();
    let packet = match ip {
        IpAddr::V4(_) => build_icmp_echo_request(identifier, sequence),
        IpAddr::V6(_) => build_icmpv6_echo_request(identifier, sequence),
    };

    let start = Instant::now();

    socket.send(&packet).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            ProbeError::Network(format!("Permission denied: {}", e))
        } else {
            ProbeError::Unreachable(format!("Failed to send: {}", e))
        }
    })?;

    // Keep reading until our reply shows up or the timeout passes
    loop {
        let mut buf = [MaybeUninit::<u8>::uninit(); 1500];
        let len = socket.recv(&mut buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => ProbeError::Timeout(timeout),
            _ => ProbeError::Unreachable(format!("Failed to receive: {}", e)),
        })?;
        // SAFETY: recv initialized the first `len` bytes
        let buf: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }

        match classify_reply(ip.is_ipv4(), buf, identifier, sequence) {
            ReplyKind::Ours => return Ok(elapsed.as_nanos() as f64),
            ReplyKind::Unreachable(code) => {
                return Err(ProbeError::Unreachable(format!(
                    "destination unreachable (code {})",
                    code
                )))
            }
            ReplyKind::Other => continue,
        }
    }
}

#[derive(Debug, PartialEq)]
enum ReplyKind {
    Ours,
    Unreachable(u8),
    Other,
}

/// Inspect a received ICMP datagram.
///
/// RAW IPv4 sockets deliver the IP header too; DGRAM and IPv6 sockets do not.
fn classify_reply(is_v4: bool, buf: &[u8], identifier: u16, sequence: u16) -> ReplyKind {
    let offset = if is_v4 && !buf.is_empty() && buf[0] >> 4 == 4 {
        ((buf[0] & 0x0F) as usize) * 4
    } else {
        0
    };

    let Some(icmp) = buf.get(offset..).filter(|b| b.len() >= 8) else {
        return ReplyKind::Other;
    };

    let (reply_type, unreachable_type) = if is_v4 {
        (ICMP_ECHO_REPLY, ICMP_DEST_UNREACHABLE)
    } else {
        (ICMPV6_ECHO_REPLY, ICMPV6_DEST_UNREACHABLE)
    };

    if icmp[0] == unreachable_type {
        // Only errors about our own echo request count; others (e.g. a UDP
        // port unreachable for the same host) are ignored.
        return if quotes_our_echo(is_v4, &icmp[8..], identifier, sequence, offset == 0) {
            ReplyKind::Unreachable(icmp[1])
        } else {
            ReplyKind::Other
        };
    }

    let reply_id = u16::from_be_bytes([icmp[4], icmp[5]]);
    let reply_seq = u16::from_be_bytes([icmp[6], icmp[7]]);

    // DGRAM sockets on Linux rewrite the identifier, so only the sequence is
    // reliable there; RAW sockets keep both.
    if icmp[0] == reply_type && reply_seq == sequence && (offset == 0 || reply_id == identifier) {
        ReplyKind::Ours
    } else {
        ReplyKind::Other
    }
}

/// Whether the datagram quoted in an ICMP error is our echo request.
fn quotes_our_echo(is_v4: bool, quoted: &[u8], identifier: u16, sequence: u16, id_rewritten: bool) -> bool {
    let inner = if is_v4 {
        let Some(&first) = quoted.first() else {
            return false;
        };
        let ihl = ((first & 0x0F) as usize) * 4;
        if first >> 4 != 4 || ihl < 20 || quoted.get(9) != Some(&1) {
            return false;
        }
        quoted.get(ihl..)
    } else {
        // Fixed IPv6 header; next header must be ICMPv6
        if quoted.get(6) != Some(&58) {
            return false;
        }
        quoted.get(40..)
    };

    let Some(echo) = inner.filter(|b| b.len() >= 8) else {
        return false;
    };
    let request_type = if is_v4 { ICMP_ECHO_REQUEST } else { ICMPV6_ECHO_REQUEST };
    let quoted_id = u16::from_be_bytes([echo[4], echo[5]]);
    let quoted_seq = u16::from_be_bytes([echo[6], echo[7]]);

    echo[0] == request_type && quoted_seq == sequence && (id_rewritten || quoted_id == identifier)
}

fn echo_payload(packet: &mut [u8]) {
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    packet[8..16].copy_from_slice(&timestamp.to_be_bytes());
}

/// Build an ICMP Echo Request packet (type 8, code 0).
fn build_icmp_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64]; // 8 byte header + 56 byte payload

    packet[0] = ICMP_ECHO_REQUEST;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());
    echo_payload(&mut packet);

    let checksum = icmp_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());

    packet
}

/// Build an ICMPv6 Echo Request packet (type 128, code 0).
///
/// The kernel fills in the ICMPv6 checksum.
fn build_icmpv6_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64];

    packet[0] = ICMPV6_ECHO_REQUEST;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());
    echo_payload(&mut packet);

    packet
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u16::from_be_bytes([pair[0], pair[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

/// Run ping via command execution (fallback).
async fn run_ping_command(ip: IpAddr, timeout: Duration) -> Result<f64, ProbeError> {
    let timeout_secs = timeout.as_secs().max(1);
    let program = if ip.is_ipv6() && cfg!(target_os = "macos") { "ping6" } else { "ping" };

    let output = Command::new(program)
        .args(["-c", "1", "-W", &timeout_secs.to_string(), &ip.to_string()])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stdout.contains("Unreachable") || stderr.contains("Unreachable") {
            return Err(ProbeError::Unreachable(format!("ping to {}: destination unreachable", ip)));
        }
        if stderr.contains("timeout")
            || stdout.contains("100% packet loss")
            || stdout.contains("100.0% packet loss")
        {
            return Err(ProbeError::Timeout(timeout));
        }
        return Err(ProbeError::Command(format!("ping failed: {}", stdout.trim())));
    }

    parse_ping_output(&stdout)
}

/// Parse ping command output for latency in nanoseconds.
fn parse_ping_output(output: &str) -> Result<f64, ProbeError> {
    // Per-packet "time=X.XXX ms" (Linux, macOS)
    static PER_PACKET: OnceLock<Option<Regex>> = OnceLock::new();
    // Summary "rtt min/avg/max/mdev" (Linux) or "round-trip min/avg/max/stddev" (macOS)
    static SUMMARY: OnceLock<Option<Regex>> = OnceLock::new();

    let per_packet = PER_PACKET.get_or_init(|| Regex::new(r"time[=<](?P<val>[0-9.]+)\s*ms").ok());
    let summary = SUMMARY.get_or_init(|| {
        Regex::new(r"(?:rtt|round-trip)\s+min/avg/max/(?:mdev|stddev)\s*=\s*[0-9.]+/(?P<val>[0-9.]+)/").ok()
    });

    for re in [per_packet, summary].into_iter().flatten() {
        if let Some(ms) = re
            .captures(output)
            .and_then(|caps| caps.name("val"))
            .and_then(|m| m.as_str().parse::<f64>().ok())
        {
            return Ok(ms * 1_000_000.0);
        }
    }

    Err(ProbeError::Command(format!("failed to parse ping output: {}", output)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_icmp_checksum_verifies() {
        let packet = build_icmp_echo_request(0x1234, 0x0001);
        // Summing a packet that carries its own checksum folds to zero
        assert_eq!(icmp_checksum(&packet), 0);
    }

    #[test]
    fn test_icmp_checksum_odd_length() {
        assert_eq!(icmp_checksum(&[0x01]), !0x0100u16);
    }

    #[test]
    fn test_build_icmp_packet() {
        let packet = build_icmp_echo_request(0x1234, 0x0001);
        assert_eq!(packet.len(), 64);
        assert_eq!(packet[0], 8);
        assert_eq!(packet[1], 0);
        assert_eq!(packet[4..6], [0x12, 0x34]);
        assert_eq!(packet[6..8], [0x00, 0x01]);

        let v6 = build_icmpv6_echo_request(0x1234, 0x0002);
        assert_eq!(v6[0], 128);
        assert_eq!(v6[2..4], [0, 0]);
    }

    #[test]
    fn test_classify_reply_raw_v4() {
        let mut datagram = vec![0x45u8];
        datagram.extend_from_slice(&[0u8; 19]);
        datagram.extend_from_slice(&[0, 0, 0, 0, 0x12, 0x34, 0x00, 0x07]);
        assert_eq!(classify_reply(true, &datagram, 0x1234, 7), ReplyKind::Ours);
        assert_eq!(classify_reply(true, &datagram, 0x9999, 7), ReplyKind::Other);

    }

    /// Outer IPv4 header + ICMP type 3 header quoting `inner_proto` with the given 8 bytes.
    fn unreachable_v4(code: u8, inner_proto: u8, inner_head: [u8; 8]) -> Vec<u8> {
        let mut datagram = vec![0x45u8];
        datagram.extend_from_slice(&[0u8; 19]);
        datagram.extend_from_slice(&[ICMP_DEST_UNREACHABLE, code, 0, 0, 0, 0, 0, 0]);
        let mut inner_ip = [0u8; 20];
        inner_ip[0] = 0x45;
        inner_ip[9] = inner_proto;
        datagram.extend_from_slice(&inner_ip);
        datagram.extend_from_slice(&inner_head);
        datagram
    }

    #[test]
    fn test_classify_unreachable_for_our_echo() {
        let datagram = unreachable_v4(1, 1, [ICMP_ECHO_REQUEST, 0, 0, 0, 0x12, 0x34, 0x00, 0x07]);
        assert_eq!(classify_reply(true, &datagram, 0x1234, 7), ReplyKind::Unreachable(1));
        // Someone else's echo
        assert_eq!(classify_reply(true, &datagram, 0x1234, 8), ReplyKind::Other);
        assert_eq!(classify_reply(true, &datagram, 0x4321, 7), ReplyKind::Other);
    }

    #[test]
    fn test_classify_ignores_unreachable_for_udp() {
        // Port unreachable quoting a UDP datagram to port 53
        let datagram = unreachable_v4(3, 17, [0xC3, 0x50, 0x00, 0x35, 0x00, 0x08, 0x00, 0x00]);
        assert_eq!(classify_reply(true, &datagram, 0x1234, 7), ReplyKind::Other);

        // Truncated quote
        let short = &datagram[..30];
        assert_eq!(classify_reply(true, short, 0x1234, 7), ReplyKind::Other);
    }

    #[test]
    fn test_classify_unreachable_v6() {
        let mut datagram = vec![ICMPV6_DEST_UNREACHABLE, 4, 0, 0, 0, 0, 0, 0];
        let mut inner_ip = [0u8; 40];
        inner_ip[0] = 0x60;
        inner_ip[6] = 58;
        datagram.extend_from_slice(&inner_ip);
        datagram.extend_from_slice(&[ICMPV6_ECHO_REQUEST, 0, 0, 0, 0x12, 0x34, 0x00, 0x03]);
        assert_eq!(classify_reply(false, &datagram, 0x1234, 3), ReplyKind::Unreachable(4));

        datagram[8 + 6] = 17;
        assert_eq!(classify_reply(false, &datagram, 0x1234, 3), ReplyKind::Other);
    }

    #[test]
    fn test_classify_reply_dgram() {
        // No IP header; identifier rewritten by the kernel
        let reply = [0u8, 0, 0, 0, 0xAB, 0xCD, 0x00, 0x03];
        assert_eq!(classify_reply(true, &reply, 0x1234, 3), ReplyKind::Ours);
        assert_eq!(classify_reply(true, &reply, 0x1234, 4), ReplyKind::Other);

        let v6 = [ICMPV6_ECHO_REPLY, 0, 0, 0, 0x12, 0x34, 0x00, 0x03];
        assert_eq!(classify_reply(false, &v6, 0x1234, 3), ReplyKind::Ours);
        assert_eq!(classify_reply(false, &v6[..4], 0x1234, 3), ReplyKind::Other);
    }

    #[test]
    fn test_parse_ping_output_linux() {
        let output = "64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.345 ms";
        let latency = parse_ping_output(output).unwrap();
        assert!((latency - 12_345_000.0).abs() < 1.0);
    }

    #[test]
    fn test_parse_ping_output_macos_summary() {
        let output = r#"PING 10.0.0.1 (10.0.0.1): 56 data bytes

--- 10.0.0.1 ping statistics ---
1 packets transmitted, 1 packets received, 0.0% packet loss
round-trip min/avg/max/stddev = 17.906/17.906/17.906/0.000 ms"#;
        let latency = parse_ping_output(output).unwrap();
        assert!((latency - 17_906_000.0).abs() < 1.0);
    }

    #[test]
    fn test_parse_ping_output_linux_summary_only() {
        let output = "rtt min/avg/max/mdev = 1.100/2.200/3.300/0.000 ms";
        let latency = parse_ping_output(output).unwrap();
        assert!((latency - 2_200_000.0).abs() < 1.0);
    }

    #[test]
    fn test_parse_ping_output_garbage() {
        assert!(matches!(parse_ping_output("no reply"), Err(ProbeError::Command(_))));
    }
}
