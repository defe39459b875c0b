//! Best-effort MAC address lookup from the local ARP cache.

use std::net::{IpAddr, SocketAddr};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio::net::TcpStream;
use tokio::process::Command;

const ARP_TABLE: &str = "/proc/net/arp";
const WARMUP_PORT: u16 = 80;
const WARMUP_TIMEOUT: Duration = Duration::from_secs(1);

/// Look up the MAC of `ip`. If the cache has no entry, a short TCP connect
/// populates it and the lookup is retried once.
pub async fn lookup_mac(ip: IpAddr) -> Option<String> {
    if let Some(mac) = read_arp_cache(ip).await {
        return Some(mac);
    }

    // Any traffic at all makes the kernel resolve the neighbor
    let _ = tokio::time::timeout(
        WARMUP_TIMEOUT,
        TcpStream::connect(SocketAddr::new(ip, WARMUP_PORT)),
    )
    .await;

    read_arp_cache(ip).await
}

async fn read_arp_cache(ip: IpAddr) -> Option<String> {
    // Only IPv4 neighbors live in the ARP table
    if !ip.is_ipv4() {
        return None;
    }

    if let Ok(table) = tokio::fs::read_to_string(ARP_TABLE).await {
        if let Some(mac) = parse_proc_arp(&table, ip) {
            return Some(mac);
        }
    }

    let output = match Command::new("arp").arg("-n").arg(ip.to_string()).output().await {
        Ok(o) => o,
        Err(e) => {
            tracing::debug!("arp command unavailable: {}", e);
            return None;
        }
    };
    parse_arp_output(&String::from_utf8_lossy(&output.stdout), ip)
}

/// Parse the kernel ARP table. Incomplete entries (all-zero MAC) are skipped.
fn parse_proc_arp(table: &str, ip: IpAddr) -> Option<String> {
    let wanted = ip.to_string();
    table.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [addr, _hw_type, _flags, mac, ..] if *addr == wanted => normalize_mac(mac),
            _ => None,
        }
    })
}

/// Parse `arp -n` output from Linux net-tools or BSD.
fn parse_arp_output(output: &str, ip: IpAddr) -> Option<String> {
    static MAC: OnceLock<Option<Regex>> = OnceLock::new();
    let re = MAC
        .get_or_init(|| Regex::new(r"(?i)\b([0-9a-f]{1,2}(?:[:-][0-9a-f]{1,2}){5})\b").ok())
        .as_ref()?;

    let wanted = ip.to_string();
    output
        .lines()
        .filter(|line| {
            line.split(|c: char| c.is_whitespace() || c == '(' || c == ')')
                .any(|tok| tok == wanted)
        })
        .find_map(|line| re.captures(line).and_then(|c| normalize_mac(&c[1])))
}

/// Lowercase, colon separated, two digits per octet.
fn normalize_mac(raw: &str) -> Option<String> {
    let octets: Vec<&str> = raw.split([':', '-']).collect();
    if octets.len() != 6 {
        return None;
    }

    let mut bytes = [0u8; 6];
    for (byte, octet) in bytes.iter_mut().zip(&octets) {
        *byte = u8::from_str_radix(octet, 16).ok()?;
    }
    if bytes == [0; 6] {
        return None;
    }

    Some(
        bytes
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(":"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const PROC_ARP: &str = "\
IP address       HW type     Flags       HW address            Mask     Device
192.168.1.1      0x1         0x2         a4:91:b1:0c:22:7e     *        eth0
192.168.1.50     0x1         0x0         00:00:00:00:00:00     *        eth0
192.168.1.20     0x1         0x2         DC:A6:32:01:02:03     *        wlan0
";

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, last))
    }

    #[test]
    fn test_parse_proc_arp() {
        assert_eq!(parse_proc_arp(PROC_ARP, ip(1)).as_deref(), Some("a4:91:b1:0c:22:7e"));
        assert_eq!(parse_proc_arp(PROC_ARP, ip(20)).as_deref(), Some("dc:a6:32:01:02:03"));
        // Incomplete entry
        assert_eq!(parse_proc_arp(PROC_ARP, ip(50)), None);
        assert_eq!(parse_proc_arp(PROC_ARP, ip(99)), None);
    }

    #[test]
    fn test_parse_arp_output_linux() {
        let output = "\
Address                  HWtype  HWaddress           Flags Mask            Iface
192.168.1.1              ether   a4:91:b1:0c:22:7e   C                     eth0
192.168.1.10             ether   b8:27:eb:aa:bb:cc   C                     eth0
";
        assert_eq!(parse_arp_output(output, ip(10)).as_deref(), Some("b8:27:eb:aa:bb:cc"));
        assert_eq!(parse_arp_output(output, ip(1)).as_deref(), Some("a4:91:b1:0c:22:7e"));
    }

    #[test]
    fn test_parse_arp_output_bsd() {
        let output = "? (192.168.1.7) at 0:1b:63:84:45:e6 on en0 ifscope [ethernet]\n";
        assert_eq!(parse_arp_output(output, ip(7)).as_deref(), Some("00:1b:63:84:45:e6"));
        assert_eq!(parse_arp_output(output, ip(70)), None);
    }

    #[test]
    fn test_parse_arp_output_no_entry() {
        let output = "192.168.1.9 (192.168.1.9) -- no entry\n";
        assert_eq!(parse_arp_output(output, ip(9)), None);
    }

    #[test]
    fn test_normalize_mac() {
        assert_eq!(normalize_mac("AA-BB-CC-01-02-03").as_deref(), Some("aa:bb:cc:01:02:03"));
        assert_eq!(normalize_mac("aa:bb:cc"), None);
        assert_eq!(normalize_mac("zz:bb:cc:01:02:03"), None);
    }

    #[tokio::test]
    async fn test_lookup_ipv6_is_none() {
        assert_eq!(read_arp_cache("::1".parse().unwrap()).await, None);
    }
}
