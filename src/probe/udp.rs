//! UDP probe.
//!
//! UDP has no handshake, so a port counts as reachable unless the host
//! answers with ICMP port unreachable. A reply datagram gives a latency.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;

use super::ProbeError;

/// Send an empty datagram to `ip:port` and wait for a reply or a rejection.
///
/// Returns `Some(latency_ns)` when the port answered, `None` when it stayed
/// silent for the whole timeout.
pub async fn run_udp_probe(ip: IpAddr, port: u16, timeout: Duration) -> Result<Option<f64>, ProbeError> {
    let bind_addr = match ip {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    };

    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(|e| ProbeError::Network(format!("failed to bind socket: {}", e)))?;
    socket
        .connect(SocketAddr::new(ip, port))
        .await
        .map_err(|e| ProbeError::from_io(e, timeout))?;

    let start = Instant::now();

    socket
        .send(&[])
        .await
        .map_err(|e| ProbeError::from_io(e, timeout))?;

    let mut buf = [0u8; 512];
    match tokio::time::timeout(timeout, socket.recv(&mut buf)).await {
        Ok(Ok(_)) => Ok(Some(start.elapsed().as_nanos() as f64)),
        Ok(Err(e)) => Err(ProbeError::from_io(e, timeout)),
        // No rejection within the window: open or filtered
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[tokio::test]
    async fn test_udp_probe_echo_reply() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            if let Ok((_, peer)) = server.recv_from(&mut buf).await {
                let _ = server.send_to(b"pong", peer).await;
            }
        });

        let latency = run_udp_probe(LOCALHOST, port, Duration::from_secs(2)).await.unwrap();
        assert!(latency.is_some());
    }

    #[tokio::test]
    async fn test_udp_probe_silent_port_is_reachable() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();

        let latency = run_udp_probe(LOCALHOST, port, Duration::from_millis(100)).await.unwrap();
        assert_eq!(latency, None);
        drop(server);
    }

    #[tokio::test]
    async fn test_udp_probe_closed_port_is_refused() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        drop(server);

        let err = run_udp_probe(LOCALHOST, port, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ProbeError::Refused), "got {:?}", err);
    }
}
