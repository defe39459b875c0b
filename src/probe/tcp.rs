//! TCP connect probe.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use tokio::net::TcpStream;

use super::ProbeError;

/// Open a TCP connection to `ip:port`.
///
/// Returns connect latency in nanoseconds.
pub async fn run_tcp_probe(ip: IpAddr, port: u16, timeout: Duration) -> Result<f64, ProbeError> {
    let addr = SocketAddr::new(ip, port);
    let start = Instant::now();

    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| ProbeError::from_io(e, timeout))?;

    let elapsed = start.elapsed().as_nanos() as f64;
    drop(stream);

    Ok(elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[tokio::test]
    async fn test_tcp_probe_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let latency = run_tcp_probe(LOCALHOST, port, Duration::from_secs(2)).await.unwrap();
        assert!(latency > 0.0);
    }

    #[tokio::test]
    async fn test_tcp_probe_closed_port_is_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = run_tcp_probe(LOCALHOST, port, Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, ProbeError::Refused), "got {:?}", err);
    }
}
