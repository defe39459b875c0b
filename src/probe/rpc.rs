//! ONC RPC probe.
//!
//! Calls the NULL procedure of the portmapper program over TCP with
//! record marking (RFC 5531). Only an accepted, successful reply counts.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::ProbeError;

/// Default port of the portmapper / rpcbind service.
pub const RPC_DEFAULT_PORT: u16 = 111;

const PORTMAP_PROGRAM: u32 = 100_000;
const PORTMAP_VERSION: u32 = 2;
const NULL_PROCEDURE: u32 = 0;
const LAST_FRAGMENT: u32 = 0x8000_0000;
const MAX_REPLY_LEN: usize = 1024;

const MSG_CALL: u32 = 0;
const MSG_REPLY: u32 = 1;
const MSG_ACCEPTED: u32 = 0;
const ACCEPT_SUCCESS: u32 = 0;

/// Issue an RPC NULL call to `ip:port`.
///
/// Returns round-trip latency in nanoseconds, connect included.
pub async fn run_rpc_probe(ip: IpAddr, port: u16, timeout: Duration) -> Result<f64, ProbeError> {
    let addr = SocketAddr::new(ip, port);
    let xid: u32 = rand::random();
    let start = Instant::now();

    let body = tokio::time::timeout(timeout, exchange(addr, xid, timeout))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))??;
    let elapsed = start.elapsed().as_nanos() as f64;

    parse_rpc_reply(&body, xid)?;
    Ok(elapsed)
}

async fn exchange(addr: SocketAddr, xid: u32, timeout: Duration) -> Result<Vec<u8>, ProbeError> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|e| ProbeError::from_io(e, timeout))?;

    stream
        .write_all(&build_rpc_call(xid))
        .await
        .map_err(|e| ProbeError::from_io(e, timeout))?;

    let mut marker = [0u8; 4];
    stream.read_exact(&mut marker).await.map_err(|e| read_error(e, timeout))?;
    let len = (u32::from_be_bytes(marker) & !LAST_FRAGMENT) as usize;
    if len > MAX_REPLY_LEN {
        return Err(ProbeError::Unreachable(format!("rpc reply too large: {} bytes", len)));
    }

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.map_err(|e| read_error(e, timeout))?;
    Ok(body)
}

fn read_error(err: std::io::Error, timeout: Duration) -> ProbeError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ProbeError::Unreachable("connection closed before rpc reply".to_string())
    } else {
        ProbeError::from_io(err, timeout)
    }
}

/// Build a record-marked NULL call with AUTH_NONE credentials.
fn build_rpc_call(xid: u32) -> Vec<u8> {
    let words = [
        xid,
        MSG_CALL,
        2, // RPC version
        PORTMAP_PROGRAM,
        PORTMAP_VERSION,
        NULL_PROCEDURE,
        0, // cred flavor AUTH_NONE
        0, // cred length
        0, // verf flavor AUTH_NONE
        0, // verf length
    ];

    let mut packet = Vec::with_capacity(4 + words.len() * 4);
    packet.extend_from_slice(&(LAST_FRAGMENT | (words.len() as u32 * 4)).to_be_bytes());
    for word in words {
        packet.extend_from_slice(&word.to_be_bytes());
    }
    packet
}

/// Validate a reply body (record marker already stripped).
fn parse_rpc_reply(body: &[u8], xid: u32) -> Result<(), ProbeError> {
    let word = |i: usize| -> Result<u32, ProbeError> {
        body.get(i * 4..i * 4 + 4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            .ok_or_else(|| ProbeError::Unreachable("truncated rpc reply".to_string()))
    };

    if word(0)? != xid {
        return Err(ProbeError::Unreachable("rpc reply xid mismatch".to_string()));
    }
    if word(1)? != MSG_REPLY {
        return Err(ProbeError::Unreachable("not an rpc reply".to_string()));
    }
    if word(2)? != MSG_ACCEPTED {
        return Err(ProbeError::Unreachable("rpc call denied".to_string()));
    }

    // Verifier: flavor, then opaque body padded to 4 bytes
    let verf_len = word(4)? as usize;
    let stat_index = 5 + verf_len.div_ceil(4);
    match word(stat_index)? {
        ACCEPT_SUCCESS => Ok(()),
        stat => Err(ProbeError::Unreachable(format!("rpc accept status {}", stat))),
    }
}
