//! The per-query SOCKS5 exchange: a fresh TCP connection to the local
//! SOCKS5 listener for every forwarded query, wrapping the DNS query in
//! the 2-byte-length TCP-DNS framing regardless of whether the original
//! client spoke UDP or TCP.

use std::net::Ipv4Addr;
use std::time::Duration;

use pingtunnel_types::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Performs the handshake, CONNECT request, and framed query/response
/// exchange, bounded by `timeout` end-to-end.
pub async fn exchange(local_socks_port: u16, upstream: Ipv4Addr, query: &[u8], timeout: Duration) -> Result<Vec<u8>, Error> {
    tokio::time::timeout(timeout, exchange_inner(local_socks_port, upstream, query))
        .await
        .map_err(|_| Error::SocksHandshakeFailed("timed out".to_string()))?
}

async fn exchange_inner(local_socks_port: u16, upstream: Ipv4Addr, query: &[u8]) -> Result<Vec<u8>, Error> {
    let mut stream = TcpStream::connect(("127.0.0.1", local_socks_port))
        .await
        .map_err(|e| Error::SocksHandshakeFailed(format!("connect to local proxy failed: {}", e)))?;

    // Greeting: version 5, 1 method, no-auth.
    stream
        .write_all(&[0x05, 0x01, 0x00])
        .await
        .map_err(|e| Error::SocksHandshakeFailed(e.to_string()))?;

    let mut method_reply = [0u8; 2];
    stream
        .read_exact(&mut method_reply)
        .await
        .map_err(|e| Error::SocksHandshakeFailed(e.to_string()))?;
    if method_reply != [0x05, 0x00] {
        return Err(Error::SocksHandshakeFailed(format!(
            "unexpected method selection reply {:?}",
            method_reply
        )));
    }

    // CONNECT request: ver, cmd=connect, rsv, atyp=ipv4, addr, port.
    let mut connect_request = vec![0x05, 0x01, 0x00, 0x01];
    connect_request.extend_from_slice(&upstream.octets());
    connect_request.extend_from_slice(&53u16.to_be_bytes());
    stream
        .write_all(&connect_request)
        .await
        .map_err(|e| Error::SocksHandshakeFailed(e.to_string()))?;

    // Reply: ver, rep, rsv, atyp, bnd.addr (4 for IPv4), bnd.port (2).
    let mut connect_reply = [0u8; 10];
    stream
        .read_exact(&mut connect_reply)
        .await
        .map_err(|e| Error::SocksHandshakeFailed(e.to_string()))?;
    if connect_reply[1] != 0x00 {
        return Err(Error::SocksHandshakeFailed(format!(
            "upstream connect failed with status {}",
            connect_reply[1]
        )));
    }

    let mut framed_query = Vec::with_capacity(query.len() + 2);
    framed_query.extend_from_slice(&(query.len() as u16).to_be_bytes());
    framed_query.extend_from_slice(query);
    stream
        .write_all(&framed_query)
        .await
        .map_err(|e| Error::SocksHandshakeFailed(e.to_string()))?;

    let mut length_prefix = [0u8; 2];
    stream
        .read_exact(&mut length_prefix)
        .await
        .map_err(|e| Error::SocksHandshakeFailed(e.to_string()))?;
    let length = u16::from_be_bytes(length_prefix) as usize;

    let mut response = vec![0u8; length];
    stream
        .read_exact(&mut response)
        .await
        .map_err(|e| Error::SocksHandshakeFailed(e.to_string()))?;

    Ok(response)
}
