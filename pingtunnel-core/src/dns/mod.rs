//! DNS Forwarder (C4): an in-process UDP+TCP DNS listener on 127.0.0.1
//! that tunnels every query over SOCKS5 to a configured upstream and
//! caches responses with TTL.

mod cache;
mod socks5;
mod wire;

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pingtunnel_types::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use crate::cancel::CancellationToken;
use cache::DnsCache;

const PRIMARY_PORT: u16 = 53;
const FALLBACK_UDP_PORT: u16 = 5353;
const PER_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_BACKOFFS: [Duration; 3] = [Duration::from_millis(100), Duration::from_millis(200), Duration::from_millis(400)];
const MIN_QUERY_LEN: usize = 12;

/// Hit/miss counters and upstream health, published on a `watch` channel
/// so the Health Monitor and diagnostics can read current values without
/// taking a lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DnsStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub consecutive_upstream_failures: u64,
}

struct Shared {
    local_socks_port: u16,
    upstreams: Vec<Ipv4Addr>,
    cache: DnsCache,
    hits: AtomicU64,
    misses: AtomicU64,
    consecutive_failures: AtomicU64,
    stats_tx: tokio::sync::watch::Sender<DnsStats>,
    cancel: CancellationToken,
}

impl Shared {
    fn publish_stats(&self) {
        let _ = self.stats_tx.send(DnsStats {
            cache_hits: self.hits.load(Ordering::Relaxed),
            cache_misses: self.misses.load(Ordering::Relaxed),
            consecutive_upstream_failures: self.consecutive_failures.load(Ordering::Relaxed),
        });
    }
}

/// Owns the listening sockets and forwards queries for the lifetime of a
/// connected session. Dropping/cancelling stops the accept loops.
pub struct DnsForwarder {
    shared: Arc<Shared>,
}

impl DnsForwarder {
    /// Binds the UDP (and, best-effort, TCP) listeners and spawns the
    /// accept loops. Falls back to port 5353 for UDP if 53 is unavailable;
    /// TCP is skipped entirely (UDP-only) if its bind fails, since TCP DNS
    /// is best-effort rather than required for a working tunnel.
    pub async fn start(upstreams: Vec<Ipv4Addr>, local_socks_port: u16) -> Result<(Self, tokio::sync::watch::Receiver<DnsStats>), Error> {
        let (stats_tx, stats_rx) = tokio::sync::watch::channel(DnsStats::default());
        let shared = Arc::new(Shared {
            local_socks_port,
            upstreams,
            cache: DnsCache::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
            stats_tx,
            cancel: CancellationToken::new(),
        });

        let udp_socket = match UdpSocket::bind(("127.0.0.1", PRIMARY_PORT)).await {
            Ok(socket) => socket,
            Err(e) => {
                log::warn!("DNS forwarder: port {} unavailable for UDP ({}), falling back to {}", PRIMARY_PORT, e, FALLBACK_UDP_PORT);
                UdpSocket::bind(("127.0.0.1", FALLBACK_UDP_PORT))
                    .await
                    .map_err(|e| Error::os("bind UDP DNS listener", e.raw_os_error().unwrap_or(-1) as i64))?
            }
        };
        spawn_udp_loop(Arc::clone(&shared), udp_socket);

        match TcpListener::bind(("127.0.0.1", PRIMARY_PORT)).await {
            Ok(listener) => spawn_tcp_loop(Arc::clone(&shared), listener),
            Err(e) => log::warn!("DNS forwarder: port {} unavailable for TCP ({}), TCP DNS is skipped", PRIMARY_PORT, e),
        }

        Ok((DnsForwarder { shared }, stats_rx))
    }

    pub fn stats(&self) -> DnsStats {
        DnsStats {
            cache_hits: self.shared.hits.load(Ordering::Relaxed),
            cache_misses: self.shared.misses.load(Ordering::Relaxed),
            consecutive_upstream_failures: self.shared.consecutive_failures.load(Ordering::Relaxed),
        }
    }

    /// Signals the accept loops and outstanding query tasks to stop.
    pub fn shutdown(&self) {
        self.shared.cancel.cancel();
    }
}

fn spawn_udp_loop(shared: Arc<Shared>, socket: UdpSocket) {
    tokio::spawn(async move {
        let socket = Arc::new(socket);
        let mut buf = [0u8; 4096];
        loop {
            let recv = tokio::select! {
                _ = shared.cancel.cancelled() => break,
                result = socket.recv_from(&mut buf) => result,
            };
            let (len, addr) = match recv {
                Ok(pair) => pair,
                Err(_) => break,
            };
            if len < MIN_QUERY_LEN {
                continue;
            }
            let query = buf[..len].to_vec();
            let shared = Arc::clone(&shared);
            let socket = Arc::clone(&socket);
            tokio::spawn(async move {
                if let Some(response) = handle_query(&shared, &query).await {
                    let _ = socket.send_to(&response, addr).await;
                }
            });
        }
    });
}

fn spawn_tcp_loop(shared: Arc<Shared>, listener: TcpListener) {
    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = shared.cancel.cancelled() => break,
                result = listener.accept() => result,
            };
            let (stream, _addr) = match accepted {
                Ok(pair) => pair,
                Err(_) => break,
            };
            let shared = Arc::clone(&shared);
            tokio::spawn(handle_tcp_connection(shared, stream));
        }
    });
}

async fn handle_tcp_connection(shared: Arc<Shared>, mut stream: TcpStream) {
    let mut length_prefix = [0u8; 2];
    if stream.read_exact(&mut length_prefix).await.is_err() {
        return;
    }
    let length = u16::from_be_bytes(length_prefix) as usize;
    let mut query = vec![0u8; length];
    if stream.read_exact(&mut query).await.is_err() {
        return;
    }
    if query.len() < MIN_QUERY_LEN {
        return;
    }
    if let Some(response) = handle_query(&shared, &query).await {
        let mut framed = Vec::with_capacity(response.len() + 2);
        framed.extend_from_slice(&(response.len() as u16).to_be_bytes());
        framed.extend_from_slice(&response);
        let _ = stream.write_all(&framed).await;
    }
}

/// Looks up the cache, forwarding to upstreams on miss. Returns `None`
/// when every upstream is unreachable; the caller drops the query and the
/// client's own resolver will time out.
async fn handle_query(shared: &Arc<Shared>, query: &[u8]) -> Option<Vec<u8>> {
    let (name, qtype, qclass) = wire::question(query)?;
    let key = (name, qtype, qclass);

    if let Some(cached) = shared.cache.get(&key) {
        shared.hits.fetch_add(1, Ordering::Relaxed);
        shared.publish_stats();
        return Some(wire::with_transaction_id(&cached, query));
    }

    shared.misses.fetch_add(1, Ordering::Relaxed);
    shared.publish_stats();

    let response = forward_with_failover(shared, query).await?;
    let ttl = cache::clamp_ttl(wire::min_ttl(&response));
    shared.cache.insert(key, response.clone(), ttl);
    Some(response)
}

/// Tries each upstream in order, retrying with the fixed backoff ladder
/// before moving to the next. Resets the consecutive-failure counter on
/// any success; logs it at warning every 10 increments otherwise.
async fn forward_with_failover(shared: &Arc<Shared>, query: &[u8]) -> Option<Vec<u8>> {
    for upstream in &shared.upstreams {
        if shared.cancel.is_cancelled() {
            return None;
        }
        let mut attempt = 0usize;
        loop {
            match socks5::exchange(shared.local_socks_port, *upstream, query, PER_ATTEMPT_TIMEOUT).await {
                Ok(response) => {
                    shared.consecutive_failures.store(0, Ordering::Relaxed);
                    shared.publish_stats();
                    return Some(response);
                }
                Err(e) => {
                    log::debug!("DNS forwarder: upstream {} attempt {} failed: {}", upstream, attempt, e);
                    let failures = shared.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    shared.publish_stats();
                    if failures % 10 == 0 {
                        log::warn!("DNS forwarder: {} consecutive upstream failures", failures);
                    }
                    if attempt >= RETRY_BACKOFFS.len() {
                        break;
                    }
                    tokio::time::sleep(RETRY_BACKOFFS[attempt]).await;
                    attempt += 1;
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stats_are_zero() {
        let stats = DnsStats::default();
        assert_eq!(stats.cache_hits, 0);
        assert_eq!(stats.cache_misses, 0);
        assert_eq!(stats.consecutive_upstream_failures, 0);
    }
}
