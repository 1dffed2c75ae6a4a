use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The top-level connection state. Exactly one instance exists at a time;
/// legal transitions are enforced by the Connection State Machine (C7),
/// not by this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnecting => "Disconnecting",
            ConnectionState::Error => "Error",
        };
        write!(f, "{}", s)
    }
}

/// A single throughput/byte-total counter pair for one interface kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceCounters {
    pub rx_bytes_per_sec: u64,
    pub tx_bytes_per_sec: u64,
    pub rx_session_total: u64,
    pub tx_session_total: u64,
}

/// Connection statistics owned by C7, read by the UI, mutated by the
/// Health Monitor (latency) and Traffic Poller (throughput).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub connected_at: Option<DateTime<Utc>>,
    pub tun: InterfaceCounters,
    pub physical: InterfaceCounters,
    pub latency_ms: Option<u32>,
    pub consecutive_high_latency: u32,
    pub degraded: bool,
}

/// A sequenced, timestamped transition event delivered to state
/// observers. The sequence number lets a downstream consumer (e.g. a log
/// viewer) detect a dropped notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChangeEvent {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub message: String,
    pub error: Option<String>,
}
