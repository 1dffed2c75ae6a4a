use std::collections::HashMap;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single route the current session added, recorded so it can be
/// reversed on disconnect or crash recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteEntry {
    pub destination: Ipv4Addr,
    pub prefix_length: u8,
    pub gateway: Ipv4Addr,
    pub interface_index: u32,
    pub metric: u32,
}

/// The on-disk shape of `state.json`: everything needed to undo the
/// system mutations of a session that did not exit cleanly.
///
/// Ordering rule: this is written BEFORE the corresponding mutation is
/// applied, and cleared AFTER every mutation has been reversed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryJournal {
    pub is_connected: bool,
    pub timestamp: Option<DateTime<Utc>>,
    pub original_default_gateway: Option<Ipv4Addr>,
    pub original_default_interface_index: Option<u32>,
    /// Keyed by adapter description, as returned by `snapshot_dns_all`.
    #[serde(default)]
    pub original_dns_settings: HashMap<String, Vec<Ipv4Addr>>,
    #[serde(default)]
    pub added_routes: Vec<RouteEntry>,
}

impl RecoveryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_connected(&mut self, now: DateTime<Utc>) {
        self.is_connected = true;
        self.timestamp = Some(now);
    }
}
