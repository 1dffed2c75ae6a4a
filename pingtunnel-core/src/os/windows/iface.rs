//! Interface inventory and byte-counter sampling, used by both the
//! Traffic Poller (C6) and the TUN-interface-appeared wait in the
//! connect sequence.

use std::time::{Duration, Instant};

use pingtunnel_types::Error;
use windows_sys::Win32::Foundation::NO_ERROR;
use windows_sys::Win32::NetworkManagement::IpHelper::{GetIfEntry2, MIB_IF_ROW2};

use super::adapters;
use crate::os::{AdapterInfo, InterfaceByteCounters};

pub fn list_active_adapters() -> Result<Vec<AdapterInfo>, Error> {
    Ok(adapters::enumerate()?
        .into_iter()
        .filter(|a| a.operational)
        .map(|a| AdapterInfo {
            description: a.description,
            interface_index: a.interface_index,
        })
        .collect())
}

/// Retries every 500ms up to `retry`, since a freshly created TUN
/// adapter takes a moment to register with the IP Helper inventory.
pub fn resolve_interface_index(name_pattern: &str, retry: Duration) -> Result<Option<u32>, Error> {
    let start = Instant::now();
    loop {
        let found = adapters::enumerate()?
            .into_iter()
            .find(|a| a.description.contains(name_pattern))
            .map(|a| a.interface_index);

        if found.is_some() || start.elapsed() >= retry {
            return Ok(found);
        }
        std::thread::sleep(Duration::from_millis(500));
    }
}

pub fn read_interface_counters(interface_index: u32) -> Result<InterfaceByteCounters, Error> {
    // SAFETY: `row` is POD; zeroed is valid before `GetIfEntry2` fills
    // it based on the index we set.
    let mut row: MIB_IF_ROW2 = unsafe { std::mem::zeroed() };
    row.InterfaceIndex = interface_index;

    // SAFETY: `row.InterfaceIndex` is set above.
    let result = unsafe { GetIfEntry2(&mut row) };
    if result != NO_ERROR {
        return Err(Error::os("GetIfEntry2", result as i64));
    }

    Ok(InterfaceByteCounters {
        rx_bytes: row.InOctets,
        tx_bytes: row.OutOctets,
    })
}
