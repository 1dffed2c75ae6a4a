//! Routing-table bindings over the IP Helper API, grounded in the
//! teacher's `winnet_rs` module: the same `GetIpForwardTable2` walk used
//! there to find the best default route, plus `CreateIpForwardEntry2` /
//! `DeleteIpForwardEntry2` for the mutations this product additionally
//! needs.

use std::mem::zeroed;
use std::net::Ipv4Addr;

use pingtunnel_types::Error;
use windows_sys::Win32::Foundation::NO_ERROR;
use windows_sys::Win32::NetworkManagement::IpHelper::{
    ConvertInterfaceIndexToLuid, CreateIpForwardEntry2, DeleteIpForwardEntry2,
    FreeMibTable, GetIfEntry2, GetIpForwardTable2, MIB_IF_ROW2, MIB_IPFORWARD_ROW2,
    MIB_IPINTERFACE_ROW, NET_LUID_LH, SetIpInterfaceEntry,
};
use windows_sys::Win32::Networking::WinSock::{AF_INET, AF_UNSPEC, SOCKADDR_INET};

use super::RouteSpec;

fn ipv4_to_sockaddr(addr: Ipv4Addr) -> SOCKADDR_INET {
    // SAFETY: `SOCKADDR_INET` is a union of POD network-address structs;
    // the all-zero pattern is a valid (if unspecified-family) value.
    let mut sockaddr: SOCKADDR_INET = unsafe { zeroed() };
    sockaddr.si_family = AF_INET;
    unsafe {
        sockaddr.Ipv4.sin_family = AF_INET;
        sockaddr.Ipv4.sin_addr.S_un.S_addr = u32::from_ne_bytes(addr.octets());
    }
    sockaddr
}

fn sockaddr_to_ipv4(sockaddr: &SOCKADDR_INET) -> Option<Ipv4Addr> {
    // SAFETY: we only read `Ipv4` after checking `si_family == AF_INET`.
    unsafe {
        if sockaddr.si_family != AF_INET {
            return None;
        }
        Some(Ipv4Addr::from(sockaddr.Ipv4.sin_addr.S_un.S_addr.to_ne_bytes()))
    }
}

fn interface_index_to_luid(interface_index: u32) -> Result<NET_LUID_LH, Error> {
    // SAFETY: `luid` is an out-parameter POD struct; all fields are
    // integers so the zeroed pattern is valid before the call fills it.
    let mut luid: NET_LUID_LH = unsafe { zeroed() };
    let result = unsafe { ConvertInterfaceIndexToLuid(interface_index, &mut luid) };
    if result != NO_ERROR {
        return Err(Error::os("ConvertInterfaceIndexToLuid", result as i64));
    }
    Ok(luid)
}

/// Walks the IPv4 forward table for the `0.0.0.0/0` entry with the
/// lowest effective metric (route metric + interface metric) that is on
/// a connected, non-tunnel, non-loopback interface.
pub fn find_default_route() -> Result<Option<(Ipv4Addr, u32)>, Error> {
    let mut table_ptr: *mut windows_sys::Win32::NetworkManagement::IpHelper::MIB_IPFORWARD_TABLE2 =
        std::ptr::null_mut();

    // SAFETY: `GetIpForwardTable2` heap-allocates the table and points
    // `table_ptr` at it; freed below via `FreeMibTable`.
    let result = unsafe { GetIpForwardTable2(AF_INET as u16, &mut table_ptr) };
    if result != NO_ERROR {
        return Err(Error::os("GetIpForwardTable2", result as i64));
    }

    // SAFETY: `table_ptr` is valid since the call above succeeded.
    let num_entries = unsafe { (*table_ptr).NumEntries };
    let mut best: Option<(MIB_IPFORWARD_ROW2, u32)> = None;

    for i in 0..num_entries {
        // SAFETY: `table_ptr` remains valid and unmutated for the
        // duration of this loop; `i` is within `NumEntries`.
        let row: MIB_IPFORWARD_ROW2 = unsafe {
            let ptr: *const MIB_IPFORWARD_ROW2 = (*table_ptr).Table.as_ptr();
            ptr.add(i as usize).read()
        };

        if row.DestinationPrefix.PrefixLength != 0 {
            continue;
        }
        let Some(gateway) = sockaddr_to_ipv4(&row.NextHop) else {
            continue;
        };
        if gateway.is_unspecified() {
            continue;
        }
        if !is_physical_connected_interface(&row) {
            continue;
        }

        let effective_metric = row.Metric + interface_metric(&row.InterfaceLuid, &row.InterfaceIndex).unwrap_or(0);
        if best.as_ref().map(|(_, m)| effective_metric < *m).unwrap_or(true) {
            best = Some((row, effective_metric));
        }
    }

    // SAFETY: frees the table allocated by `GetIpForwardTable2` above;
    // all rows we kept were copied by value, not borrowed.
    unsafe { FreeMibTable(table_ptr as *const _) };

    Ok(best.and_then(|(row, _)| sockaddr_to_ipv4(&row.NextHop).map(|gw| (gw, row.InterfaceIndex))))
}

fn interface_metric(luid: &NET_LUID_LH, index: &u32) -> Option<u32> {
    // SAFETY: `row` is POD; zeroed is a valid initial value before
    // `GetIfEntry2` fills it in based on the LUID/index we set.
    let mut row: MIB_IF_ROW2 = unsafe { zeroed() };
    row.InterfaceLuid = *luid;
    row.InterfaceIndex = *index;
    // SAFETY: `row.InterfaceLuid`/`InterfaceIndex` are set above.
    if unsafe { GetIfEntry2(&mut row) } != NO_ERROR {
        return None;
    }
    Some(row.Metric)
}

fn is_physical_connected_interface(route: &MIB_IPFORWARD_ROW2) -> bool {
    const IF_TYPE_SOFTWARE_LOOPBACK: u32 = 24;
    const IF_TYPE_TUNNEL: u32 = 131;

    // SAFETY: `row` is POD; zeroed is valid before `GetIfEntry2` fills it.
    let mut row: MIB_IF_ROW2 = unsafe { zeroed() };
    row.InterfaceLuid = route.InterfaceLuid;
    row.InterfaceIndex = route.InterfaceIndex;
    // SAFETY: `row.InterfaceLuid`/`InterfaceIndex` are set above.
    if unsafe { GetIfEntry2(&mut row) } != NO_ERROR {
        return false;
    }
    if row.Type == IF_TYPE_SOFTWARE_LOOPBACK || row.Type == IF_TYPE_TUNNEL {
        return false;
    }
    row.OperStatus == 1
}

pub fn add_route(route: RouteSpec) -> Result<(), Error> {
    let luid = interface_index_to_luid(route.interface_index)?;

    // SAFETY: `row` is POD; zeroed is a valid initial value, all fields
    // we don't set explicitly stay at their Windows-defined default (0).
    let mut row: MIB_IPFORWARD_ROW2 = unsafe { zeroed() };
    row.InterfaceLuid = luid;
    row.InterfaceIndex = route.interface_index;
    row.DestinationPrefix.Prefix = ipv4_to_sockaddr(route.destination);
    row.DestinationPrefix.PrefixLength = route.prefix_length;
    row.NextHop = ipv4_to_sockaddr(route.gateway);
    row.Metric = route.metric;
    row.Protocol = 3; /* MIB_IPPROTO_NETMGMT */

    // SAFETY: `row` is fully initialized above.
    let result = unsafe { CreateIpForwardEntry2(&row) };
    const ERROR_OBJECT_ALREADY_EXISTS: i32 = 5010;
    if result == NO_ERROR || result == ERROR_OBJECT_ALREADY_EXISTS as u32 {
        Ok(())
    } else {
        Err(Error::os("CreateIpForwardEntry2", result as i64))
    }
}

pub fn delete_route(destination: Ipv4Addr, prefix_length: u8, gateway: Ipv4Addr) -> Result<(), Error> {
    // Find the matching row in the live table so we delete with the
    // correct interface LUID; deleting a route the table does not
    // contain is treated as success per the idempotence invariant.
    let mut table_ptr: *mut windows_sys::Win32::NetworkManagement::IpHelper::MIB_IPFORWARD_TABLE2 =
        std::ptr::null_mut();
    // SAFETY: see `find_default_route`.
    let result = unsafe { GetIpForwardTable2(AF_UNSPEC as u16, &mut table_ptr) };
    if result != NO_ERROR {
        return Err(Error::os("GetIpForwardTable2", result as i64));
    }

    // SAFETY: see `find_default_route`.
    let num_entries = unsafe { (*table_ptr).NumEntries };
    let mut found: Option<MIB_IPFORWARD_ROW2> = None;
    for i in 0..num_entries {
        // SAFETY: see `find_default_route`.
        let row: MIB_IPFORWARD_ROW2 = unsafe {
            let ptr: *const MIB_IPFORWARD_ROW2 = (*table_ptr).Table.as_ptr();
            ptr.add(i as usize).read()
        };
        if row.DestinationPrefix.PrefixLength == prefix_length
            && sockaddr_to_ipv4(&row.DestinationPrefix.Prefix) == Some(destination)
            && sockaddr_to_ipv4(&row.NextHop) == Some(gateway)
        {
            found = Some(row);
            break;
        }
    }
    // SAFETY: frees the table allocated above.
    unsafe { FreeMibTable(table_ptr as *const _) };

    let Some(row) = found else {
        return Ok(());
    };

    // SAFETY: `row` was read from a live table entry.
    let result = unsafe { DeleteIpForwardEntry2(&row) };
    const ERROR_NOT_FOUND: i32 = 1168;
    if result == NO_ERROR || result == ERROR_NOT_FOUND as u32 {
        Ok(())
    } else {
        Err(Error::os("DeleteIpForwardEntry2", result as i64))
    }
}

pub fn set_interface_metric(interface_index: u32, metric: u32) -> Result<(), Error> {
    let luid = interface_index_to_luid(interface_index)?;

    // SAFETY: `row` is POD; we only need `InterfaceLuid`/`Family` set
    // before `GetIpInterfaceEntry`/`SetIpInterfaceEntry`... we build a
    // fresh request instead since the full row must be read first.
    let mut row: MIB_IPINTERFACE_ROW = unsafe { zeroed() };
    row.Family = AF_INET as u16;
    row.InterfaceLuid = luid;

    use windows_sys::Win32::NetworkManagement::IpHelper::GetIpInterfaceEntry;
    // SAFETY: `row.Family`/`InterfaceLuid` are set above; this fills the
    // rest of the struct so `SetIpInterfaceEntry` below is a valid update.
    let result = unsafe { GetIpInterfaceEntry(&mut row) };
    if result != NO_ERROR {
        return Err(Error::os("GetIpInterfaceEntry", result as i64));
    }

    row.UseAutomaticMetric = 0;
    row.Metric = metric;

    // SAFETY: `row` was read from the live table and only the metric
    // fields were changed.
    let result = unsafe { SetIpInterfaceEntry(&mut row) };
    if result == NO_ERROR {
        Ok(())
    } else {
        Err(Error::os("SetIpInterfaceEntry", result as i64))
    }
}

pub fn set_interface_address(interface_index: u32, address: Ipv4Addr, prefix_length: u8) -> Result<(), Error> {
    use windows_sys::Win32::NetworkManagement::IpHelper::{
        CreateUnicastIpAddressEntry, MIB_UNICASTIPADDRESS_ROW,
    };

    let luid = interface_index_to_luid(interface_index)?;

    // SAFETY: `row` is POD; zeroed is valid before we populate it below.
    let mut row: MIB_UNICASTIPADDRESS_ROW = unsafe { zeroed() };
    row.InterfaceLuid = luid;
    row.InterfaceIndex = interface_index;
    row.Address = ipv4_to_sockaddr(address);
    row.OnLinkPrefixLength = prefix_length;
    row.DadState = 4; /* IpDadStatePreferred, skips duplicate-address detection */

    // SAFETY: `row` is fully initialized above.
    let result = unsafe { CreateUnicastIpAddressEntry(&row) };
    const ERROR_OBJECT_ALREADY_EXISTS: i32 = 5010;
    if result == NO_ERROR || result == ERROR_OBJECT_ALREADY_EXISTS as u32 {
        Ok(())
    } else {
        Err(Error::os("CreateUnicastIpAddressEntry", result as i64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_sockaddr_round_trips() {
        let addr = Ipv4Addr::new(198, 18, 0, 2);
        let sockaddr = ipv4_to_sockaddr(addr);
        assert_eq!(sockaddr_to_ipv4(&sockaddr), Some(addr));
    }
}
