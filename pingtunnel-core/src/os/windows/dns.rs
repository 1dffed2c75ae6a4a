//! Per-adapter DNS bindings. Configures the `NameServer` value under each
//! adapter's Tcpip parameters registry key, the same registry-transaction
//! approach `talpid-core` carries `winreg` for
//! (`winreg = { features = ["transactions"] }`).

use std::collections::HashMap;
use std::net::Ipv4Addr;

use pingtunnel_types::Error;
use winreg::enums::*;
use winreg::RegKey;

use super::adapters;

const TCPIP_INTERFACES_KEY: &str = r"SYSTEM\CurrentControlSet\Services\Tcpip\Parameters\Interfaces";

fn interfaces_root() -> Result<RegKey, Error> {
    RegKey::predef(HKEY_LOCAL_MACHINE)
        .open_subkey_with_flags(TCPIP_INTERFACES_KEY, KEY_READ | KEY_WRITE)
        .map_err(|e| Error::os("open Tcpip interfaces key", e.raw_os_error().unwrap_or(-1) as i64))
}

/// Maps every operational adapter's description to its `NameServer`
/// registry value, parsed as a comma-separated IPv4 list (empty when the
/// adapter is DHCP-assigned).
pub fn snapshot_dns_all() -> Result<HashMap<String, Vec<Ipv4Addr>>, Error> {
    let root = interfaces_root()?;
    let mut snapshot = HashMap::new();

    for adapter in adapters::enumerate()? {
        if !adapter.operational {
            continue;
        }
        let servers = read_name_server(&root, &adapter.adapter_guid).unwrap_or_default();
        snapshot.insert(adapter.description, servers);
    }

    Ok(snapshot)
}

fn read_name_server(root: &RegKey, adapter_guid: &str) -> Option<Vec<Ipv4Addr>> {
    let subkey = root.open_subkey(adapter_guid).ok()?;
    let value: String = subkey.get_value("NameServer").ok()?;
    Some(parse_name_server_value(&value))
}

fn parse_name_server_value(value: &str) -> Vec<Ipv4Addr> {
    value
        .split(|c| c == ',' || c == ' ')
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect()
}

fn adapter_guid_for(description: &str) -> Result<Option<String>, Error> {
    Ok(adapters::enumerate()?
        .into_iter()
        .find(|a| a.description == description)
        .map(|a| a.adapter_guid))
}

pub fn set_dns(adapter: &str, servers: &[Ipv4Addr]) -> Result<(), Error> {
    let Some(guid) = adapter_guid_for(adapter)? else {
        log::warn!("set_dns: adapter '{}' not found, skipping", adapter);
        return Ok(());
    };
    let root = interfaces_root()?;
    let subkey = root
        .open_subkey_with_flags(&guid, KEY_WRITE)
        .map_err(|e| Error::os("open adapter Tcpip key", e.raw_os_error().unwrap_or(-1) as i64))?;

    let value = servers.iter().map(ToString::to_string).collect::<Vec<_>>().join(",");
    subkey
        .set_value("NameServer", &value)
        .map_err(|e| Error::os("set NameServer", e.raw_os_error().unwrap_or(-1) as i64))?;
    Ok(())
}

pub fn reset_dns_to_dhcp(adapter: &str) -> Result<(), Error> {
    set_dns(adapter, &[])
}

pub fn flush_resolver_cache() -> Result<(), Error> {
    duct::cmd!("ipconfig", "/flushdns")
        .stdout_capture()
        .stderr_capture()
        .run()
        .map_err(|e| Error::os("ipconfig /flushdns", e.raw_os_error().unwrap_or(-1) as i64))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comma_separated_servers() {
        let servers = parse_name_server_value("1.1.1.1,8.8.8.8");
        assert_eq!(servers, vec![Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8)]);
    }

    #[test]
    fn parses_empty_value_to_no_servers() {
        assert!(parse_name_server_value("").is_empty());
    }
}
