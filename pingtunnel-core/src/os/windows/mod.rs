//! Production [`OsBindings`] implementation: a monolithic struct that
//! delegates each capability family to its own submodule, the same way
//! `talpid-core`'s `winnet_rs` groups Windows-specific network bindings
//! under one crate-private module tree.

mod adapters;
mod dns;
mod elevation;
mod firewall;
mod iface;
mod process;
mod routing;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use pingtunnel_types::error::HelperProcessName;
use pingtunnel_types::Error;

use super::{AdapterInfo, ChildProcess, InterfaceByteCounters, OsBindings, RouteSpec};

/// The real, Windows-native [`OsBindings`]. Stateless: every call reads
/// or mutates live OS state directly, so this type is trivially `Clone`
/// and cheap to share behind an `Arc`.
#[derive(Default, Clone, Copy)]
pub struct WindowsOs;

impl WindowsOs {
    pub fn new() -> Self {
        WindowsOs
    }
}

impl OsBindings for WindowsOs {
    fn find_default_route(&self) -> Result<Option<(Ipv4Addr, u32)>, Error> {
        routing::find_default_route()
    }

    fn add_route(&self, route: RouteSpec) -> Result<(), Error> {
        routing::add_route(route)
    }

    fn delete_route(&self, destination: Ipv4Addr, prefix_length: u8, gateway: Ipv4Addr) -> Result<(), Error> {
        routing::delete_route(destination, prefix_length, gateway)
    }

    fn set_interface_metric(&self, interface_index: u32, metric: u32) -> Result<(), Error> {
        routing::set_interface_metric(interface_index, metric)
    }

    fn set_interface_address(&self, interface_index: u32, address: Ipv4Addr, prefix_length: u8) -> Result<(), Error> {
        routing::set_interface_address(interface_index, address, prefix_length)
    }

    fn snapshot_dns_all(&self) -> Result<HashMap<String, Vec<Ipv4Addr>>, Error> {
        dns::snapshot_dns_all()
    }

    fn set_dns(&self, adapter: &str, servers: &[Ipv4Addr]) -> Result<(), Error> {
        dns::set_dns(adapter, servers)
    }

    fn reset_dns_to_dhcp(&self, adapter: &str) -> Result<(), Error> {
        dns::reset_dns_to_dhcp(adapter)
    }

    fn flush_resolver_cache(&self) -> Result<(), Error> {
        dns::flush_resolver_cache()
    }

    fn add_block_outbound_udp(&self, local_subnet: Ipv4Addr, prefix_length: u8) -> Result<(), Error> {
        firewall::add_block_outbound_udp(local_subnet, prefix_length)
    }

    fn add_allow_outbound_udp(&self, remote_ip: Ipv4Addr) -> Result<(), Error> {
        firewall::add_allow_outbound_udp(remote_ip)
    }

    fn remove_rule(&self, name: &str) -> Result<(), Error> {
        firewall::remove_rule(name)
    }

    fn list_rules_with_prefix(&self, prefix: &str) -> Result<Vec<String>, Error> {
        firewall::list_rules_with_prefix(prefix)
    }

    fn list_active_adapters(&self) -> Result<Vec<AdapterInfo>, Error> {
        iface::list_active_adapters()
    }

    fn resolve_interface_index(&self, name_pattern: &str, retry: Duration) -> Result<Option<u32>, Error> {
        iface::resolve_interface_index(name_pattern, retry)
    }

    fn read_interface_counters(&self, interface_index: u32) -> Result<InterfaceByteCounters, Error> {
        iface::read_interface_counters(interface_index)
    }

    fn spawn_process(&self, executable: &PathBuf, args: &[String]) -> Result<Box<dyn ChildProcess>, Error> {
        process::spawn_process(executable, args)
    }

    fn terminate_process_tree(&self, process: &mut dyn ChildProcess, timeout: Duration) -> Result<(), Error> {
        process::terminate_process_tree(process.pid(), timeout)
    }

    fn find_orphaned_helper_processes(&self, name: HelperProcessName, resource_dir: &PathBuf) -> Result<Vec<u32>, Error> {
        process::find_orphaned_helper_processes(name, resource_dir)
    }

    fn kill_process_by_pid(&self, pid: u32) -> Result<(), Error> {
        process::kill_process_by_pid(pid)
    }

    fn is_elevated(&self) -> Result<bool, Error> {
        elevation::is_elevated()
    }

    fn relaunch_elevated(&self) -> Result<(), Error> {
        elevation::relaunch_elevated()
    }
}
