//! In-memory fake of [`super::OsBindings`] used by the state machine and
//! recovery journal test suites, so the Connection Supervisor's ordering
//! and inverse-recording logic can be exercised without Windows.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use pingtunnel_types::error::HelperProcessName;
use pingtunnel_types::Error;

use super::{AdapterInfo, ChildProcess, InterfaceByteCounters, OsBindings, RouteSpec};

#[derive(Debug, Default)]
struct FakeOsState {
    default_route: Option<(Ipv4Addr, u32)>,
    routes: Vec<RouteSpec>,
    dns: HashMap<String, Vec<Ipv4Addr>>,
    firewall_rules: Vec<String>,
    adapters: Vec<AdapterInfo>,
    interface_counters: HashMap<u32, InterfaceByteCounters>,
    elevated: bool,
    orphans: Vec<u32>,
    killed_pids: Vec<u32>,
}

/// A fully in-process stand-in for the real OS bindings. Every mutating
/// call records its effect so tests can assert on the resulting state;
/// nothing here touches the real network stack, registry, or firewall.
pub struct FakeOs {
    state: Mutex<FakeOsState>,
    next_pid: AtomicU32,
}

impl Default for FakeOs {
    fn default() -> Self {
        FakeOs {
            state: Mutex::new(FakeOsState::default()),
            next_pid: AtomicU32::new(1000),
        }
    }
}

impl FakeOs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_route(self, gateway: Ipv4Addr, interface_index: u32) -> Self {
        self.state.lock().unwrap().default_route = Some((gateway, interface_index));
        self
    }

    pub fn with_adapter(self, description: &str, interface_index: u32) -> Self {
        self.state.lock().unwrap().adapters.push(AdapterInfo {
            description: description.to_string(),
            interface_index,
        });
        self
    }

    pub fn seed_dns(&self, adapter: &str, servers: Vec<Ipv4Addr>) {
        self.state
            .lock()
            .unwrap()
            .dns
            .insert(adapter.to_string(), servers);
    }

    pub fn routes(&self) -> Vec<RouteSpec> {
        self.state.lock().unwrap().routes.clone()
    }

    pub fn dns_snapshot(&self) -> HashMap<String, Vec<Ipv4Addr>> {
        self.state.lock().unwrap().dns.clone()
    }

    pub fn firewall_rules(&self) -> Vec<String> {
        self.state.lock().unwrap().firewall_rules.clone()
    }

    pub fn set_elevated(&self, elevated: bool) {
        self.state.lock().unwrap().elevated = elevated;
    }

    pub fn seed_orphan(&self, pid: u32) {
        self.state.lock().unwrap().orphans.push(pid);
    }

    pub fn killed_pids(&self) -> Vec<u32> {
        self.state.lock().unwrap().killed_pids.clone()
    }
}

struct FakeChild {
    pid: u32,
    exited: bool,
}

impl ChildProcess for FakeChild {
    fn try_wait(&mut self) -> std::result::Result<Option<Option<i32>>, Error> {
        if self.exited {
            Ok(Some(Some(0)))
        } else {
            Ok(None)
        }
    }

    fn pid(&self) -> u32 {
        self.pid
    }
}

impl OsBindings for FakeOs {
    fn find_default_route(&self) -> Result<Option<(Ipv4Addr, u32)>, Error> {
        Ok(self.state.lock().unwrap().default_route)
    }

    fn add_route(&self, route: RouteSpec) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if !state.routes.iter().any(|r| {
            r.destination == route.destination
                && r.prefix_length == route.prefix_length
                && r.gateway == route.gateway
        }) {
            state.routes.push(route);
        }
        Ok(())
    }

    fn delete_route(
        &self,
        destination: Ipv4Addr,
        prefix_length: u8,
        gateway: Ipv4Addr,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state
            .routes
            .retain(|r| !(r.destination == destination && r.prefix_length == prefix_length && r.gateway == gateway));
        Ok(())
    }

    fn set_interface_metric(&self, _interface_index: u32, _metric: u32) -> Result<(), Error> {
        Ok(())
    }

    fn set_interface_address(
        &self,
        _interface_index: u32,
        _address: Ipv4Addr,
        _prefix_length: u8,
    ) -> Result<(), Error> {
        Ok(())
    }

    fn snapshot_dns_all(&self) -> Result<HashMap<String, Vec<Ipv4Addr>>, Error> {
        Ok(self.state.lock().unwrap().dns.clone())
    }

    fn set_dns(&self, adapter: &str, servers: &[Ipv4Addr]) -> Result<(), Error> {
        self.state
            .lock()
            .unwrap()
            .dns
            .insert(adapter.to_string(), servers.to_vec());
        Ok(())
    }

    fn reset_dns_to_dhcp(&self, adapter: &str) -> Result<(), Error> {
        self.state.lock().unwrap().dns.insert(adapter.to_string(), Vec::new());
        Ok(())
    }

    fn flush_resolver_cache(&self) -> Result<(), Error> {
        Ok(())
    }

    fn add_block_outbound_udp(&self, local_subnet: Ipv4Addr, prefix_length: u8) -> Result<(), Error> {
        self.state
            .lock()
            .unwrap()
            .firewall_rules
            .push(format!("PingTunnelVPN_BlockUDP_{}_{}", local_subnet, prefix_length));
        Ok(())
    }

    fn add_allow_outbound_udp(&self, remote_ip: Ipv4Addr) -> Result<(), Error> {
        self.state
            .lock()
            .unwrap()
            .firewall_rules
            .push(format!("PingTunnelVPN_BlockUDP_allow_{}", remote_ip));
        Ok(())
    }

    fn remove_rule(&self, name: &str) -> Result<(), Error> {
        self.state.lock().unwrap().firewall_rules.retain(|r| r != name);
        Ok(())
    }

    fn list_rules_with_prefix(&self, prefix: &str) -> Result<Vec<String>, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .firewall_rules
            .iter()
            .filter(|r| r.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn list_active_adapters(&self) -> Result<Vec<AdapterInfo>, Error> {
        Ok(self.state.lock().unwrap().adapters.clone())
    }

    fn resolve_interface_index(
        &self,
        name_pattern: &str,
        _retry: std::time::Duration,
    ) -> Result<Option<u32>, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .adapters
            .iter()
            .find(|a| a.description.contains(name_pattern))
            .map(|a| a.interface_index))
    }

    fn read_interface_counters(&self, interface_index: u32) -> Result<InterfaceByteCounters, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .interface_counters
            .get(&interface_index)
            .copied()
            .unwrap_or_default())
    }

    fn spawn_process(&self, _executable: &PathBuf, _args: &[String]) -> Result<Box<dyn ChildProcess>, Error> {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeChild { pid, exited: false }))
    }

    fn terminate_process_tree(
        &self,
        process: &mut dyn ChildProcess,
        _timeout: std::time::Duration,
    ) -> Result<(), Error> {
        self.state.lock().unwrap().killed_pids.push(process.pid());
        Ok(())
    }

    fn find_orphaned_helper_processes(
        &self,
        _name: HelperProcessName,
        _resource_dir: &PathBuf,
    ) -> Result<Vec<u32>, Error> {
        Ok(self.state.lock().unwrap().orphans.clone())
    }

    fn kill_process_by_pid(&self, pid: u32) -> Result<(), Error> {
        self.state.lock().unwrap().killed_pids.push(pid);
        Ok(())
    }

    fn is_elevated(&self) -> Result<bool, Error> {
        Ok(self.state.lock().unwrap().elevated)
    }

    fn relaunch_elevated(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_route_is_idempotent() {
        let os = FakeOs::new();
        let route = RouteSpec {
            destination: Ipv4Addr::new(10, 0, 0, 0),
            prefix_length: 8,
            gateway: Ipv4Addr::new(192, 168, 1, 1),
            interface_index: 4,
            metric: 1,
        };
        os.add_route(route).unwrap();
        os.add_route(route).unwrap();
        assert_eq!(os.routes().len(), 1);
    }

    #[test]
    fn delete_absent_route_is_success() {
        let os = FakeOs::new();
        assert!(os
            .delete_route(Ipv4Addr::new(1, 2, 3, 4), 32, Ipv4Addr::new(1, 1, 1, 1))
            .is_ok());
    }
}
