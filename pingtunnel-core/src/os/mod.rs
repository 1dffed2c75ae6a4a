//! OS Bindings (C1): thin wrappers over the routing table, per-adapter
//! DNS configuration, the firewall, interface inventory/statistics,
//! process control, and elevation checks.
//!
//! Exposed as a trait so the test suite can substitute an in-memory fake
//! (see [`fake::FakeOs`]) instead of touching the real machine, per the
//! "polymorphism needs" design note. The production implementation is a
//! monolithic struct (`windows::WindowsOs`) that delegates to native
//! calls and `netsh`-equivalent command invocations.

pub mod fake;
#[cfg(windows)]
pub mod windows;

use std::net::Ipv4Addr;
use std::path::PathBuf;

use pingtunnel_types::error::HelperProcessName;
use pingtunnel_types::Error;

/// A route mutation target: destination network in CIDR form, via a
/// gateway, on a given interface, at a given metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteSpec {
    pub destination: Ipv4Addr,
    pub prefix_length: u8,
    pub gateway: Ipv4Addr,
    pub interface_index: u32,
    pub metric: u32,
}

/// An enumerated, non-loopback, operational network adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInfo {
    pub description: String,
    pub interface_index: u32,
}

/// Cumulative rx/tx byte counters for one interface, as read at a point
/// in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceByteCounters {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// A spawned child process handle, opaque to callers beyond termination
/// and liveness.
pub trait ChildProcess: Send {
    /// Returns `Some(exit_code)` once the process has exited, `None`
    /// while still running. `None` exit code means terminated by signal
    /// or killed without a reported code.
    fn try_wait(&mut self) -> std::result::Result<Option<Option<i32>>, Error>;

    /// Process id, for logging and orphan-cleanup cross-checks.
    fn pid(&self) -> u32;

    /// Takes ownership of the captured stdout stream, if any, so the
    /// Process Supervisor can read it line-by-line on a blocking task.
    /// Returns `None` if already taken or not captured.
    fn take_stdout(&mut self) -> Option<Box<dyn std::io::Read + Send>> {
        None
    }

    /// Same as [`ChildProcess::take_stdout`] for the captured stderr
    /// stream.
    fn take_stderr(&mut self) -> Option<Box<dyn std::io::Read + Send>> {
        None
    }
}

/// Capability set exposed by the host OS: routing, DNS, firewall,
/// interface inventory, process control, elevation.
///
/// All operations are synchronous and may block; callers are expected to
/// invoke these from a `tokio::task::spawn_blocking` delegation rather
/// than directly on a cooperative task, per the async model design note.
pub trait OsBindings: Send + Sync {
    // --- Routing ---------------------------------------------------

    /// Returns the next-hop gateway and interface index of the `0.0.0.0/0`
    /// route with the lowest effective metric, or `None` if there is no
    /// default route.
    fn find_default_route(&self) -> Result<Option<(Ipv4Addr, u32)>, Error>;

    /// Idempotent: adding an already-present route is a no-op success.
    fn add_route(&self, route: RouteSpec) -> Result<(), Error>;

    /// Idempotent: deleting an absent route is a no-op success.
    fn delete_route(
        &self,
        destination: Ipv4Addr,
        prefix_length: u8,
        gateway: Ipv4Addr,
    ) -> Result<(), Error>;

    /// Disables automatic metric assignment on the interface and fixes
    /// it at `metric`.
    fn set_interface_metric(&self, interface_index: u32, metric: u32) -> Result<(), Error>;

    /// Configures a static IPv4 address on the interface without
    /// defining a default gateway on it.
    fn set_interface_address(
        &self,
        interface_index: u32,
        address: Ipv4Addr,
        prefix_length: u8,
    ) -> Result<(), Error>;

    // --- DNS ---------------------------------------------------------

    /// Snapshots every adapter's current DNS server list, keyed by
    /// adapter description.
    fn snapshot_dns_all(&self) -> Result<std::collections::HashMap<String, Vec<Ipv4Addr>>, Error>;

    /// Sets the DNS servers for one adapter. Implementations must never
    /// fail the whole batch for a single uncooperative adapter; callers
    /// invoke this per-adapter and log-and-continue on error.
    fn set_dns(&self, adapter: &str, servers: &[Ipv4Addr]) -> Result<(), Error>;

    /// Resets one adapter's DNS configuration back to DHCP-assigned.
    fn reset_dns_to_dhcp(&self, adapter: &str) -> Result<(), Error>;

    fn flush_resolver_cache(&self) -> Result<(), Error>;

    // --- Firewall ------------------------------------------------------

    fn add_block_outbound_udp(&self, local_subnet: Ipv4Addr, prefix_length: u8) -> Result<(), Error>;

    fn add_allow_outbound_udp(&self, remote_ip: Ipv4Addr) -> Result<(), Error>;

    /// Idempotent: removing an absent rule is a no-op success.
    fn remove_rule(&self, name: &str) -> Result<(), Error>;

    fn list_rules_with_prefix(&self, prefix: &str) -> Result<Vec<String>, Error>;

    // --- Interface inventory -------------------------------------------

    fn list_active_adapters(&self) -> Result<Vec<AdapterInfo>, Error>;

    /// Resolves an adapter name/description pattern to its IPv4
    /// interface index, retrying briefly since a freshly created TUN
    /// adapter takes a moment to register.
    fn resolve_interface_index(
        &self,
        name_pattern: &str,
        retry: std::time::Duration,
    ) -> Result<Option<u32>, Error>;

    fn read_interface_counters(&self, interface_index: u32) -> Result<InterfaceByteCounters, Error>;

    // --- Process control -------------------------------------------------

    fn spawn_process(
        &self,
        executable: &PathBuf,
        args: &[String],
    ) -> Result<Box<dyn ChildProcess>, Error>;

    /// Tree-kills the process, waiting up to `timeout`.
    fn terminate_process_tree(
        &self,
        process: &mut dyn ChildProcess,
        timeout: std::time::Duration,
    ) -> Result<(), Error>;

    /// Lists running processes of the given helper identity whose image
    /// path lies inside `resource_dir`.
    fn find_orphaned_helper_processes(
        &self,
        name: HelperProcessName,
        resource_dir: &PathBuf,
    ) -> Result<Vec<u32>, Error>;

    fn kill_process_by_pid(&self, pid: u32) -> Result<(), Error>;

    // --- Elevation -------------------------------------------------------

    fn is_elevated(&self) -> Result<bool, Error>;

    /// Relaunches the current executable elevated, passing through argv.
    /// Does not return on success; the caller's process is expected to
    /// exit after calling this.
    fn relaunch_elevated(&self) -> Result<(), Error>;
}
