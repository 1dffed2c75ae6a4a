//! Connection State Machine (C7): the top-level coordinator that orders
//! every step of the connect/disconnect sequences, owns the state graph,
//! and drives the other components.
//!
//! Only one transition runs at a time, guarded by `transition_lock`.
//! The cyclic dependency with the Process Supervisor (its `Exited`
//! events must reach back here) is resolved with one-way message
//! passing: a background task drains the Supervisor's broadcast channel
//! and calls back into `self` via a cloned `Arc`.

pub mod routes;

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use pingtunnel_types::config::{GlobalSettings, VpnConfiguration};
use pingtunnel_types::error::HelperProcessName;
use pingtunnel_types::journal::RecoveryJournal as JournalDocument;
use pingtunnel_types::state::{ConnectionState, ConnectionStats, StateChangeEvent};
use pingtunnel_types::Error;
use tokio::net::TcpStream;
use uuid::Uuid;

use crate::config_store::ConfigStore;
use crate::dns::DnsForwarder;
use crate::health::{HealthAction, HealthMonitor};
use crate::journal::RecoveryJournal;
use crate::mpsc::Sender;
use crate::os::{OsBindings, RouteSpec};
use crate::process::{ProcessEvent, ProcessSupervisor};
use crate::traffic::TrafficPoller;

const SOCKS_PORT_TIMEOUT: Duration = Duration::from_secs(15);
const TUN_APPEARANCE_TIMEOUT: Duration = Duration::from_secs(7);
const FAST_RESTART_SOCKS_TIMEOUT: Duration = Duration::from_secs(10);

struct Session {
    process_supervisor: Arc<ProcessSupervisor>,
    health_monitor: Arc<HealthMonitor>,
    traffic_poller: Arc<TrafficPoller>,
    dns_forwarder: Option<DnsForwarder>,
    is_restarting: Arc<AtomicBool>,
    configuration: VpnConfiguration,
    settings: GlobalSettings,
    local_socks_port: u16,
    background_tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Drop for Session {
    fn drop(&mut self) {
        for task in &self.background_tasks {
            task.abort();
        }
    }
}

pub struct ConnectionSupervisor {
    os: Arc<dyn OsBindings>,
    resource_dir: PathBuf,
    config_store: Arc<ConfigStore>,
    journal: Arc<RecoveryJournal>,
    state: std::sync::Mutex<ConnectionState>,
    transition_lock: tokio::sync::Mutex<()>,
    stats: Arc<std::sync::Mutex<ConnectionStats>>,
    sequence: AtomicU64,
    event_sender: Box<dyn Sender<StateChangeEvent> + Send + Sync>,
    session: std::sync::Mutex<Option<Session>>,
    partial_process_supervisor: std::sync::Mutex<Option<Arc<ProcessSupervisor>>>,
}

impl ConnectionSupervisor {
    pub fn new(
        os: Arc<dyn OsBindings>,
        resource_dir: PathBuf,
        config_store: Arc<ConfigStore>,
        journal: Arc<RecoveryJournal>,
        event_sender: Box<dyn Sender<StateChangeEvent> + Send + Sync>,
    ) -> Self {
        ConnectionSupervisor {
            os,
            resource_dir,
            config_store,
            journal,
            state: std::sync::Mutex::new(ConnectionState::Disconnected),
            transition_lock: tokio::sync::Mutex::new(()),
            stats: Arc::new(std::sync::Mutex::new(ConnectionStats::default())),
            sequence: AtomicU64::new(0),
            event_sender,
            session: std::sync::Mutex::new(None),
            partial_process_supervisor: std::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats.lock().unwrap().clone()
    }

    fn set_state(&self, to: ConnectionState, message: String, error: Option<String>) {
        let from = {
            let mut state = self.state.lock().unwrap();
            let from = *state;
            *state = to;
            from
        };
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let _ = self.event_sender.send(StateChangeEvent {
            sequence,
            timestamp: Utc::now(),
            from,
            to,
            message,
            error,
        });
    }

    async fn blocking_os<T, F>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce(&dyn OsBindings) -> Result<T, Error> + Send + 'static,
        T: Send + 'static,
    {
        let os = Arc::clone(&self.os);
        match tokio::task::spawn_blocking(move || f(os.as_ref())).await {
            Ok(result) => result,
            Err(_) => Err(Error::os("blocking OS task panicked", -1)),
        }
    }

    /// Transitions `Error → Disconnected` without running any cleanup
    /// (the cleanup already ran when `Error` was entered). The UI calls
    /// this once the user has seen the error message.
    pub fn acknowledge_error(&self) -> Result<(), Error> {
        let from = self.state();
        if from != ConnectionState::Error {
            return Err(Error::AlreadyInState { from, action: "acknowledge_error".to_string() });
        }
        self.set_state(ConnectionState::Disconnected, "error acknowledged".to_string(), None);
        Ok(())
    }

    /// `connect()` is legal from `Disconnected` or `Error`. Must be
    /// called on an `Arc<ConnectionSupervisor>` since success spawns
    /// background tasks that call back into `self`.
    pub async fn connect(self: &Arc<Self>) -> Result<(), Error> {
        let _guard = self.transition_lock.lock().await;
        let from = self.state();
        if !matches!(from, ConnectionState::Disconnected | ConnectionState::Error) {
            return Err(Error::AlreadyInState { from, action: "connect".to_string() });
        }
        self.set_state(ConnectionState::Connecting, "connecting".to_string(), None);

        match self.do_connect().await {
            Ok(session) => {
                self.arm_session(session);
                self.set_state(ConnectionState::Connected, "connected".to_string(), None);
                Ok(())
            }
            Err(e) => {
                self.cleanup_after_failed_connect().await;
                self.set_state(ConnectionState::Error, e.to_string(), Some(e.to_string()));
                Err(e)
            }
        }
    }

    fn arm_session(self: &Arc<Self>, mut session: Session) {
        let (action_tx, action_rx) = tokio::sync::mpsc::unbounded_channel();

        let health_task = tokio::spawn(Arc::clone(&session.health_monitor).run(action_tx));
        let traffic_task = tokio::spawn(Arc::clone(&session.traffic_poller).run());

        let exit_task = {
            let supervisor = Arc::clone(self);
            let mut events = session.process_supervisor.subscribe();
            tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    if let ProcessEvent::Exited { name, code } = event {
                        log::warn!("helper process {} exited unexpectedly with code {:?}", name, code);
                        let supervisor = Arc::clone(&supervisor);
                        tokio::spawn(async move {
                            let _ = supervisor.disconnect().await;
                        });
                        break;
                    }
                }
            })
        };

        let action_task = {
            let supervisor = Arc::clone(self);
            tokio::spawn(async move {
                let mut rx = action_rx;
                while let Some(action) = rx.recv().await {
                    supervisor.handle_health_action(&action).await;
                }
            })
        };

        session.background_tasks = vec![health_task, traffic_task, exit_task, action_task];
        *self.partial_process_supervisor.lock().unwrap() = None;
        *self.session.lock().unwrap() = Some(session);
    }

    async fn handle_health_action(self: &Arc<Self>, action: &HealthAction) {
        match action {
            HealthAction::FastRestart => self.perform_fast_restart().await,
            HealthAction::Disconnect => {
                let _ = self.disconnect().await;
            }
            HealthAction::FatalDisconnect { message } => {
                self.set_state(ConnectionState::Error, message.clone(), Some(message.clone()));
                let _ = self.disconnect().await;
            }
        }
    }

    /// The full connect sequence, steps 1-18 (step 19's transition
    /// happens in the caller once this returns `Ok`).
    async fn do_connect(&self) -> Result<Session, Error> {
        // Step 2: snapshot and validate configuration.
        let selected = self
            .config_store
            .selected()
            .ok_or_else(|| Error::ConfigInvalid(vec!["no configuration is selected".to_string()]))?;
        let configuration = selected.configuration;
        configuration.validate().map_err(Error::ConfigInvalid)?;
        let settings = self.config_store.global_settings();
        settings.validate().map_err(Error::ConfigInvalid)?;

        // Step 3: elevation and helper binaries.
        if !self.blocking_os(|os| os.is_elevated()).await? {
            return Err(Error::NotElevated);
        }
        for name in [HelperProcessName::PingTunnelClient, HelperProcessName::Tun2Socks] {
            let path = self.resource_dir.join(format!("{}.exe", name.as_str()));
            if !path.exists() {
                return Err(Error::MissingBinary(path));
            }
        }

        // Step 4: resolve server host.
        let server_ip = resolve_first_ipv4(&configuration.server_address).await?;

        // Step 5: the pre-session default route.
        let (original_gateway, original_if_index) = self
            .blocking_os(|os| os.find_default_route())
            .await?
            .ok_or(Error::DefaultGatewayUnknown)?;

        // Step 6 + 7: snapshot DNS, write the journal before any mutation.
        let original_dns_settings = self.blocking_os(|os| os.snapshot_dns_all()).await?;
        let mut journal_doc = JournalDocument {
            is_connected: true,
            timestamp: Some(Utc::now()),
            original_default_gateway: Some(original_gateway),
            original_default_interface_index: Some(original_if_index),
            original_dns_settings,
            added_routes: Vec::new(),
        };
        self.journal.save(&journal_doc)?;

        // Step 8: start pingtunnel-client and wait for its SOCKS5 port.
        let (process_supervisor, mut process_events) = ProcessSupervisor::new(Arc::clone(&self.os), self.resource_dir.clone());
        let process_supervisor = Arc::new(process_supervisor);
        *self.partial_process_supervisor.lock().unwrap() = Some(Arc::clone(&process_supervisor));
        process_supervisor.kill_orphans()?;

        process_supervisor.start_tunnel_client(
            &configuration.server_address,
            configuration.local_socks_port,
            &configuration.server_key,
            &settings,
        )?;
        if !wait_for_tcp_port(configuration.local_socks_port, SOCKS_PORT_TIMEOUT).await {
            return Err(Error::SocksPortTimeout);
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        // Step 9: start tun2socks, wait for the TUN interface.
        process_supervisor.start_router(configuration.local_socks_port, settings.mtu)?;
        let tun_if_index = self
            .blocking_os(|os| os.resolve_interface_index("wintun", TUN_APPEARANCE_TIMEOUT))
            .await?
            .ok_or(Error::TunInterfaceMissing)?;

        // Step 10: static TUN addressing.
        self.blocking_os(move |os| os.set_interface_address(tun_if_index, routes::TUN_ADDRESS, routes::TUN_PREFIX))
            .await?;

        // Step 11: pin the tunnel carrier's own traffic to the physical path.
        self.add_and_journal(&mut journal_doc, routes::host_route(server_ip, original_gateway, original_if_index))
            .await?;

        // Step 12: bypass subnets, plus explicit loopback.
        for route in routes::bypass_routes(&settings.bypass_subnets, original_gateway, original_if_index) {
            self.add_and_journal(&mut journal_doc, route).await?;
        }

        // Step 13: prefer the TUN interface.
        self.blocking_os(move |os| os.set_interface_metric(tun_if_index, 1)).await?;

        // Step 14: blackhole broadcast/multicast/link-local destinations.
        for route in routes::blackhole_routes(original_gateway, original_if_index) {
            self.add_and_journal(&mut journal_doc, route).await?;
        }

        // Step 15: the tunnel becomes the default route.
        self.add_and_journal(&mut journal_doc, routes::default_tunnel_route(tun_if_index)).await?;

        // Step 16: firewall.
        self.blocking_os(|os| os.add_block_outbound_udp(Ipv4Addr::new(198, 18, 0, 0), 24)).await?;
        self.blocking_os(|os| os.add_allow_outbound_udp(Ipv4Addr::new(127, 0, 0, 1))).await?;

        // Step 17: DNS forwarder.
        let mut dns_forwarder = None;
        if settings.dns_mode == pingtunnel_types::config::DnsMode::Tunnel {
            let (forwarder, _stats_rx) = DnsForwarder::start(settings.dns_servers.clone(), configuration.local_socks_port).await?;
            let adapters = self.blocking_os(|os| os.list_active_adapters()).await?;
            for adapter in adapters {
                if let Err(e) = self
                    .blocking_os({
                        let description = adapter.description.clone();
                        move |os| os.set_dns(&description, &[Ipv4Addr::new(127, 0, 0, 1)])
                    })
                    .await
                {
                    log::warn!("failed to point adapter {} at the DNS forwarder: {}", adapter.description, e);
                }
            }
            self.blocking_os(|os| os.flush_resolver_cache()).await?;
            dns_forwarder = Some(forwarder);
        }

        // Step 18: arm Health Monitor and Traffic Poller.
        {
            let mut stats = self.stats.lock().unwrap();
            *stats = ConnectionStats {
                connected_at: Some(Utc::now()),
                ..ConnectionStats::default()
            };
        }
        let is_restarting = Arc::new(AtomicBool::new(false));
        let health_monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&process_supervisor),
            settings.clone(),
            configuration.local_socks_port,
            Arc::clone(&is_restarting),
        ));
        health_monitor.reset_restart_budget();
        let (traffic_poller, _traffic_rx) = TrafficPoller::new(Arc::clone(&self.os), tun_if_index, original_if_index, Arc::clone(&self.stats));
        let traffic_poller = Arc::new(traffic_poller);

        // The State Machine drains its own copy of process events only to
        // keep the receiver from lagging; exit handling lives in
        // `arm_session`'s dedicated subscription.
        tokio::spawn(async move { while process_events.recv().await.is_ok() {} });

        let local_socks_port = configuration.local_socks_port;
        Ok(Session {
            process_supervisor,
            health_monitor,
            traffic_poller,
            dns_forwarder,
            is_restarting,
            configuration,
            settings,
            local_socks_port,
            background_tasks: Vec::new(),
        })
    }

    async fn add_and_journal(&self, journal_doc: &mut JournalDocument, route: RouteSpec) -> Result<(), Error> {
        self.blocking_os(move |os| os.add_route(route)).await?;
        journal_doc.added_routes.push(pingtunnel_types::journal::RouteEntry {
            destination: route.destination,
            prefix_length: route.prefix_length,
            gateway: route.gateway,
            interface_index: route.interface_index,
            metric: route.metric,
        });
        self.journal.save(journal_doc)
    }

    async fn cleanup_after_failed_connect(&self) {
        if let Some(ps) = self.partial_process_supervisor.lock().unwrap().take() {
            if let Err(e) = ps.stop_all() {
                log::warn!("cleanup after failed connect: failed to stop helper processes: {}", e);
            }
        }
        let os = Arc::clone(&self.os);
        let journal = Arc::clone(&self.journal);
        let resource_dir = self.resource_dir.clone();
        let result = tokio::task::spawn_blocking(move || journal.recover(os.as_ref(), &resource_dir)).await;
        if let Ok(Err(e)) = result {
            log::warn!("cleanup after failed connect: recovery sweep failed: {}", e);
        }
    }

    /// `disconnect()` is legal from any state except itself and
    /// `Disconnecting`.
    pub async fn disconnect(self: &Arc<Self>) -> Result<(), Error> {
        let _guard = self.transition_lock.lock().await;
        let from = self.state();
        if matches!(from, ConnectionState::Disconnected | ConnectionState::Disconnecting) {
            return Err(Error::AlreadyInState { from, action: "disconnect".to_string() });
        }
        self.set_state(ConnectionState::Disconnecting, "disconnecting".to_string(), None);

        if let Some(session) = self.session.lock().unwrap().take() {
            self.run_disconnect_sequence(session).await;
        }

        self.set_state(ConnectionState::Disconnected, "disconnected".to_string(), None);
        Ok(())
    }

    /// Every step is independently guarded; one failing step never
    /// prevents the next.
    async fn run_disconnect_sequence(&self, session: Session) {
        session.traffic_poller.shutdown();
        session.health_monitor.shutdown();
        if let Some(dns_forwarder) = &session.dns_forwarder {
            dns_forwarder.shutdown();
        }

        if let Some(doc) = self.journal.load().unwrap_or(None) {
            for (adapter, servers) in &doc.original_dns_settings {
                let result = if servers.is_empty() {
                    self.blocking_os({
                        let adapter = adapter.clone();
                        move |os| os.reset_dns_to_dhcp(&adapter)
                    })
                    .await
                } else {
                    self.blocking_os({
                        let adapter = adapter.clone();
                        let servers = servers.clone();
                        move |os| os.set_dns(&adapter, &servers)
                    })
                    .await
                };
                if let Err(e) = result {
                    log::warn!("disconnect: failed to restore DNS for {}: {}", adapter, e);
                }
            }

            if let Err(e) = self.blocking_os(|os| os.flush_resolver_cache()).await {
                log::warn!("disconnect: failed to flush resolver cache: {}", e);
            }

            for route in &doc.added_routes {
                let destination = route.destination;
                let prefix_length = route.prefix_length;
                let gateway = route.gateway;
                if let Err(e) = self.blocking_os(move |os| os.delete_route(destination, prefix_length, gateway)).await {
                    log::warn!("disconnect: failed to delete route {:?}: {}", route, e);
                }
            }
        }

        match self.blocking_os(|os| os.list_rules_with_prefix("PingTunnelVPN_BlockUDP_")).await {
            Ok(rules) => {
                for name in rules {
                    let name_for_log = name.clone();
                    if let Err(e) = self.blocking_os(move |os| os.remove_rule(&name)).await {
                        log::warn!("disconnect: failed to remove firewall rule {}: {}", name_for_log, e);
                    }
                }
            }
            Err(e) => log::warn!("disconnect: failed to list owned firewall rules: {}", e),
        }

        if let Err(e) = session.process_supervisor.stop_all() {
            log::warn!("disconnect: failed to stop helper processes: {}", e);
        }

        if let Err(e) = self.journal.clear() {
            log::warn!("disconnect: failed to clear recovery journal: {}", e);
        }
    }

    async fn perform_fast_restart(self: &Arc<Self>) {
        let extracted = {
            let guard = self.session.lock().unwrap();
            guard.as_ref().map(|session| {
                (
                    Arc::clone(&session.process_supervisor),
                    Arc::clone(&session.is_restarting),
                    Arc::clone(&session.health_monitor),
                    session.configuration.clone(),
                    session.settings.clone(),
                    session.local_socks_port,
                )
            })
        };
        let Some((process_supervisor, is_restarting, health_monitor, configuration, settings, local_socks_port)) = extracted else {
            return;
        };

        is_restarting.store(true, Ordering::SeqCst);
        let result = fast_restart_sequence(&process_supervisor, &configuration, &settings, local_socks_port).await;
        is_restarting.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => health_monitor.reset_latency(),
            Err(e) => {
                log::warn!("fast restart failed, falling through to full disconnect: {}", e);
                let _ = self.disconnect().await;
            }
        }
    }

    /// Disconnects (if connected), then connects the newly selected
    /// configuration; restores the previous selection on failure.
    pub async fn switch_config(self: &Arc<Self>, new_config_id: Uuid) -> Result<(), Error> {
        let previous = self.config_store.selected();
        if self.state() == ConnectionState::Connected {
            self.disconnect().await?;
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        self.config_store.select(new_config_id)?;
        if let Err(e) = self.connect().await {
            if let Some(previous) = previous {
                let _ = self.config_store.select(previous.id);
            }
            return Err(e);
        }
        Ok(())
    }
}

async fn fast_restart_sequence(
    process_supervisor: &ProcessSupervisor,
    configuration: &VpnConfiguration,
    settings: &GlobalSettings,
    local_socks_port: u16,
) -> Result<(), Error> {
    process_supervisor.stop(HelperProcessName::Tun2Socks)?;
    process_supervisor.stop(HelperProcessName::PingTunnelClient)?;
    tokio::time::sleep(Duration::from_secs(1)).await;

    process_supervisor.start_tunnel_client(&configuration.server_address, local_socks_port, &configuration.server_key, settings)?;
    if !wait_for_tcp_port(local_socks_port, FAST_RESTART_SOCKS_TIMEOUT).await {
        return Err(Error::SocksPortTimeout);
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    process_supervisor.start_router(local_socks_port, settings.mtu)?;
    tokio::time::sleep(Duration::from_secs(1)).await;
    Ok(())
}

async fn wait_for_tcp_port(port: u16, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

async fn resolve_first_ipv4(host_or_ip: &str) -> Result<Ipv4Addr, Error> {
    let target = format!("{}:0", host_or_ip);
    let addrs = tokio::net::lookup_host(&target)
        .await
        .map_err(|_| Error::DnsResolutionFailed(host_or_ip.to_string()))?;
    addrs
        .filter_map(|addr| match addr.ip() {
            std::net::IpAddr::V4(ip) => Some(ip),
            _ => None,
        })
        .next()
        .ok_or_else(|| Error::DnsResolutionFailed(host_or_ip.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_store::ConfigStore;
    use crate::os::fake::FakeOs;

    fn supervisor() -> (Arc<ConnectionSupervisor>, tokio::sync::mpsc::UnboundedReceiver<StateChangeEvent>) {
        let dir = tempfile::tempdir().unwrap();
        let os: Arc<dyn OsBindings> = Arc::new(FakeOs::new());
        let config_store = Arc::new(
            ConfigStore::load(dir.path().join("configs.json"), dir.path().join("global-settings.json")).unwrap(),
        );
        let journal = Arc::new(RecoveryJournal::new(dir.path().join("state.json")));
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let supervisor = Arc::new(ConnectionSupervisor::new(os, dir.path().to_path_buf(), config_store, journal, Box::new(tx)));
        (supervisor, rx)
    }

    #[tokio::test]
    async fn new_supervisor_starts_disconnected() {
        let (supervisor, _rx) = supervisor();
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_from_disconnected_is_rejected() {
        let (supervisor, _rx) = supervisor();
        let err = supervisor.disconnect().await.unwrap_err();
        assert!(matches!(err, Error::AlreadyInState { from: ConnectionState::Disconnected, .. }));
    }

    #[tokio::test]
    async fn acknowledge_error_requires_error_state() {
        let (supervisor, _rx) = supervisor();
        let err = supervisor.acknowledge_error().unwrap_err();
        assert!(matches!(err, Error::AlreadyInState { from: ConnectionState::Disconnected, .. }));
    }

    #[tokio::test]
    async fn connect_without_a_selected_configuration_enters_error_state() {
        let (supervisor, mut rx) = supervisor();
        let err = supervisor.connect().await.unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
        assert_eq!(supervisor.state(), ConnectionState::Error);

        // Once surfaced, the diagram's Error -> Disconnected ack is legal
        // and connect() from Error is legal too, on the next attempt.
        supervisor.acknowledge_error().unwrap();
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);

        let connecting = rx.recv().await.unwrap();
        assert_eq!(connecting.to, ConnectionState::Connecting);
        let errored = rx.recv().await.unwrap();
        assert_eq!(errored.to, ConnectionState::Error);
        let acked = rx.recv().await.unwrap();
        assert_eq!(acked.to, ConnectionState::Disconnected);
    }
}
