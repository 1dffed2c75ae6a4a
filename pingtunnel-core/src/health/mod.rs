//! Health Monitor (C5): periodic liveness and latency sampling that
//! drives the bounded, cooldown-gated fast-restart policy.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use pingtunnel_types::config::GlobalSettings;
use pingtunnel_types::error::HelperProcessName;
use regex::Regex;
use tokio::net::TcpStream;

use crate::cancel::CancellationToken;
use crate::process::{ProcessEvent, ProcessSupervisor};

const TICK: Duration = Duration::from_secs(5);
const SOCKS_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

static PONG_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"pong from (\d+\.\d+\.\d+\.\d+) (\d+(?:\.\d+)?)(ms|s)").unwrap());

/// What the Health Monitor asks the Connection State Machine to do;
/// delivered on an unbounded channel so the monitor's own task never
/// blocks on the state machine's mutex.
#[derive(Debug, Clone)]
pub enum HealthAction {
    FastRestart,
    Disconnect,
    FatalDisconnect { message: String },
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LatencySnapshot {
    pub current_ms: Option<f64>,
    pub consecutive_high_latency: u32,
}

struct LatencyState {
    current_ms: Option<f64>,
    consecutive_high_latency: u32,
}

pub struct HealthMonitor {
    supervisor: Arc<ProcessSupervisor>,
    settings: GlobalSettings,
    local_socks_port: u16,
    latency: Mutex<LatencyState>,
    restart_count: AtomicU32,
    last_restart: Mutex<Option<Instant>>,
    is_restarting: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl HealthMonitor {
    pub fn new(
        supervisor: Arc<ProcessSupervisor>,
        settings: GlobalSettings,
        local_socks_port: u16,
        is_restarting: Arc<AtomicBool>,
    ) -> Self {
        HealthMonitor {
            supervisor,
            settings,
            local_socks_port,
            latency: Mutex::new(LatencyState {
                current_ms: None,
                consecutive_high_latency: 0,
            }),
            restart_count: AtomicU32::new(0),
            last_restart: Mutex::new(None),
            is_restarting,
            cancel: CancellationToken::new(),
        }
    }

    pub fn latency_snapshot(&self) -> LatencySnapshot {
        let latency = self.latency.lock().unwrap();
        LatencySnapshot {
            current_ms: latency.current_ms,
            consecutive_high_latency: latency.consecutive_high_latency,
        }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Clears accumulated latency bookkeeping; called after a successful
    /// fast restart so a stale high-latency streak doesn't immediately
    /// trigger another one.
    pub fn reset_latency(&self) {
        let mut latency = self.latency.lock().unwrap();
        latency.current_ms = None;
        latency.consecutive_high_latency = 0;
    }

    /// Called once per `Connected` span, immediately before arming the
    /// monitor, so a restart budget does not leak across sessions.
    pub fn reset_restart_budget(&self) {
        self.restart_count.store(0, Ordering::SeqCst);
        *self.last_restart.lock().unwrap() = None;
    }

    /// Runs until cancelled: a 5s-cadence health check loop and a
    /// concurrent ingestion of captured helper output lines for latency
    /// parsing. Emits [`HealthAction`]s on `action_tx`.
    pub async fn run(self: Arc<Self>, action_tx: tokio::sync::mpsc::UnboundedSender<HealthAction>) {
        let mut lines = self.supervisor.subscribe();
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tick.tick() => {
                    if let Some(action) = self.check_iteration().await {
                        if action_tx.send(action).is_err() {
                            break;
                        }
                    }
                }
                event = lines.recv() => {
                    match event {
                        Ok(ProcessEvent::LineReceived { name: HelperProcessName::PingTunnelClient, line }) => {
                            self.ingest_line(&line);
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    }

    /// Parses a captured `pingtunnel-client` line for `pong from <ipv4>
    /// <value><ms|s>` and updates latency bookkeeping.
    pub fn ingest_line(&self, line: &str) {
        let captures = match PONG_LINE.captures(line) {
            Some(c) => c,
            None => return,
        };
        let _ip: Ipv4Addr = match captures[1].parse() {
            Ok(ip) => ip,
            Err(_) => return,
        };
        let value: f64 = match captures[2].parse() {
            Ok(v) => v,
            Err(_) => return,
        };
        let unit = &captures[3];
        let latency_ms = if unit == "s" { value * 1000.0 } else { value };

        let threshold = self.settings.latency_threshold_ms as f64;
        let mut latency = self.latency.lock().unwrap();
        latency.current_ms = Some(latency_ms);

        if latency_ms >= threshold {
            log::warn!("DNS/tunnel latency {}ms exceeds threshold {}ms", latency_ms, threshold);
        }
        if latency_ms >= 0.5 * threshold {
            latency.consecutive_high_latency += 1;
        } else {
            latency.consecutive_high_latency = 0;
        }
    }

    /// Run once per tick: checks both helpers are still alive, probes the
    /// local SOCKS port, then checks whether latency has stayed above
    /// threshold long enough to act on.
    async fn check_iteration(&self) -> Option<HealthAction> {
        if self.is_restarting.load(Ordering::SeqCst) {
            return None;
        }

        if !self.supervisor.is_alive(HelperProcessName::PingTunnelClient)
            || !self.supervisor.is_alive(HelperProcessName::Tun2Socks)
        {
            return Some(self.request_restart_or_disconnect(false));
        }

        if !self.probe_socks_port().await {
            return Some(self.request_restart_or_disconnect(false));
        }

        let high_latency_count = self.latency.lock().unwrap().consecutive_high_latency;
        if high_latency_count >= self.settings.high_latency_count_threshold {
            return Some(self.request_restart_or_disconnect(true));
        }

        None
    }

    fn request_restart_or_disconnect(&self, fatal_on_exhaustion: bool) -> HealthAction {
        if self.try_consume_restart_budget() {
            HealthAction::FastRestart
        } else if fatal_on_exhaustion {
            HealthAction::FatalDisconnect {
                message: "latency remained above threshold with no restart budget remaining".to_string(),
            }
        } else {
            HealthAction::Disconnect
        }
    }

    /// A restart is permitted only if the budget is not exhausted and the
    /// cooldown has elapsed. On success, records the attempt.
    fn try_consume_restart_budget(&self) -> bool {
        let count = self.restart_count.load(Ordering::SeqCst);
        let budget_ok = self.settings.max_auto_restarts == 0 || count < self.settings.max_auto_restarts;
        if !budget_ok {
            return false;
        }

        let mut last_restart = self.last_restart.lock().unwrap();
        let cooldown_ok = match *last_restart {
            Some(last) => last.elapsed() >= Duration::from_secs(self.settings.restart_cooldown_seconds),
            None => true,
        };
        if !cooldown_ok {
            return false;
        }

        self.restart_count.fetch_add(1, Ordering::SeqCst);
        *last_restart = Some(Instant::now());
        true
    }

    async fn probe_socks_port(&self) -> bool {
        tokio::time::timeout(SOCKS_PROBE_TIMEOUT, TcpStream::connect(("127.0.0.1", self.local_socks_port)))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pingtunnel_types::config::{DnsMode, EncryptionMode};

    fn settings() -> GlobalSettings {
        GlobalSettings {
            mtu: 1420,
            dns_mode: DnsMode::Tunnel,
            dns_servers: vec![Ipv4Addr::new(1, 1, 1, 1)],
            bypass_subnets: Vec::new(),
            encryption_mode: EncryptionMode::None,
            encryption_key: None,
            latency_threshold_ms: 1000,
            high_latency_count_threshold: 5,
            restart_cooldown_seconds: 30,
            max_auto_restarts: 3,
        }
    }

    fn monitor() -> HealthMonitor {
        monitor_with(settings())
    }

    fn monitor_with(settings: GlobalSettings) -> HealthMonitor {
        let os: Arc<dyn crate::os::OsBindings> = Arc::new(crate::os::fake::FakeOs::new());
        let (supervisor, _rx) = ProcessSupervisor::new(os, std::path::PathBuf::from("."));
        HealthMonitor::new(Arc::new(supervisor), settings, 1080, Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn ingest_line_parses_milliseconds() {
        let monitor = monitor();
        monitor.ingest_line("pong from 1.2.3.4 123ms");
        assert_eq!(monitor.latency_snapshot().current_ms, Some(123.0));
    }

    #[test]
    fn ingest_line_normalizes_seconds_to_milliseconds() {
        let monitor = monitor();
        monitor.ingest_line("pong from 1.2.3.4 1.5s");
        assert_eq!(monitor.latency_snapshot().current_ms, Some(1500.0));
    }

    #[test]
    fn ingest_line_ignores_unrelated_lines() {
        let monitor = monitor();
        monitor.ingest_line("some other log line");
        assert_eq!(monitor.latency_snapshot().current_ms, None);
    }

    #[test]
    fn high_latency_count_increments_above_half_threshold_and_resets_below() {
        let monitor = monitor();
        monitor.ingest_line("pong from 1.2.3.4 600ms"); // >= 0.5 * 1000
        monitor.ingest_line("pong from 1.2.3.4 600ms");
        assert_eq!(monitor.latency_snapshot().consecutive_high_latency, 2);

        monitor.ingest_line("pong from 1.2.3.4 100ms"); // below 0.5 * 1000
        assert_eq!(monitor.latency_snapshot().consecutive_high_latency, 0);
    }

    #[test]
    fn restart_budget_is_exhausted_after_max_auto_restarts() {
        let monitor = monitor();
        assert!(monitor.try_consume_restart_budget());
        // Cooldown blocks an immediate second restart even within budget.
        assert!(!monitor.try_consume_restart_budget());
    }

    #[test]
    fn restart_budget_unlimited_when_zero_ignores_the_count_but_not_cooldown() {
        let mut s = settings();
        s.max_auto_restarts = 0;
        s.restart_cooldown_seconds = 0;
        let monitor = monitor_with(s);
        for _ in 0..5 {
            assert!(monitor.try_consume_restart_budget());
        }
    }
}
