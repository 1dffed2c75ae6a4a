//! Process Supervisor (C2): launches, observes, and terminates the two
//! helper executables, dispatching captured output and exit events on an
//! unbounded channel the Connection State Machine drains.
//!
//! Resolves the cyclic dependency noted in the design notes ("State
//! Machine starts and stops processes; the Supervisor's `exited` event
//! must reach the State Machine") with one-way message passing: this type
//! never holds a reference back to the state machine.

use std::collections::HashMap;
use std::fmt;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pingtunnel_types::config::{EncryptionMode, GlobalSettings};
use pingtunnel_types::error::HelperProcessName;
use pingtunnel_types::Error;

use crate::os::{ChildProcess, OsBindings};

/// Emitted for every captured output line and every helper exit. Consumed
/// by the State Machine (exit) and the Health Monitor (latency parsing).
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    LineReceived { name: HelperProcessName, line: String },
    Exited { name: HelperProcessName, code: Option<i32> },
}

/// Wraps a secret so it is never accidentally formatted into a log line;
/// only [`Redacted::reveal`] exposes the real value, for building the
/// actual argv passed to `Command`.
pub struct Redacted<'a>(&'a str);

impl<'a> Redacted<'a> {
    pub fn new(value: &'a str) -> Self {
        Redacted(value)
    }

    pub fn reveal(&self) -> &'a str {
        self.0
    }
}

impl fmt::Display for Redacted<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "")
        } else {
            write!(f, "****")
        }
    }
}

fn client_argv(local_port: u16, server: &str, token: &str, settings: &GlobalSettings) -> Vec<String> {
    let mut args = vec![
        "-type".to_string(),
        "client".to_string(),
        "-l".to_string(),
        format!(":{}", local_port),
        "-s".to_string(),
        server.to_string(),
        "-sock5".to_string(),
        "1".to_string(),
    ];
    if !token.is_empty() {
        args.push("-key".to_string());
        args.push(token.to_string());
    }
    if settings.encryption_mode != EncryptionMode::None {
        let mode = match settings.encryption_mode {
            EncryptionMode::None => unreachable!(),
            EncryptionMode::Aes128 => "aes128",
            EncryptionMode::Aes256 => "aes256",
            EncryptionMode::Chacha20 => "chacha20",
        };
        args.push("-encrypt".to_string());
        args.push(mode.to_string());
        if let Some(key) = &settings.encryption_key {
            args.push("-encrypt-key".to_string());
            args.push(key.clone());
        }
    }
    args.push("-loglevel".to_string());
    args.push("info".to_string());
    args
}

/// The same argv, but with the token and encryption key redacted, for
/// logging only: secrets never reach a log line, even one that exists
/// purely to show what was launched.
fn client_argv_for_log(local_port: u16, server: &str, token: &str, settings: &GlobalSettings) -> String {
    let mut settings_for_log = settings.clone();
    settings_for_log.encryption_key = settings.encryption_key.as_ref().map(|_| "****".to_string());
    client_argv(local_port, server, &Redacted::new(token).to_string(), &settings_for_log).join(" ")
}

fn router_argv(socks_port: u16, mtu: u16) -> Vec<String> {
    vec![
        "-device".to_string(),
        "wintun".to_string(),
        "-proxy".to_string(),
        format!("socks5://127.0.0.1:{}", socks_port),
        "-mtu".to_string(),
        mtu.to_string(),
        "-loglevel".to_string(),
        "info".to_string(),
    ]
}

struct Supervised {
    child: Arc<Mutex<Box<dyn ChildProcess>>>,
}

/// Capacity of the broadcast channel backing [`ProcessEvent`] delivery.
/// Both the State Machine (exit events) and the Health Monitor (latency
/// lines) subscribe independently.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub struct ProcessSupervisor {
    os: Arc<dyn OsBindings>,
    resource_dir: PathBuf,
    children: Mutex<HashMap<HelperProcessName, Supervised>>,
    events_tx: tokio::sync::broadcast::Sender<ProcessEvent>,
}

impl ProcessSupervisor {
    pub fn new(
        os: Arc<dyn OsBindings>,
        resource_dir: PathBuf,
    ) -> (Self, tokio::sync::broadcast::Receiver<ProcessEvent>) {
        let (tx, rx) = tokio::sync::broadcast::channel(EVENT_CHANNEL_CAPACITY);
        (
            ProcessSupervisor {
                os,
                resource_dir,
                children: Mutex::new(HashMap::new()),
                events_tx: tx,
            },
            rx,
        )
    }

    /// An additional, independent subscription to process events — used
    /// by the Health Monitor alongside the State Machine's own receiver.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ProcessEvent> {
        self.events_tx.subscribe()
    }

    fn executable_path(&self, name: HelperProcessName) -> PathBuf {
        self.resource_dir.join(format!("{}.exe", name.as_str()))
    }

    /// Kills any previously running instance of either helper whose image
    /// path lies inside `resource_dir`, left over from an unclean shutdown.
    pub fn kill_orphans(&self) -> Result<(), Error> {
        for name in [HelperProcessName::PingTunnelClient, HelperProcessName::Tun2Socks] {
            for pid in self.os.find_orphaned_helper_processes(name, &self.resource_dir)? {
                log::warn!("killing orphaned {} process (pid {})", name, pid);
                if let Err(e) = self.os.kill_process_by_pid(pid) {
                    log::warn!("failed to kill orphaned {} (pid {}): {}", name, pid, e);
                }
            }
        }
        Ok(())
    }

    pub fn start_tunnel_client(&self, server: &str, local_port: u16, token: &str, settings: &GlobalSettings) -> Result<(), Error> {
        log::info!(
            "starting pingtunnel-client: {}",
            client_argv_for_log(local_port, server, token, settings)
        );
        let args = client_argv(local_port, server, token, settings);
        self.spawn(HelperProcessName::PingTunnelClient, &args)
    }

    pub fn start_router(&self, socks_port: u16, mtu: u16) -> Result<(), Error> {
        let args = router_argv(socks_port, mtu);
        log::info!("starting tun2socks: {}", args.join(" "));
        self.spawn(HelperProcessName::Tun2Socks, &args)
    }

    fn spawn(&self, name: HelperProcessName, args: &[String]) -> Result<(), Error> {
        let executable = self.executable_path(name);
        if !executable.exists() {
            return Err(Error::MissingBinary(executable));
        }
        let mut child = self.os.spawn_process(&executable, args)?;

        let stdout = child.take_stdout();
        let stderr = child.take_stderr();
        let child = Arc::new(Mutex::new(child));

        if let Some(stdout) = stdout {
            spawn_line_reader(name, stdout, self.events_tx.clone());
        }
        if let Some(stderr) = stderr {
            spawn_line_reader(name, stderr, self.events_tx.clone());
        }
        spawn_exit_watcher(name, Arc::clone(&child), self.events_tx.clone());

        self.children.lock().unwrap().insert(name, Supervised { child });
        Ok(())
    }

    /// Tree-kills the router first, then the client, waiting up to 5s
    /// each.
    pub fn stop_all(&self) -> Result<(), Error> {
        for name in [HelperProcessName::Tun2Socks, HelperProcessName::PingTunnelClient] {
            self.stop(name)?;
        }
        Ok(())
    }

    pub fn stop(&self, name: HelperProcessName) -> Result<(), Error> {
        let supervised = self.children.lock().unwrap().remove(&name);
        if let Some(supervised) = supervised {
            let mut child = supervised.child.lock().unwrap();
            self.os.terminate_process_tree(child.as_mut(), Duration::from_secs(5))?;
        }
        Ok(())
    }

    pub fn is_alive(&self, name: HelperProcessName) -> bool {
        let children = self.children.lock().unwrap();
        match children.get(&name) {
            Some(supervised) => {
                let mut child = supervised.child.lock().unwrap();
                matches!(child.try_wait(), Ok(None))
            }
            None => false,
        }
    }
}

/// Log target a captured helper line is re-emitted under.
fn log_target(name: HelperProcessName) -> &'static str {
    match name {
        HelperProcessName::PingTunnelClient => "helper::pingtunnel",
        HelperProcessName::Tun2Socks => "helper::tun2socks",
    }
}

/// Captured lines carry no level of their own; classify by content so an
/// upstream "error opening device" surfaces above routine chatter.
fn classify_level(line: &str) -> log::Level {
    let lower = line.to_ascii_lowercase();
    if lower.contains("error") || lower.contains("fatal") {
        log::Level::Error
    } else if lower.contains("warn") {
        log::Level::Warn
    } else {
        log::Level::Info
    }
}

fn spawn_line_reader(
    name: HelperProcessName,
    reader: Box<dyn Read + Send>,
    events_tx: tokio::sync::broadcast::Sender<ProcessEvent>,
) {
    tokio::task::spawn_blocking(move || {
        let target = log_target(name);
        let buffered = BufReader::new(reader);
        for line in buffered.lines() {
            match line {
                Ok(line) => {
                    log::log!(target: target, classify_level(&line), "{}", line);
                    // A send error here only means no one is currently
                    // subscribed; the reader keeps draining the pipe so
                    // the child process never blocks on a full buffer.
                    let _ = events_tx.send(ProcessEvent::LineReceived { name, line });
                }
                Err(_) => break,
            }
        }
    });
}

fn spawn_exit_watcher(
    name: HelperProcessName,
    child: Arc<Mutex<Box<dyn ChildProcess>>>,
    events_tx: tokio::sync::broadcast::Sender<ProcessEvent>,
) {
    tokio::task::spawn_blocking(move || loop {
        let code = {
            let mut child = child.lock().unwrap();
            child.try_wait()
        };
        match code {
            Ok(Some(code)) => {
                let _ = events_tx.send(ProcessEvent::Exited { name, code });
                break;
            }
            Ok(None) => std::thread::sleep(Duration::from_millis(250)),
            Err(_) => break,
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use pingtunnel_types::config::DnsMode;
    use std::net::Ipv4Addr;

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

    #[test]
    fn client_argv_contains_required_flags_in_order() {
        let args = client_argv(1080, "tunnel.example.net", "s3cret", &settings());
        assert_eq!(
            args,
            vec![
                "-type", "client", "-l", ":1080", "-s", "tunnel.example.net", "-sock5", "1", "-key", "s3cret",
                "-loglevel", "info",
            ]
        );
    }

    #[test]
    fn client_argv_for_log_redacts_token() {
        let rendered = client_argv_for_log(1080, "tunnel.example.net", "s3cret", &settings());
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("****"));
    }

    #[test]
    fn client_argv_includes_encryption_when_configured() {
        let mut s = settings();
        s.encryption_mode = EncryptionMode::Aes256;
        s.encryption_key = Some("enckey".to_string());
        let args = client_argv(1080, "tunnel.example.net", "s3cret", &s);
        assert!(args.windows(2).any(|w| w == ["-encrypt", "aes256"]));
        assert!(args.windows(2).any(|w| w == ["-encrypt-key", "enckey"]));
    }

    #[test]
    fn router_argv_matches_external_interface_contract() {
        let args = router_argv(1080, 1420);
        assert_eq!(
            args,
            vec!["-device", "wintun", "-proxy", "socks5://127.0.0.1:1080", "-mtu", "1420", "-loglevel", "info"]
        );
    }

    #[test]
    fn classify_level_flags_error_and_warn_keywords() {
        assert_eq!(classify_level("connection established"), log::Level::Info);
        assert_eq!(classify_level("WARN: retrying handshake"), log::Level::Warn);
        assert_eq!(classify_level("error opening device"), log::Level::Error);
    }

    #[test]
    fn log_target_names_match_the_helper_binaries() {
        assert_eq!(log_target(HelperProcessName::PingTunnelClient), "helper::pingtunnel");
        assert_eq!(log_target(HelperProcessName::Tun2Socks), "helper::tun2socks");
    }

    #[test]
    fn is_alive_is_false_for_unknown_process() {
        let os: Arc<dyn OsBindings> = Arc::new(crate::os::fake::FakeOs::new());
        let (supervisor, _rx) = ProcessSupervisor::new(os, PathBuf::from("."));
        assert!(!supervisor.is_alive(HelperProcessName::PingTunnelClient));
    }
}
