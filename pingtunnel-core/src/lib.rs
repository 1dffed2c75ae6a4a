//! The PingTunnel VPN Connection Supervisor.
//!
//! This crate drives the strict connection state machine described by the
//! product spec: it spawns and monitors the two tunnel helper processes,
//! mutates system state (routing table, per-adapter DNS, firewall, TUN
//! addressing, interface metric) in a carefully ordered sequence with
//! recorded inverses, runs an in-process DNS forwarder, performs health
//! monitoring with a bounded fast-restart policy, and implements crash
//! recovery.

pub mod atomic;
pub mod cancel;
pub mod config_store;
pub mod dns;
pub mod health;
pub mod journal;
pub mod mpsc;
pub mod os;
pub mod paths;
pub mod process;
pub mod state_machine;
pub mod traffic;

pub use pingtunnel_types::error::Error;

pub type Result<T> = std::result::Result<T, Error>;
