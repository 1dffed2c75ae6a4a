//! Shared data model for the PingTunnel VPN connection supervisor.
//!
//! This crate holds no I/O of its own. It defines the persisted and
//! in-memory shapes that `pingtunnel-core` operates on, and the error
//! kinds the supervisor boundary reports to its callers.

pub mod config;
pub mod error;
pub mod journal;
pub mod state;

pub use config::{GlobalSettings, ServerConfig, VpnConfiguration};
pub use error::Error;
pub use journal::RecoveryJournal;
pub use state::{ConnectionState, ConnectionStats};
