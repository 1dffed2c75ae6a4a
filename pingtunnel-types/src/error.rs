use std::net::Ipv4Addr;
use std::path::PathBuf;

use crate::state::ConnectionState;

/// Errors reported across the Connection Supervisor boundary.
///
/// Every variant here is something a caller can reasonably branch on or
/// surface to a user; precondition violations that indicate a programming
/// defect are represented by [`Error::AlreadyInState`] rather than a panic,
/// per the propagation policy in the design notes.
#[derive(err_derive::Error, Debug, Clone)]
pub enum Error {
    /// The process does not hold administrative privileges.
    #[error(display = "the process is not running elevated")]
    NotElevated,

    /// A required helper binary is missing from the resource directory.
    #[error(display = "required binary not found: {:?}", _0)]
    MissingBinary(PathBuf),

    /// The configured server host did not resolve to any IPv4 address.
    #[error(display = "failed to resolve server host: {}", _0)]
    DnsResolutionFailed(String),

    /// No default route could be found on the host.
    #[error(display = "no default gateway could be determined")]
    DefaultGatewayUnknown,

    /// The local SOCKS5 listener never came up in time.
    #[error(display = "SOCKS proxy did not start in time")]
    SocksPortTimeout,

    /// The TUN interface never appeared in time.
    #[error(display = "TUN interface did not appear in time")]
    TunInterfaceMissing,

    /// A supervised helper process exited unexpectedly.
    #[error(display = "helper process {} exited with code {:?}", name, code)]
    HelperProcessExited { name: String, code: Option<i32> },

    /// The SOCKS5 handshake with the local proxy failed.
    #[error(display = "SOCKS5 handshake failed: {}", _0)]
    SocksHandshakeFailed(String),

    /// A low-level OS binding call failed.
    #[error(display = "OS operation '{}' failed with code {}", op, code)]
    OsError { op: String, code: i64 },

    /// The supplied configuration failed validation.
    #[error(display = "invalid configuration: {}", "_0.join(\"; \")")]
    ConfigInvalid(Vec<String>),

    /// The requested action is not legal from the current state.
    #[error(display = "cannot {} while in state {:?}", action, from)]
    AlreadyInState {
        from: ConnectionState,
        action: String,
    },
}

impl Error {
    pub fn os(op: impl Into<String>, code: i64) -> Self {
        Error::OsError {
            op: op.into(),
            code,
        }
    }
}

/// Distinguishes the two supervised helper executables by identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum HelperProcessName {
    #[serde(rename = "pingtunnel-client")]
    PingTunnelClient,
    #[serde(rename = "tun2socks")]
    Tun2Socks,
}

impl HelperProcessName {
    pub fn as_str(&self) -> &'static str {
        match self {
            HelperProcessName::PingTunnelClient => "pingtunnel-client",
            HelperProcessName::Tun2Socks => "tun2socks",
        }
    }
}

impl std::fmt::Display for HelperProcessName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A resolved default route: next-hop gateway and owning interface index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultRoute {
    pub gateway: Ipv4Addr,
    pub interface_index: u32,
}
