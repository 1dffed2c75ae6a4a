use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-server configuration, read-snapshotted by the state machine at
/// connect time and never mutated during a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VpnConfiguration {
    /// DNS name or literal IPv4/IPv6 address of the tunnel server.
    pub server_address: String,
    /// Shared authentication token passed to the ICMP tunnel client.
    pub server_key: String,
    /// Local SOCKS5 listen port used by both helper processes.
    #[serde(default = "default_local_socks_port")]
    pub local_socks_port: u16,
}

fn default_local_socks_port() -> u16 {
    1080
}

impl VpnConfiguration {
    /// Validates that the server address and key are non-empty and the
    /// local SOCKS5 port is in `[1, 65535]`.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.server_address.trim().is_empty() {
            errors.push("server address must not be empty".to_string());
        }
        if self.server_key.trim().is_empty() {
            errors.push("server key must not be empty".to_string());
        }
        if self.local_socks_port == 0 {
            errors.push("local SOCKS5 port must be in [1, 65535]".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// A named, persisted configuration record as stored in `configs.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub configuration: VpnConfiguration,
}

/// The full `configs.json` document: all records plus the selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigsDocument {
    #[serde(default)]
    pub configs: Vec<ServerConfig>,
    #[serde(default)]
    pub selected_config_id: Option<Uuid>,
}

/// DNS handling mode selected by `GlobalSettings.dnsMode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsMode {
    /// Run the in-process DNS forwarder and point adapters at it.
    Tunnel,
    /// Leave the system's DNS configuration untouched.
    System,
}

/// Payload encryption applied by the ICMP tunnel client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionMode {
    None,
    Aes128,
    Aes256,
    Chacha20,
}

/// Global tunable parameters, one instance shared by every session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalSettings {
    pub mtu: u16,
    pub dns_mode: DnsMode,
    pub dns_servers: Vec<Ipv4Addr>,
    pub bypass_subnets: Vec<Ipv4Network>,
    pub encryption_mode: EncryptionMode,
    pub encryption_key: Option<String>,
    pub latency_threshold_ms: u32,
    pub high_latency_count_threshold: u32,
    pub restart_cooldown_seconds: u64,
    /// 0 means unlimited.
    pub max_auto_restarts: u32,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        GlobalSettings {
            mtu: 1420,
            dns_mode: DnsMode::Tunnel,
            dns_servers: vec![Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8)],
            bypass_subnets: Vec::new(),
            encryption_mode: EncryptionMode::None,
            encryption_key: None,
            latency_threshold_ms: 1000,
            high_latency_count_threshold: 5,
            restart_cooldown_seconds: 30,
            max_auto_restarts: 3,
        }
    }
}

impl GlobalSettings {
    /// Validates the MTU range and that an encryption key is present
    /// whenever the selected encryption mode requires one.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if !(576..=9000).contains(&self.mtu) {
            errors.push(format!("mtu {} out of range [576, 9000]", self.mtu));
        }
        if matches!(self.encryption_mode, EncryptionMode::Aes128 | EncryptionMode::Aes256 | EncryptionMode::Chacha20)
            && self.encryption_key.as_deref().unwrap_or("").is_empty()
        {
            errors.push("encryption key required for the selected encryption mode".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vpn_configuration_rejects_empty_host() {
        let config = VpnConfiguration {
            server_address: "".to_string(),
            server_key: "s3cret".to_string(),
            local_socks_port: 1080,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn vpn_configuration_defaults_local_socks_port() {
        let json = r#"{"serverAddress":"tunnel.example.net","serverKey":"s3cret"}"#;
        let config: VpnConfiguration = serde_json::from_str(json).unwrap();
        assert_eq!(config.local_socks_port, 1080);
    }

    #[test]
    fn global_settings_defaults_are_valid() {
        assert!(GlobalSettings::default().validate().is_ok());
    }

    #[test]
    fn global_settings_rejects_mtu_out_of_range() {
        let mut settings = GlobalSettings::default();
        settings.mtu = 100;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn global_settings_requires_key_for_encryption() {
        let mut settings = GlobalSettings::default();
        settings.encryption_mode = EncryptionMode::Aes256;
        settings.encryption_key = None;
        assert!(settings.validate().is_err());
        settings.encryption_key = Some("key".to_string());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn configs_document_round_trips_through_json() {
        let mut doc = ConfigsDocument::default();
        doc.configs.push(ServerConfig {
            id: Uuid::new_v4(),
            name: "home".to_string(),
            created_at: Utc::now(),
            last_modified: Utc::now(),
            configuration: VpnConfiguration {
                server_address: "tunnel.example.net".to_string(),
                server_key: "s3cret".to_string(),
                local_socks_port: 1080,
            },
        });
        doc.selected_config_id = Some(doc.configs[0].id);

        let json = serde_json::to_string(&doc).unwrap();
        let parsed: ConfigsDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.configs.len(), 1);
        assert_eq!(parsed.selected_config_id, doc.selected_config_id);
    }
}
