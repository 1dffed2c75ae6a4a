//! Per-user data directory resolution, via `dirs-next` the way
//! `mullvad-daemon` resolves its own Windows data directory.

use std::path::PathBuf;

const PRODUCT_DIR: &str = "PingTunnelVPN";

/// `%APPDATA%\PingTunnelVPN` on Windows (roaming app-data), falling back to
/// a `.pingtunnelvpn` directory under the home directory if `dirs-next`
/// cannot resolve one, which only happens in unusual sandboxed contexts.
pub fn data_dir() -> PathBuf {
    dirs_next::data_dir()
        .unwrap_or_else(|| dirs_next::home_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join(PRODUCT_DIR)
}

pub fn configs_path() -> PathBuf {
    data_dir().join("configs.json")
}

pub fn global_settings_path() -> PathBuf {
    data_dir().join("global-settings.json")
}

pub fn journal_path() -> PathBuf {
    data_dir().join("state.json")
}

pub fn logs_dir() -> PathBuf {
    data_dir().join("logs")
}
