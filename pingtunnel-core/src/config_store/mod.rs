//! Configuration Store (C8): loads and saves the server list and global
//! settings documents, and notifies subscribers of every mutation.

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use pingtunnel_types::config::{ConfigsDocument, GlobalSettings, ServerConfig, VpnConfiguration};
use pingtunnel_types::Error;
use uuid::Uuid;

use crate::atomic::{read_json_opt, write_json_atomic};
use crate::mpsc::Sender;

/// Fires on every mutation; consumers must treat delivered values as
/// read-only snapshots, never mutated in place.
#[derive(Debug, Clone)]
pub enum ConfigEvent {
    ConfigurationChanged(VpnConfiguration),
    SelectedChanged(Option<ServerConfig>),
}

pub struct ConfigStore {
    configs_path: PathBuf,
    global_settings_path: PathBuf,
    state: Mutex<ConfigsDocument>,
    global_settings: Mutex<GlobalSettings>,
    listeners: Mutex<Vec<Box<dyn Sender<ConfigEvent> + Send>>>,
}

impl ConfigStore {
    /// Loads both documents from disk, using defaults for whichever is
    /// absent (first run).
    pub fn load(configs_path: PathBuf, global_settings_path: PathBuf) -> Result<Self, Error> {
        let configs = read_json_opt::<ConfigsDocument>(&configs_path)?.unwrap_or_default();
        let global_settings = read_json_opt::<GlobalSettings>(&global_settings_path)?.unwrap_or_default();
        Ok(ConfigStore {
            configs_path,
            global_settings_path,
            state: Mutex::new(configs),
            global_settings: Mutex::new(global_settings),
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn at_default_paths() -> Result<Self, Error> {
        Self::load(crate::paths::configs_path(), crate::paths::global_settings_path())
    }

    pub fn subscribe(&self, sender: Box<dyn Sender<ConfigEvent> + Send>) {
        self.listeners.lock().unwrap().push(sender);
    }

    fn notify(&self, event: ConfigEvent) {
        for listener in self.listeners.lock().unwrap().iter() {
            let _ = listener.send(event.clone());
        }
    }

    fn persist_configs(&self, doc: &ConfigsDocument) -> Result<(), Error> {
        write_json_atomic(&self.configs_path, doc)
    }

    fn persist_global_settings(&self, settings: &GlobalSettings) -> Result<(), Error> {
        write_json_atomic(&self.global_settings_path, settings)
    }

    pub fn list(&self) -> Vec<ServerConfig> {
        self.state.lock().unwrap().configs.clone()
    }

    pub fn get(&self, id: Uuid) -> Option<ServerConfig> {
        self.state.lock().unwrap().configs.iter().find(|c| c.id == id).cloned()
    }

    pub fn selected(&self) -> Option<ServerConfig> {
        let state = self.state.lock().unwrap();
        state
            .selected_config_id
            .and_then(|id| state.configs.iter().find(|c| c.id == id).cloned())
    }

    pub fn global_settings(&self) -> GlobalSettings {
        self.global_settings.lock().unwrap().clone()
    }

    /// Inserts `configuration` as a new record, assigning an id and
    /// timestamps, deduplicating `name` by appending ` (N)`, and
    /// auto-selecting it if this is the first record.
    pub fn add(&self, name: &str, configuration: VpnConfiguration) -> Result<ServerConfig, Error> {
        let mut state = self.state.lock().unwrap();
        let unique_name = dedupe_name(&state.configs, name);
        let now = Utc::now();
        let record = ServerConfig {
            id: Uuid::new_v4(),
            name: unique_name,
            created_at: now,
            last_modified: now,
            configuration: configuration.clone(),
        };
        let first_entry = state.configs.is_empty();
        state.configs.push(record.clone());
        if first_entry {
            state.selected_config_id = Some(record.id);
        }
        self.persist_configs(&state)?;
        drop(state);
        self.notify(ConfigEvent::ConfigurationChanged(configuration));
        if first_entry {
            self.notify(ConfigEvent::SelectedChanged(Some(record.clone())));
        }
        Ok(record)
    }

    pub fn update(&self, id: Uuid, mutator: impl FnOnce(&mut VpnConfiguration)) -> Result<ServerConfig, Error> {
        let mut state = self.state.lock().unwrap();
        let record = state
            .configs
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| Error::ConfigInvalid(vec![format!("no configuration with id {}", id)]))?;
        mutator(&mut record.configuration);
        record.last_modified = Utc::now();
        let updated = record.clone();
        self.persist_configs(&state)?;
        drop(state);
        self.notify(ConfigEvent::ConfigurationChanged(updated.configuration.clone()));
        Ok(updated)
    }

    /// Re-selects the first remaining record if the deleted one was
    /// selected.
    pub fn delete(&self, id: Uuid) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.configs.retain(|c| c.id != id);
        let mut new_selection = None;
        if state.selected_config_id == Some(id) {
            new_selection = state.configs.first().map(|c| c.id);
            state.selected_config_id = new_selection;
        }
        self.persist_configs(&state)?;
        let selected_record = new_selection.and_then(|sid| state.configs.iter().find(|c| c.id == sid).cloned());
        drop(state);
        self.notify(ConfigEvent::SelectedChanged(selected_record));
        Ok(())
    }

    pub fn select(&self, id: Uuid) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if !state.configs.iter().any(|c| c.id == id) {
            return Err(Error::ConfigInvalid(vec![format!("no configuration with id {}", id)]));
        }
        state.selected_config_id = Some(id);
        let selected = state.configs.iter().find(|c| c.id == id).cloned();
        self.persist_configs(&state)?;
        drop(state);
        self.notify(ConfigEvent::SelectedChanged(selected));
        Ok(())
    }

    /// Reads a `VpnConfiguration` from `path` and inserts it as a new
    /// record named after the file stem.
    pub fn import(&self, path: &std::path::Path) -> Result<ServerConfig, Error> {
        let body = std::fs::read_to_string(path)
            .map_err(|e| Error::os("read import file", e.raw_os_error().unwrap_or(-1) as i64))?;
        let configuration: VpnConfiguration =
            serde_json::from_str(&body).map_err(|e| Error::os("parse import file", e.line() as i64))?;
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("imported")
            .to_string();
        self.add(&name, configuration)
    }

    /// Writes only the selected record's configuration, not the whole
    /// store.
    pub fn export(&self, path: &std::path::Path) -> Result<(), Error> {
        let selected = self
            .selected()
            .ok_or_else(|| Error::ConfigInvalid(vec!["no configuration is selected".to_string()]))?;
        write_json_atomic(path, &selected.configuration)
    }

    pub fn reset_global_settings(&self) -> Result<(), Error> {
        let defaults = GlobalSettings::default();
        *self.global_settings.lock().unwrap() = defaults.clone();
        self.persist_global_settings(&defaults)
    }

    pub fn update_global_settings(&self, mutator: impl FnOnce(&mut GlobalSettings)) -> Result<GlobalSettings, Error> {
        let mut settings = self.global_settings.lock().unwrap();
        mutator(&mut settings);
        settings.validate().map_err(Error::ConfigInvalid)?;
        self.persist_global_settings(&settings)?;
        Ok(settings.clone())
    }
}

fn dedupe_name(existing: &[ServerConfig], name: &str) -> String {
    if !existing.iter().any(|c| c.name == name) {
        return name.to_string();
    }
    let mut n = 2;
    loop {
        let candidate = format!("{} ({})", name, n);
        if !existing.iter().any(|c| c.name == candidate) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config(server: &str) -> VpnConfiguration {
        VpnConfiguration {
            server_address: server.to_string(),
            server_key: "s3cret".to_string(),
            local_socks_port: 1080,
        }
    }

    #[test]
    fn add_auto_selects_first_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path().join("configs.json"), dir.path().join("global-settings.json")).unwrap();

        let record = store.add("home", sample_config("tunnel.example.net")).unwrap();
        assert_eq!(store.selected().unwrap().id, record.id);
    }

    #[test]
    fn add_dedupes_names_by_appending_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path().join("configs.json"), dir.path().join("global-settings.json")).unwrap();

        store.add("home", sample_config("a.example.net")).unwrap();
        let second = store.add("home", sample_config("b.example.net")).unwrap();
        assert_eq!(second.name, "home (2)");
    }

    #[test]
    fn delete_reselects_first_remaining() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path().join("configs.json"), dir.path().join("global-settings.json")).unwrap();

        let first = store.add("a", sample_config("a.example.net")).unwrap();
        let second = store.add("b", sample_config("b.example.net")).unwrap();
        store.select(first.id).unwrap();

        store.delete(first.id).unwrap();
        assert_eq!(store.selected().unwrap().id, second.id);
    }

    #[test]
    fn export_then_import_round_trips_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path().join("configs.json"), dir.path().join("global-settings.json")).unwrap();
        store.add("home", sample_config("tunnel.example.net")).unwrap();

        let export_path = dir.path().join("home.json");
        store.export(&export_path).unwrap();

        let imported = store.import(&export_path).unwrap();
        assert_eq!(imported.configuration, sample_config("tunnel.example.net"));
        assert_eq!(imported.name, "home");
    }

    #[test]
    fn persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let configs_path = dir.path().join("configs.json");
        let settings_path = dir.path().join("global-settings.json");

        {
            let store = ConfigStore::load(configs_path.clone(), settings_path.clone()).unwrap();
            store.add("home", sample_config("tunnel.example.net")).unwrap();
        }

        let reloaded = ConfigStore::load(configs_path, settings_path).unwrap();
        assert_eq!(reloaded.list().len(), 1);
    }

    #[test]
    fn reset_global_settings_restores_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path().join("configs.json"), dir.path().join("global-settings.json")).unwrap();
        store.update_global_settings(|s| s.mtu = 9000).unwrap();
        assert_eq!(store.global_settings().mtu, 9000);

        store.reset_global_settings().unwrap();
        assert_eq!(store.global_settings().mtu, GlobalSettings::default().mtu);
    }
}
