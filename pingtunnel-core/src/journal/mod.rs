//! Recovery Journal (C3): an append-only-in-spirit record of every system
//! mutation the current session has performed, replayed to undo on the
//! next startup if the previous run did not exit cleanly.
//!
//! Ordering rule: the journal is written BEFORE the corresponding mutation
//! is applied, and cleared AFTER every mutation has been reversed. Callers
//! (the Connection State Machine) are responsible for respecting that
//! ordering; this module only provides the file operations.

use std::path::{Path, PathBuf};

use chrono::Utc;
use pingtunnel_types::error::HelperProcessName;
use pingtunnel_types::journal::{RecoveryJournal as JournalDocument, RouteEntry};
use pingtunnel_types::Error;

use crate::atomic::{read_json_opt, write_json_atomic};
use crate::os::OsBindings;

/// Owns the on-disk journal file and exposes the operations C7 and C9
/// need: save, append, clear, and best-effort recovery.
pub struct RecoveryJournal {
    path: PathBuf,
}

impl RecoveryJournal {
    pub fn new(path: PathBuf) -> Self {
        RecoveryJournal { path }
    }

    pub fn at_default_path() -> Self {
        RecoveryJournal::new(crate::paths::journal_path())
    }

    /// `true` when a journal file exists and its `is_connected` flag is
    /// set, meaning the previous run did not reach a clean disconnect.
    pub fn needs_recovery(&self) -> Result<bool, Error> {
        Ok(read_json_opt::<JournalDocument>(&self.path)?
            .map(|doc| doc.is_connected)
            .unwrap_or(false))
    }

    pub fn load(&self) -> Result<Option<JournalDocument>, Error> {
        read_json_opt(&self.path)
    }

    pub fn save(&self, state: &JournalDocument) -> Result<(), Error> {
        write_json_atomic(&self.path, state)
    }

    /// Reads the current document (or a fresh default), appends the
    /// route, and writes it back.
    pub fn append_route(&self, entry: RouteEntry) -> Result<(), Error> {
        let mut doc = read_json_opt::<JournalDocument>(&self.path)?.unwrap_or_default();
        doc.added_routes.push(entry);
        self.save(&doc)
    }

    pub fn clear(&self) -> Result<(), Error> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::os("remove journal file", e.raw_os_error().unwrap_or(-1) as i64)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Best-effort undo of a previous session's system mutations: delete
    /// every recorded route, restore every recorded adapter's DNS, kill
    /// orphaned helper processes, then clear the journal. Each
    /// sub-operation logs and continues on failure rather than aborting,
    /// so one stubborn route can't block the rest of the sweep.
    pub fn recover(&self, os: &dyn OsBindings, resource_dir: &PathBuf) -> Result<(), Error> {
        let doc = match self.load()? {
            Some(doc) => doc,
            None => return Ok(()),
        };

        for route in &doc.added_routes {
            if let Err(e) = os.delete_route(route.destination, route.prefix_length, route.gateway) {
                log::warn!("recovery: failed to delete route {:?}: {}", route, e);
            }
        }

        for (adapter, servers) in &doc.original_dns_settings {
            let result = if servers.is_empty() {
                os.reset_dns_to_dhcp(adapter)
            } else {
                os.set_dns(adapter, servers)
            };
            if let Err(e) = result {
                log::warn!("recovery: failed to restore DNS for {}: {}", adapter, e);
            }
        }

        for name in [HelperProcessName::PingTunnelClient, HelperProcessName::Tun2Socks] {
            match os.find_orphaned_helper_processes(name, resource_dir) {
                Ok(pids) => {
                    for pid in pids {
                        if let Err(e) = os.kill_process_by_pid(pid) {
                            log::warn!("recovery: failed to kill orphaned {} (pid {}): {}", name, pid, e);
                        }
                    }
                }
                Err(e) => log::warn!("recovery: failed to enumerate orphaned {} processes: {}", name, e),
            }
        }

        self.clear()
    }
}

/// Convenience for building a fresh journal document at the start of a
/// connect sequence, timestamped at the moment the journal is first
/// written.
pub fn new_document() -> JournalDocument {
    let mut doc = JournalDocument::new();
    doc.mark_connected(Utc::now());
    doc
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    use crate::os::fake::FakeOs;

    fn sample_route(n: u8) -> RouteEntry {
        RouteEntry {
            destination: Ipv4Addr::new(10, 0, 0, n),
            prefix_length: 32,
            gateway: Ipv4Addr::new(192, 168, 1, 1),
            interface_index: 5,
            metric: 1,
        }
    }

    #[test]
    fn needs_recovery_is_false_when_no_file_exists() {
        let dir = tempfile::tempdir().unwrap();
        let journal = RecoveryJournal::new(dir.path().join("state.json"));
        assert!(!journal.needs_recovery().unwrap());
    }

    #[test]
    fn save_then_needs_recovery_reflects_connected_flag() {
        let dir = tempfile::tempdir().unwrap();
        let journal = RecoveryJournal::new(dir.path().join("state.json"));

        let doc = new_document();
        journal.save(&doc).unwrap();
        assert!(journal.needs_recovery().unwrap());

        journal.clear().unwrap();
        assert!(!journal.needs_recovery().unwrap());
    }

    #[test]
    fn append_route_accumulates_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let journal = RecoveryJournal::new(dir.path().join("state.json"));

        journal.save(&new_document()).unwrap();
        journal.append_route(sample_route(1)).unwrap();
        journal.append_route(sample_route(2)).unwrap();

        let doc = journal.load().unwrap().unwrap();
        assert_eq!(doc.added_routes, vec![sample_route(1), sample_route(2)]);
    }

    #[test]
    fn clear_on_absent_file_is_a_no_op_success() {
        let dir = tempfile::tempdir().unwrap();
        let journal = RecoveryJournal::new(dir.path().join("state.json"));
        journal.clear().unwrap();
        journal.clear().unwrap();
    }

    #[test]
    fn recover_deletes_routes_restores_dns_and_clears_journal() {
        let dir = tempfile::tempdir().unwrap();
        let journal = RecoveryJournal::new(dir.path().join("state.json"));

        let os = FakeOs::new();
        let route = sample_route(1);
        os.add_route(crate::os::RouteSpec {
            destination: route.destination,
            prefix_length: route.prefix_length,
            gateway: route.gateway,
            interface_index: route.interface_index,
            metric: route.metric,
        })
        .unwrap();
        os.seed_dns("Ethernet", vec![Ipv4Addr::new(10, 10, 10, 10)]);

        let mut doc = new_document();
        doc.added_routes.push(route);
        doc.original_dns_settings
            .insert("Ethernet".to_string(), vec![Ipv4Addr::new(1, 1, 1, 1)]);
        journal.save(&doc).unwrap();

        journal.recover(&os, &PathBuf::from("C:\\Program Files\\PingTunnelVPN")).unwrap();

        assert!(os.routes().is_empty());
        assert_eq!(
            os.dns_snapshot().get("Ethernet"),
            Some(&vec![Ipv4Addr::new(1, 1, 1, 1)])
        );
        assert!(!journal.path().exists());
    }
}
