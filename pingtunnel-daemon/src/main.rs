//! PingTunnel VPN host process. Gates startup behind the Crash Handler
//! (single instance, elevation), replays any outstanding recovery
//! journal, then drives the Connection Supervisor for the lifetime of
//! the process.

mod cli;
mod crash;
mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use pingtunnel_core::config_store::ConfigStore;
use pingtunnel_core::journal::RecoveryJournal;
use pingtunnel_core::os::windows::WindowsOs;
use pingtunnel_core::os::OsBindings;
use pingtunnel_core::state_machine::ConnectionSupervisor;
use pingtunnel_types::state::StateChangeEvent;

fn main() {
    let args = cli::parse();

    if let Err(e) = logging::init(args.verbosity) {
        eprintln!("failed to initialize logging: {}", e);
        std::process::exit(1);
    }
    log_panics::init();

    std::process::exit(run(args));
}

fn run(args: cli::Args) -> i32 {
    let instance_guard = match crash::acquire_single_instance() {
        Ok(Some(guard)) => guard,
        Ok(None) => {
            log::info!("another instance is already running");
            return 0;
        }
        Err(e) => {
            log::error!("failed to acquire single-instance lock: {}", e);
            return 1;
        }
    };

    let os: Arc<dyn OsBindings> = Arc::new(WindowsOs::new());

    match os.is_elevated() {
        Ok(true) => {}
        Ok(false) => {
            log::warn!("not running elevated, relaunching");
            drop(instance_guard);
            return match os.relaunch_elevated() {
                Ok(()) => 0,
                Err(e) => {
                    log::error!("failed to relaunch elevated: {}", e);
                    1
                }
            };
        }
        Err(e) => {
            log::error!("failed to check elevation: {}", e);
            return 1;
        }
    }

    let resource_dir = resource_dir();

    let journal = Arc::new(RecoveryJournal::at_default_path());
    if journal.needs_recovery().unwrap_or(false) {
        log::warn!("previous run did not exit cleanly, replaying recovery journal");
        if let Err(e) = journal.recover(os.as_ref(), &resource_dir) {
            log::error!("recovery sweep failed: {}", e);
        }
    }

    let config_store = match ConfigStore::at_default_paths() {
        Ok(store) => Arc::new(store),
        Err(e) => {
            log::error!("failed to load configuration store: {}", e);
            return 1;
        }
    };
    let has_selected_config = config_store.selected().is_some();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("failed to start async runtime: {}", e);
            return 1;
        }
    };

    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel::<StateChangeEvent>();
    let supervisor = Arc::new(ConnectionSupervisor::new(
        Arc::clone(&os),
        resource_dir,
        config_store,
        journal,
        Box::new(event_tx),
    ));

    crash::install_panic_trap(Arc::clone(&supervisor), crash_log_path());

    let exit_code = runtime.block_on(async move {
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                log::info!("state change #{}: {} -> {} ({})", event.sequence, event.from, event.to, event.message);
            }
        });

        if args.auto_connect && has_selected_config {
            if let Err(e) = supervisor.connect().await {
                log::error!("initial connect failed: {}", e);
            }
        }

        wait_for_shutdown_signal().await;

        log::info!("shutdown requested, disconnecting");
        if let Err(e) = supervisor.disconnect().await {
            log::warn!("disconnect during shutdown reported: {}", e);
        }
        0
    });

    drop(instance_guard);
    exit_code
}

fn resource_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn crash_log_path() -> PathBuf {
    pingtunnel_core::paths::logs_dir().join("crash.log")
}

async fn wait_for_shutdown_signal() {
    let notify = Arc::new(tokio::sync::Notify::new());
    let notify_for_handler = Arc::clone(&notify);
    let result = ctrlc::set_handler(move || notify_for_handler.notify_one());
    if let Err(e) = result {
        log::error!("failed to install Ctrl+C handler: {}", e);
        return;
    }
    notify.notified().await;
}
