//! Crash Handler (C9): single-instance enforcement, the elevation gate,
//! and a global panic trap that runs emergency shutdown.

use std::ffi::OsStr;
use std::os::windows::ffi::OsStrExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pingtunnel_core::state_machine::ConnectionSupervisor;
use pingtunnel_types::Error;
use windows_sys::Win32::Foundation::{CloseHandle, GetLastError, ERROR_ALREADY_EXISTS, HANDLE, HWND};
use windows_sys::Win32::System::Threading::CreateMutexW;
use windows_sys::Win32::UI::WindowsAndMessaging::{FindWindowW, SetForegroundWindow, ShowWindow, SW_RESTORE};

const MUTEX_NAME: &str = "PingTunnelVPN_SingleInstance_9F2B";
const WINDOW_TITLE_SUBSTRING: &str = "PingTunnel VPN";

/// Holds the named mutex for the lifetime of this process; dropping it
/// (including on relaunch-elevated) releases it for the next instance.
pub struct SingleInstanceGuard {
    handle: HANDLE,
}

impl Drop for SingleInstanceGuard {
    fn drop(&mut self) {
        if self.handle != 0 {
            // SAFETY: `handle` was returned by `CreateMutexW` and is not
            // shared with any other owner.
            unsafe {
                CloseHandle(self.handle);
            }
        }
    }
}

/// Acquires the named single-instance mutex. `Ok(None)` means another
/// instance already holds it; the caller should exit with success after
/// this returns.
pub fn acquire_single_instance() -> Result<Option<SingleInstanceGuard>, Error> {
    let name = to_wide(MUTEX_NAME);
    // SAFETY: `name` is a valid null-terminated UTF-16 buffer kept alive
    // for the duration of the call.
    let handle = unsafe { CreateMutexW(std::ptr::null(), 0, name.as_ptr()) };
    if handle == 0 {
        return Err(Error::os("CreateMutexW", -1));
    }
    if unsafe { GetLastError() } == ERROR_ALREADY_EXISTS {
        unsafe {
            CloseHandle(handle);
        }
        bring_existing_instance_forward();
        return Ok(None);
    }
    Ok(Some(SingleInstanceGuard { handle }))
}

/// Best-effort: the desktop shell owning the window is out of scope here,
/// so a miss is logged and otherwise ignored.
fn bring_existing_instance_forward() {
    let title = to_wide(WINDOW_TITLE_SUBSTRING);
    // SAFETY: `title` is a valid null-terminated UTF-16 buffer;
    // `FindWindowW` accepts a null class name to match on title alone.
    let window: HWND = unsafe { FindWindowW(std::ptr::null(), title.as_ptr()) };
    if window == 0 {
        log::warn!("another instance is running but its window could not be located");
        return;
    }
    unsafe {
        ShowWindow(window, SW_RESTORE);
        SetForegroundWindow(window);
    }
}

fn to_wide(s: &str) -> Vec<u16> {
    OsStr::new(s).encode_wide().chain(std::iter::once(0)).collect()
}

static EMERGENCY_SHUTDOWN_TRIGGERED: AtomicBool = AtomicBool::new(false);

/// Installs a panic hook that runs emergency shutdown exactly once: write
/// a crash log, run the full disconnect sequence with a 5s hard cap, then
/// exit with code 1. A second, unconditional watchdog thread force-exits
/// at 5.5s in case the cleanup itself deadlocks.
pub fn install_panic_trap(supervisor: Arc<ConnectionSupervisor>, crash_log_path: PathBuf) {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_hook(info);
        if EMERGENCY_SHUTDOWN_TRIGGERED.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(e) = std::fs::write(&crash_log_path, format!("{}\n", info)) {
            log::error!("failed to write crash log to {}: {}", crash_log_path.display(), e);
        }

        std::thread::spawn(|| {
            std::thread::sleep(Duration::from_millis(5_500));
            std::process::exit(1);
        });

        let supervisor = Arc::clone(&supervisor);
        if let Ok(runtime) = tokio::runtime::Runtime::new() {
            runtime.block_on(async move {
                let _ = tokio::time::timeout(Duration::from_secs(5), supervisor.disconnect()).await;
            });
        }
        std::process::exit(1);
    }));
}
