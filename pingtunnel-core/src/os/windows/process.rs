//! Process control bindings: spawning the two helper executables with
//! captured output, tree-killing them, and enumerating running processes
//! to find orphans left behind by an unclean previous run.

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use pingtunnel_types::error::HelperProcessName;
use pingtunnel_types::Error;
use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, MAX_PATH};
use windows_sys::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Process32FirstW, Process32NextW, PROCESSENTRY32W,
    TH32CS_SNAPPROCESS,
};
use windows_sys::Win32::System::ProcessStatus::K32GetModuleFileNameExW;
use windows_sys::Win32::System::Threading::{OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_VM_READ};
use widestring::WideCStr;

use crate::os::ChildProcess;

pub struct WindowsChild {
    child: Child,
}

impl ChildProcess for WindowsChild {
    fn try_wait(&mut self) -> Result<Option<Option<i32>>, Error> {
        match self.child.try_wait() {
            Ok(Some(status)) => Ok(Some(status.code())),
            Ok(None) => Ok(None),
            Err(e) => Err(Error::os("try_wait", e.raw_os_error().unwrap_or(-1) as i64)),
        }
    }

    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn take_stdout(&mut self) -> Option<Box<dyn std::io::Read + Send>> {
        self.child.stdout.take().map(|s| Box::new(s) as Box<dyn std::io::Read + Send>)
    }

    fn take_stderr(&mut self) -> Option<Box<dyn std::io::Read + Send>> {
        self.child.stderr.take().map(|s| Box::new(s) as Box<dyn std::io::Read + Send>)
    }
}

pub fn spawn_process(executable: &PathBuf, args: &[String]) -> Result<Box<dyn ChildProcess>, Error> {
    let child = Command::new(executable)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::os("spawn helper process", e.raw_os_error().unwrap_or(-1) as i64))?;
    Ok(Box::new(WindowsChild { child }))
}

/// Tree-kills via `taskkill /PID <pid> /T /F`, the conventional
/// Windows way to also terminate any grandchildren a helper may have
/// spawned, then waits up to `timeout` for the process to actually
/// disappear.
pub fn terminate_process_tree(pid: u32, timeout: std::time::Duration) -> Result<(), Error> {
    let _ = duct::cmd!("taskkill", "/PID", pid.to_string(), "/T", "/F")
        .stdout_capture()
        .stderr_capture()
        .unchecked()
        .run();

    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if !process_exists(pid) {
            return Ok(());
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
    }
    Ok(())
}

fn process_exists(pid: u32) -> bool {
    // SAFETY: `OpenProcess` with a query-only access mask is safe to
    // call with any pid; a null handle just means "not found/denied".
    let handle = unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid) };
    if handle == 0 {
        return false;
    }
    // SAFETY: `handle` was just returned as non-null by `OpenProcess`.
    unsafe { CloseHandle(handle) };
    true
}

/// Walks a process snapshot looking for any running instance of `name`
/// whose executable image path starts with `resource_dir` — these are
/// orphans from a previous unclean shutdown, since no other product
/// should ship the helper images from that path.
pub fn find_orphaned_helper_processes(
    name: HelperProcessName,
    resource_dir: &PathBuf,
) -> Result<Vec<u32>, Error> {
    let target_image = format!("{}.exe", name.as_str());
    let resource_dir_str = resource_dir.to_string_lossy().to_lowercase();

    // SAFETY: `CreateToolhelp32Snapshot` returns either a valid snapshot
    // handle or `INVALID_HANDLE_VALUE`; checked below.
    let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) };
    if snapshot == -1isize as HANDLE {
        return Err(Error::os("CreateToolhelp32Snapshot", -1));
    }

    let mut orphans = Vec::new();
    // SAFETY: `entry` is POD; `dwSize` must be set before the first
    // `Process32FirstW` call per the Win32 contract.
    let mut entry: PROCESSENTRY32W = unsafe { std::mem::zeroed() };
    entry.dwSize = std::mem::size_of::<PROCESSENTRY32W>() as u32;

    // SAFETY: `snapshot` is a valid handle and `entry` is correctly sized.
    let mut has_entry = unsafe { Process32FirstW(snapshot, &mut entry) } != 0;
    while has_entry {
        let exe_name = widestring_to_string(&entry.szExeFile);
        if exe_name.eq_ignore_ascii_case(&target_image) {
            if let Some(image_path) = query_image_path(entry.th32ProcessID) {
                if image_path.to_lowercase().starts_with(&resource_dir_str) {
                    orphans.push(entry.th32ProcessID);
                }
            }
        }
        // SAFETY: same snapshot handle and entry buffer as above.
        has_entry = unsafe { Process32NextW(snapshot, &mut entry) } != 0;
    }

    // SAFETY: `snapshot` was created above and not yet closed.
    unsafe { CloseHandle(snapshot) };
    Ok(orphans)
}

fn query_image_path(pid: u32) -> Option<String> {
    // SAFETY: `OpenProcess` with query+vm-read access is safe to call
    // with any pid; failure yields a null handle, handled below.
    let handle = unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION | PROCESS_VM_READ, 0, pid) };
    if handle == 0 {
        return None;
    }

    let mut buffer = [0u16; MAX_PATH as usize];
    // SAFETY: `handle` is valid (checked above), `buffer` has capacity
    // `MAX_PATH` which is passed as the length.
    let len = unsafe { K32GetModuleFileNameExW(handle, 0, buffer.as_mut_ptr(), buffer.len() as u32) };
    // SAFETY: `handle` was returned as non-null by `OpenProcess`.
    unsafe { CloseHandle(handle) };

    if len == 0 {
        return None;
    }
    Some(String::from_utf16_lossy(&buffer[..len as usize]))
}

fn widestring_to_string(buf: &[u16]) -> String {
    WideCStr::from_slice_truncate(buf)
        .map(|s| s.to_string_lossy())
        .unwrap_or_default()
}

pub fn kill_process_by_pid(pid: u32) -> Result<(), Error> {
    let _ = duct::cmd!("taskkill", "/PID", pid.to_string(), "/F")
        .stdout_capture()
        .stderr_capture()
        .unchecked()
        .run();
    Ok(())
}
