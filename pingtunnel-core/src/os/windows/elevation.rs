//! Elevation checks and self-relaunch, grounded in the standard
//! `OpenProcessToken` + `GetTokenInformation(TokenElevation)` pattern and
//! `ShellExecuteW` with the `runas` verb for relaunching elevated.

use std::ffi::OsStr;
use std::os::windows::ffi::OsStrExt;

use pingtunnel_types::Error;
use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
use windows_sys::Win32::Security::{GetTokenInformation, TokenElevation, TOKEN_ELEVATION, TOKEN_QUERY};
use windows_sys::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};
use windows_sys::Win32::UI::Shell::ShellExecuteW;
use windows_sys::Win32::UI::WindowsAndMessaging::SW_SHOWNORMAL;

pub fn is_elevated() -> Result<bool, Error> {
    let mut token: HANDLE = 0;
    // SAFETY: `GetCurrentProcess` returns a pseudo-handle that never
    // needs closing; `token` is an out-parameter filled on success.
    let opened = unsafe { OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) };
    if opened == 0 {
        return Err(Error::os("OpenProcessToken", -1));
    }

    let mut elevation: TOKEN_ELEVATION = TOKEN_ELEVATION { TokenIsElevated: 0 };
    let mut returned_len: u32 = 0;
    // SAFETY: `token` was just opened successfully; `elevation` is sized
    // to `TOKEN_ELEVATION` and that size is passed as the buffer length.
    let result = unsafe {
        GetTokenInformation(
            token,
            TokenElevation,
            &mut elevation as *mut _ as *mut _,
            std::mem::size_of::<TOKEN_ELEVATION>() as u32,
            &mut returned_len,
        )
    };
    // SAFETY: `token` was returned as valid by `OpenProcessToken` above.
    unsafe { CloseHandle(token) };

    if result == 0 {
        return Err(Error::os("GetTokenInformation", -1));
    }

    Ok(elevation.TokenIsElevated != 0)
}

/// Relaunches the current executable elevated via the `runas` shell
/// verb, passing through the process's own argv (excluding argv[0]).
/// Does not wait for the new process; the caller is expected to exit.
pub fn relaunch_elevated() -> Result<(), Error> {
    let exe = std::env::current_exe().map_err(|e| Error::os("current_exe", e.raw_os_error().unwrap_or(-1) as i64))?;
    let args: Vec<String> = std::env::args().skip(1).collect();
    let args_joined = args.join(" ");

    let exe_wide = to_wide(exe.as_os_str());
    let args_wide = to_wide(args_joined.as_ref());
    let verb_wide = to_wide(OsStr::new("runas"));

    // SAFETY: all string pointers passed are valid, null-terminated
    // UTF-16 buffers kept alive for the duration of this call.
    let result = unsafe {
        ShellExecuteW(
            0,
            verb_wide.as_ptr(),
            exe_wide.as_ptr(),
            args_wide.as_ptr(),
            std::ptr::null(),
            SW_SHOWNORMAL,
        )
    };

    // ShellExecuteW returns a value > 32 on success.
    if (result as isize) > 32 {
        Ok(())
    } else {
        Err(Error::os("ShellExecuteW runas", result as i64))
    }
}

fn to_wide(s: &OsStr) -> Vec<u16> {
    s.encode_wide().chain(std::iter::once(0)).collect()
}
