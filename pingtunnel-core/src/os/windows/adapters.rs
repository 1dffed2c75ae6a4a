//! Adapter enumeration shared by the routing, DNS, and interface-inventory
//! bindings. Wraps `GetAdaptersAddresses`, the same IP Helper family
//! `GetIpForwardTable2` belongs to.

use pingtunnel_types::Error;
use windows_sys::Win32::Foundation::ERROR_BUFFER_OVERFLOW;
use windows_sys::Win32::NetworkManagement::IpHelper::{
    GetAdaptersAddresses, GAA_FLAG_SKIP_ANYCAST, GAA_FLAG_SKIP_DNS_SERVER, GAA_FLAG_SKIP_MULTICAST,
    IP_ADAPTER_ADDRESSES_LH,
};
use windows_sys::Win32::Networking::WinSock::AF_UNSPEC;
use widestring::WideCStr;

/// One enumerated adapter: its friendly description (used as the
/// DNS-snapshot key), its registry adapter GUID, and its IPv4 interface
/// index.
#[derive(Debug, Clone)]
pub struct RawAdapter {
    pub description: String,
    pub adapter_guid: String,
    pub interface_index: u32,
    /// `IfOperStatusUp` (1) when the adapter is up and not loopback.
    pub operational: bool,
}

/// SAFETY: `GetAdaptersAddresses` is called in a standard grow-buffer
/// loop. The pointer handed back is only read for the lifetime of this
/// function; the backing `Vec<u8>` is kept alive for that whole span.
pub fn enumerate() -> Result<Vec<RawAdapter>, Error> {
    let flags = GAA_FLAG_SKIP_ANYCAST | GAA_FLAG_SKIP_MULTICAST | GAA_FLAG_SKIP_DNS_SERVER;
    let mut buf_len: u32 = 16 * 1024;
    let mut buffer: Vec<u8>;

    loop {
        buffer = vec![0u8; buf_len as usize];
        // SAFETY: `buffer` is sized to `buf_len` and we pass its exact
        // length; the call either succeeds or reports how large the
        // buffer needs to be via `buf_len`.
        let result = unsafe {
            GetAdaptersAddresses(
                AF_UNSPEC as u32,
                flags,
                std::ptr::null_mut(),
                buffer.as_mut_ptr() as *mut IP_ADAPTER_ADDRESSES_LH,
                &mut buf_len,
            )
        };

        if result == ERROR_BUFFER_OVERFLOW {
            continue;
        }
        if result != 0 {
            return Err(Error::os("GetAdaptersAddresses", result as i64));
        }
        break;
    }

    let mut adapters = Vec::new();
    // SAFETY: the buffer was just populated by a successful call above;
    // the linked list of `IP_ADAPTER_ADDRESSES_LH` entries lives entirely
    // inside `buffer`.
    let mut cursor = buffer.as_ptr() as *const IP_ADAPTER_ADDRESSES_LH;
    while !cursor.is_null() {
        let entry = unsafe { &*cursor };

        let description = unsafe { widestring_to_string(entry.Description) };
        let adapter_guid = unsafe { ansi_to_string(entry.AdapterName) };
        let operational = entry.OperStatus == 1 /* IfOperStatusUp */
            && entry.IfType != 24 /* IF_TYPE_SOFTWARE_LOOPBACK */;

        adapters.push(RawAdapter {
            description,
            adapter_guid,
            interface_index: entry.Anonymous1.Anonymous.IfIndex,
            operational,
        });

        cursor = entry.Next;
    }

    Ok(adapters)
}

/// SAFETY: `ptr` must be a null-terminated UTF-16 string, as
/// `IP_ADAPTER_ADDRESSES_LH::Description` always is when non-null.
unsafe fn widestring_to_string(ptr: *mut u16) -> String {
    if ptr.is_null() {
        return String::new();
    }
    WideCStr::from_ptr_str(ptr).to_string_lossy()
}

/// SAFETY: `ptr` must be a null-terminated ANSI string, as
/// `IP_ADAPTER_ADDRESSES_LH::AdapterName` always is.
unsafe fn ansi_to_string(ptr: *mut u8) -> String {
    if ptr.is_null() {
        return String::new();
    }
    let mut len = 0usize;
    while *ptr.add(len) != 0 {
        len += 1;
    }
    let slice = std::slice::from_raw_parts(ptr, len);
    String::from_utf8_lossy(slice).into_owned()
}
