//! Write-temp-then-rename helpers shared by the Recovery Journal (C3) and
//! the Configuration Store (C8), both of which need atomic replace
//! semantics over a JSON document so a crash mid-write can never leave a
//! half-written file behind.

use std::fs;
use std::path::Path;

use pingtunnel_types::Error;

/// Serializes `value` as pretty JSON and atomically replaces `path` with
/// it: write to `<path>.tmp` in the same directory, then rename over the
/// destination. A rename within one filesystem is atomic on Windows (and
/// POSIX), so readers never observe a partially written file.
pub fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::os("create_dir_all", e.raw_os_error().unwrap_or(-1) as i64))?;
    }

    let body = serde_json::to_string_pretty(value)
        .map_err(|e| Error::os("serialize json", e.line() as i64))?;

    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, body).map_err(|e| Error::os("write temp file", e.raw_os_error().unwrap_or(-1) as i64))?;
    fs::rename(&tmp_path, path).map_err(|e| Error::os("rename temp file", e.raw_os_error().unwrap_or(-1) as i64))?;
    Ok(())
}

/// Reads and deserializes a JSON document, returning `Ok(None)` when the
/// file does not exist rather than erroring.
pub fn read_json_opt<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, Error> {
    match fs::read_to_string(path) {
        Ok(body) => {
            let value = serde_json::from_str(&body).map_err(|e| Error::os("parse json", e.line() as i64))?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::os("read file", e.raw_os_error().unwrap_or(-1) as i64)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Doc {
        value: u32,
    }

    #[test]
    fn round_trips_through_atomic_write_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");

        assert_eq!(read_json_opt::<Doc>(&path).unwrap(), None);

        write_json_atomic(&path, &Doc { value: 42 }).unwrap();
        assert_eq!(read_json_opt::<Doc>(&path).unwrap(), Some(Doc { value: 42 }));

        write_json_atomic(&path, &Doc { value: 7 }).unwrap();
        assert_eq!(read_json_opt::<Doc>(&path).unwrap(), Some(Doc { value: 7 }));

        assert!(!path.with_extension("tmp").exists());
    }
}
