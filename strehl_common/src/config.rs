//! Configuration directory.
//!
//! Servers publish named parameters as one UTF-8 text file each under the
//! configuration directory (`/tmp/strehl` unless overridden through the
//! `STREHL_CONFIG_DIR` environment variable).  Files hold integers, segment
//! identifiers, or formatted values.  Reading a segment identifier from a
//! missing or malformed file yields [`Shmid::BAD`] without reporting an
//! error: this is the advertised way for a client to discover a server's
//! remote object at boot.

use crate::error::{Error, ErrorKind, Result};
use crate::shmid::Shmid;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Environment variable overriding the configuration directory.
pub const CONFIG_DIR_ENV: &str = "STREHL_CONFIG_DIR";

/// Default configuration directory.
pub const DEFAULT_CONFIG_DIR: &str = "/tmp/strehl";

/// The active configuration directory.
pub fn config_dir() -> PathBuf {
    std::env::var_os(CONFIG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_DIR))
}

/// Path of the file storing parameter `name`.
pub fn config_path(name: &str) -> PathBuf {
    config_dir().join(name)
}

fn checked_path(dir: &Path, name: &str) -> Result<PathBuf> {
    if name.is_empty() || name.starts_with('/') || name.split('/').any(|c| c == "." || c == "..") {
        return Err(Error::new("config_path", ErrorKind::BadName));
    }
    Ok(dir.join(name))
}

/// Write a formatted value for parameter `name` in directory `dir`.
///
/// Parent directories are created as needed; the write is atomic with
/// respect to concurrent readers (write to a temporary, then rename).
pub fn write_string_in(dir: &Path, name: &str, value: &str) -> Result<()> {
    let path = checked_path(dir, name)?;
    let parent = path.parent().ok_or(Error::new("config_write", ErrorKind::BadName))?;
    std::fs::create_dir_all(parent)
        .map_err(|_| Error::last_os_error("config_write"))?;
    let tmp = path.with_extension("tmp");
    let mut file =
        std::fs::File::create(&tmp).map_err(|_| Error::last_os_error("config_write"))?;
    writeln!(file, "{value}").map_err(|_| Error::last_os_error("config_write"))?;
    std::fs::rename(&tmp, &path).map_err(|_| Error::last_os_error("config_write"))?;
    Ok(())
}

/// Read the formatted value of parameter `name` in directory `dir`.
pub fn read_string_in(dir: &Path, name: &str) -> Result<String> {
    let path = checked_path(dir, name)?;
    let text = std::fs::read_to_string(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::new("config_read", ErrorKind::NotFound)
        } else {
            Error::last_os_error("config_read")
        }
    })?;
    Ok(text.trim_end_matches('\n').to_string())
}

/// Write an integer parameter in directory `dir`.
pub fn write_long_in(dir: &Path, name: &str, value: i64) -> Result<()> {
    write_string_in(dir, name, &value.to_string())
}

/// Read an integer parameter in directory `dir`.
pub fn read_long_in(dir: &Path, name: &str) -> Result<i64> {
    let text = read_string_in(dir, name)?;
    text.trim()
        .parse()
        .map_err(|_| Error::new("config_read_long", ErrorKind::BadValue))
}

/// Write a segment identifier parameter in directory `dir`.
pub fn write_shmid_in(dir: &Path, name: &str, shmid: Shmid) -> Result<()> {
    write_long_in(dir, name, shmid.0 as i64)
}

/// Read a segment identifier parameter in directory `dir`.
///
/// Any failure (missing file, malformed contents, out-of-range value) is
/// discarded and reported as [`Shmid::BAD`].
pub fn read_shmid_in(dir: &Path, name: &str) -> Shmid {
    match read_long_in(dir, name) {
        Ok(v) if v >= 0 && v <= i32::MAX as i64 => Shmid(v as i32),
        _ => Shmid::BAD,
    }
}

/// Write a formatted value for parameter `name` in the active directory.
pub fn write_string(name: &str, value: &str) -> Result<()> {
    write_string_in(&config_dir(), name, value)
}

/// Read the formatted value of parameter `name` in the active directory.
pub fn read_string(name: &str) -> Result<String> {
    read_string_in(&config_dir(), name)
}

/// Write an integer parameter in the active directory.
pub fn write_long(name: &str, value: i64) -> Result<()> {
    write_long_in(&config_dir(), name, value)
}

/// Read an integer parameter in the active directory.
pub fn read_long(name: &str) -> Result<i64> {
    read_long_in(&config_dir(), name)
}

/// Write a segment identifier parameter in the active directory.
pub fn write_shmid(name: &str, shmid: Shmid) -> Result<()> {
    write_shmid_in(&config_dir(), name, shmid)
}

/// Read a segment identifier parameter in the active directory, yielding
/// [`Shmid::BAD`] on any failure.
pub fn read_shmid(name: &str) -> Shmid {
    read_shmid_in(&config_dir(), name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        write_long_in(dir.path(), "cam1/serial", 42).unwrap();
        assert_eq!(read_long_in(dir.path(), "cam1/serial").unwrap(), 42);
    }

    #[test]
    fn string_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        write_string_in(dir.path(), "dm1/owner", "dm1").unwrap();
        assert_eq!(read_string_in(dir.path(), "dm1/owner").unwrap(), "dm1");
    }

    #[test]
    fn missing_shmid_is_bad_without_error() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_shmid_in(dir.path(), "nonexistent/shmid"), Shmid::BAD);
    }

    #[test]
    fn malformed_shmid_is_bad() {
        let dir = tempfile::tempdir().unwrap();
        write_string_in(dir.path(), "cam1/shmid", "not a number").unwrap();
        assert_eq!(read_shmid_in(dir.path(), "cam1/shmid"), Shmid::BAD);
        write_string_in(dir.path(), "cam1/shmid", "-5").unwrap();
        assert_eq!(read_shmid_in(dir.path(), "cam1/shmid"), Shmid::BAD);
    }

    #[test]
    fn shmid_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        write_shmid_in(dir.path(), "wfs1/shmid", Shmid(77)).unwrap();
        assert_eq!(read_shmid_in(dir.path(), "wfs1/shmid"), Shmid(77));
    }

    #[test]
    fn rejects_escaping_names() {
        let dir = tempfile::tempdir().unwrap();
        assert!(write_long_in(dir.path(), "../escape", 1).is_err());
        assert!(write_long_in(dir.path(), "", 1).is_err());
        assert!(write_long_in(dir.path(), "/abs", 1).is_err());
    }
}
