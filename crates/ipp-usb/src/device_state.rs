//! Per-device on-disk state.
//!
//! One INI file per device under `/var/ipp-usb/dev/<ident>.state`, written
//! atomically (write-temp-then-rename) under an advisory lock on the state
//! directory, following the same load/save shape as `config.rs` but with
//! file-level locking added since, unlike the daemon config, many
//! concurrently-running Device instances share this directory.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use fd_lock::RwLock as FileLock;
use ini::Ini;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DevState {
    pub http_port: Option<u16>,
    pub dns_sd_name: Option<String>,
    pub dns_sd_override: Option<String>,
}

pub fn state_dir() -> PathBuf {
    PathBuf::from("/var/ipp-usb/dev")
}

fn state_path(dir: &Path, ident: &str) -> PathBuf {
    dir.join(format!("{ident}.state"))
}

/// Load a device's state file. A missing or malformed file is treated as
/// empty so a corrupted state file never blocks a device from starting.
pub fn load(dir: &Path, ident: &str) -> DevState {
    let path = state_path(dir, ident);
    let Ok(ini) = Ini::load_from_file(&path) else {
        return DevState::default();
    };
    let Some(section) = ini.section(Some("device")) else {
        return DevState::default();
    };

    DevState {
        http_port: section.get("http-port").and_then(|v| v.parse().ok()),
        dns_sd_name: section.get("dns-sd-name").map(str::to_string),
        dns_sd_override: section.get("dns-sd-override").map(str::to_string),
    }
}

/// Atomically persist a device's state file under an advisory lock on a
/// sibling `.lock` file so concurrent writers (this daemon instance only
/// ever runs one writer per ident, but the lock also guards against a
/// stray second instance) never interleave writes.
pub fn save(dir: &Path, ident: &str, state: &DevState) -> Result<()> {
    fs::create_dir_all(dir)?;

    let lock_path = dir.join(format!("{ident}.lock"));
    let lock_file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(&lock_path)?;
    let mut lock = FileLock::new(lock_file);
    let _guard = lock
        .write()
        .map_err(|e| Error::AccessDenied(format!("cannot lock {}: {e}", lock_path.display())))?;

    let mut ini = Ini::new();
    {
        let section = ini.with_section(Some("device"));
        let section = if let Some(port) = state.http_port {
            section.set("http-port", port.to_string())
        } else {
            section
        };
        let section = if let Some(name) = &state.dns_sd_name {
            section.set("dns-sd-name", name.clone())
        } else {
            section
        };
        if let Some(over) = &state.dns_sd_override {
            section.set("dns-sd-override", over.clone());
        }
    }

    let final_path = state_path(dir, ident);
    let tmp_path = dir.join(format!("{ident}.state.tmp"));
    let mut tmp = fs::File::create(&tmp_path)?;
    ini.write_to(&mut tmp)
        .map_err(|e| Error::StdIo(std::io::Error::other(e)))?;
    tmp.flush()?;
    fs::rename(&tmp_path, &final_path)?;

    Ok(())
}

/// Every `http-port` claimed by a state file in `dir` other than `except_ident`,
/// used while allocating a port so two devices never race for the same one.
pub fn all_claimed_ports(dir: &Path, except_ident: &str) -> Vec<u16> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut ports = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != "state") {
            continue;
        }
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
        if stem == except_ident {
            continue;
        }
        if let Ok(ini) = Ini::load_from_file(&path) {
            if let Some(port) = ini
                .section(Some("device"))
                .and_then(|s| s.get("http-port"))
                .and_then(|v| v.parse().ok())
            {
                ports.push(port);
            }
        }
    }
    ports
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_is_identity() {
        let dir = tempfile::tempdir().unwrap();
        let state = DevState {
            http_port: Some(60001),
            dns_sd_name: Some("Printer".into()),
            dns_sd_override: Some("Printer (USB)".into()),
        };

        save(dir.path(), "0483-1234-ABC-Example", &state).unwrap();
        let loaded = load(dir.path(), "0483-1234-ABC-Example");
        assert_eq!(loaded, state);
    }

    #[test]
    fn missing_file_is_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load(dir.path(), "nonexistent");
        assert_eq!(loaded, DevState::default());
    }

    #[test]
    fn repeated_save_load_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let state = DevState {
            http_port: Some(61000),
            dns_sd_name: None,
            dns_sd_override: None,
        };
        save(dir.path(), "ident", &state).unwrap();
        let once = load(dir.path(), "ident");
        save(dir.path(), "ident", &once).unwrap();
        let twice = load(dir.path(), "ident");
        assert_eq!(once, twice);
    }

    #[test]
    fn claimed_ports_excludes_own_ident_and_skips_unrelated_files() {
        let dir = tempfile::tempdir().unwrap();
        save(dir.path(), "printer-a", &DevState { http_port: Some(60001), ..Default::default() }).unwrap();
        save(dir.path(), "printer-b", &DevState { http_port: Some(60002), ..Default::default() }).unwrap();
        std::fs::write(dir.path().join("not-a-state-file.txt"), b"ignored").unwrap();

        let claimed = all_claimed_ports(dir.path(), "printer-a");
        assert_eq!(claimed, vec![60002]);
    }
}
