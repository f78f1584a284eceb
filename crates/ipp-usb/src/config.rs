//! The `[network]`/`[logging]` daemon configuration file.
//!
//! Loaded from `/etc/ipp-usb/ipp-usb.conf`, falling back to a file named
//! `ipp-usb.conf` next to the running executable. Every on-disk file
//! (config, quirks, per-device state) shares the same INI format.

use std::collections::BTreeSet;
use std::env;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::ini_ext;

/// `device-log` / `main-log` / `console-log` facility list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogFacility {
    Error,
    Info,
    Debug,
    TraceIpp,
    TraceEscl,
    TraceHttp,
    TraceUsb,
    All,
    TraceAll,
}

impl LogFacility {
    fn parse(token: &str) -> Result<Self> {
        Ok(match token.trim().to_ascii_lowercase().as_str() {
            "error" => LogFacility::Error,
            "info" => LogFacility::Info,
            "debug" => LogFacility::Debug,
            "trace-ipp" => LogFacility::TraceIpp,
            "trace-escl" => LogFacility::TraceEscl,
            "trace-http" => LogFacility::TraceHttp,
            "trace-usb" => LogFacility::TraceUsb,
            "all" => LogFacility::All,
            "trace-all" => LogFacility::TraceAll,
            other => {
                return Err(Error::Configuration(format!(
                    "unknown log facility {other:?}"
                )));
            }
        })
    }

    fn parse_list(value: &str) -> Result<BTreeSet<LogFacility>> {
        value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(LogFacility::parse)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interface {
    All,
    Loopback,
}

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub http_min_port: u16,
    pub http_max_port: u16,
    pub dns_sd: bool,
    pub interface: Interface,
    pub ipv6: bool,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub device_log: BTreeSet<LogFacility>,
    pub main_log: BTreeSet<LogFacility>,
    pub console_log: BTreeSet<LogFacility>,
    pub max_file_size: u64,
    pub max_backup_files: u32,
    pub console_color: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub network: NetworkConfig,
    pub logging: LoggingConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            http_min_port: 60000,
            http_max_port: 65535,
            dns_sd: true,
            interface: Interface::Loopback,
            ipv6: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            device_log: [LogFacility::Error, LogFacility::Info].into_iter().collect(),
            main_log: [LogFacility::Error, LogFacility::Info].into_iter().collect(),
            console_log: [LogFacility::Error, LogFacility::Info].into_iter().collect(),
            max_file_size: 256 * 1024,
            max_backup_files: 5,
            console_color: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// System config path, checked first.
    pub fn system_path() -> PathBuf {
        PathBuf::from("/etc/ipp-usb/ipp-usb.conf")
    }

    /// Fallback: a file named `ipp-usb.conf` next to the running executable.
    pub fn adjacent_path() -> Option<PathBuf> {
        env::current_exe()
            .ok()?
            .parent()
            .map(|dir| dir.join("ipp-usb.conf"))
    }

    /// Load from the first candidate that exists, or defaults if neither does.
    pub fn load_or_default() -> Self {
        let candidates = [Some(Self::system_path()), Self::adjacent_path()];
        for candidate in candidates.into_iter().flatten() {
            if candidate.exists() {
                match Self::load(&candidate) {
                    Ok(cfg) => {
                        tracing::info!("loaded configuration from {}", candidate.display());
                        return cfg;
                    }
                    Err(e) => {
                        tracing::warn!("failed to parse {}: {e}, using defaults", candidate.display());
                        return Self::default();
                    }
                }
            }
        }
        tracing::info!("no configuration file found, using built-in defaults");
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let ini = ini_ext::load(path)?;
        let mut cfg = Self::default();

        if let Some(section) = ini.section(Some("network")) {
            if let Some(v) = section.get("http-min-port") {
                cfg.network.http_min_port = parse_port(v)?;
            }
            if let Some(v) = section.get("http-max-port") {
                cfg.network.http_max_port = parse_port(v)?;
            }
            if let Some(v) = section.get("dns-sd") {
                cfg.network.dns_sd = ini_ext::parse_bool(v)?;
            }
            if let Some(v) = section.get("interface") {
                cfg.network.interface = match v.trim().to_ascii_lowercase().as_str() {
                    "all" => Interface::All,
                    "loopback" => Interface::Loopback,
                    other => {
                        return Err(Error::Configuration(format!(
                            "invalid interface value {other:?}"
                        )));
                    }
                };
            }
            if let Some(v) = section.get("ipv6") {
                cfg.network.ipv6 = ini_ext::parse_bool(v)?;
            }
        }

        if let Some(section) = ini.section(Some("logging")) {
            if let Some(v) = section.get("device-log") {
                cfg.logging.device_log = LogFacility::parse_list(v)?;
            }
            if let Some(v) = section.get("main-log") {
                cfg.logging.main_log = LogFacility::parse_list(v)?;
            }
            if let Some(v) = section.get("console-log") {
                cfg.logging.console_log = LogFacility::parse_list(v)?;
            }
            if let Some(v) = section.get("max-file-size") {
                cfg.logging.max_file_size = ini_ext::parse_byte_size(v)?;
            }
            if let Some(v) = section.get("max-backup-files") {
                cfg.logging.max_backup_files = v
                    .parse()
                    .map_err(|_| Error::Configuration(format!("invalid max-backup-files {v:?}")))?;
            }
            if let Some(v) = section.get("console-color") {
                cfg.logging.console_color = ini_ext::parse_bool(v)?;
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.network.http_min_port == 0 || self.network.http_max_port == 0 {
            return Err(Error::Configuration("ports must be in 1..65535".into()));
        }
        if self.network.http_min_port >= self.network.http_max_port {
            return Err(Error::Configuration(
                "http-min-port must be less than http-max-port".into(),
            ));
        }
        Ok(())
    }
}

fn parse_port(value: &str) -> Result<u16> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Configuration(format!("invalid port {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn parses_network_and_logging_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ipp-usb.conf");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            "[network]\nhttp-min-port = 60000\nhttp-max-port = 60100\ndns-sd = disable\ninterface = all\nipv6 = disable\n\n[logging]\ndevice-log = error,info\nmax-file-size = 64K\nmax-backup-files = 3\nconsole-color = disable\n"
        )
        .unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.network.http_min_port, 60000);
        assert_eq!(cfg.network.http_max_port, 60100);
        assert!(!cfg.network.dns_sd);
        assert_eq!(cfg.network.interface, Interface::All);
        assert!(!cfg.network.ipv6);
        assert_eq!(cfg.logging.max_file_size, 64 * 1024);
        assert_eq!(cfg.logging.max_backup_files, 3);
        assert!(!cfg.logging.console_color);
    }

    #[test]
    fn rejects_inverted_port_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ipp-usb.conf");
        std::fs::write(&path, "[network]\nhttp-min-port = 100\nhttp-max-port = 50\n").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
