//! Small helpers around the `ini` crate shared by `config.rs`, `quirks.rs`
//! and `device_state.rs`.
//!
//! The INI tokenizer itself is an external collaborator; everything here is
//! just parsing conventions common to all of ipp-usb's on-disk formats:
//! booleans spelled `enable`/`disable` or `true`/`false`, durations with a
//! bare integer meaning milliseconds, and byte sizes with `K`/`M` suffixes.

use std::path::Path;
use std::time::Duration;

use ini::Ini;

use crate::error::{Error, Result};

pub fn load(path: &Path) -> Result<Ini> {
    Ini::load_from_file(path).map_err(|e| Error::Configuration(format!("{}: {e}", path.display())))
}

/// Parse `enable`/`disable`/`true`/`false`/`yes`/`no` (case-insensitive).
pub fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "enable" | "true" | "yes" | "1" => Ok(true),
        "disable" | "false" | "no" | "0" => Ok(false),
        other => Err(Error::Configuration(format!(
            "invalid boolean value {other:?}"
        ))),
    }
}

/// Parse a duration. A bare integer is milliseconds; `s`, `ms`, `us` suffixes
/// are also accepted since quirk files sometimes spell it out.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    let (digits, unit) = split_numeric_suffix(value);
    let n: u64 = digits
        .parse()
        .map_err(|_| Error::Configuration(format!("invalid duration {value:?}")))?;

    match unit.to_ascii_lowercase().as_str() {
        "" | "ms" => Ok(Duration::from_millis(n)),
        "s" => Ok(Duration::from_secs(n)),
        "us" => Ok(Duration::from_micros(n)),
        other => Err(Error::Configuration(format!(
            "unknown duration suffix {other:?} in {value:?}"
        ))),
    }
}

/// Parse a byte size with an optional `K` or `M` suffix (base 1024).
pub fn parse_byte_size(value: &str) -> Result<u64> {
    let value = value.trim();
    let (digits, unit) = split_numeric_suffix(value);
    let n: u64 = digits
        .parse()
        .map_err(|_| Error::Configuration(format!("invalid byte size {value:?}")))?;

    match unit.to_ascii_uppercase().as_str() {
        "" => Ok(n),
        "K" => Ok(n * 1024),
        "M" => Ok(n * 1024 * 1024),
        other => Err(Error::Configuration(format!(
            "unknown size suffix {other:?} in {value:?}"
        ))),
    }
}

/// Split a value like `"250ms"` or `"64K"` into its numeric and suffix parts.
fn split_numeric_suffix(value: &str) -> (&str, &str) {
    let split_at = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    value.split_at(split_at)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_variants() {
        assert!(parse_bool("enable").unwrap());
        assert!(parse_bool("true").unwrap());
        assert!(!parse_bool("disable").unwrap());
        assert!(!parse_bool("false").unwrap());
        assert!(parse_bool("maybe").is_err());
    }

    #[test]
    fn duration_variants() {
        assert_eq!(parse_duration("250").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
    }

    #[test]
    fn byte_size_variants() {
        assert_eq!(parse_byte_size("100").unwrap(), 100);
        assert_eq!(parse_byte_size("64K").unwrap(), 64 * 1024);
        assert_eq!(parse_byte_size("2M").unwrap(), 2 * 1024 * 1024);
    }
}
