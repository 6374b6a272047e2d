// Multicore Virtual Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

pub mod platform;
pub mod properties;

pub use platform::{
    AddressRange, CoreConfig, DeviceConfig, DeviceKind, IrqCores, KernelConfig, MemoryConfig,
    PlatformConfig,
};
pub use properties::{
    ArgProvider, DefaultProvider, EnvProvider, FileProvider, PropertyProvider, PropertyStore,
};

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for property '{key}': {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
    #[error("malformed property assignment '{0}', expected <key>=<value>")]
    MalformedAssignment(String),
    #[error("regions '{first}' {first_range} and '{second}' {second_range} overlap")]
    OverlappingRanges {
        first: String,
        first_range: AddressRange,
        second: String,
        second_range: AddressRange,
    },
    #[error("file '{path}' configured by '{key}' does not exist")]
    MissingFile { key: String, path: PathBuf },
    #[error("core count must be between 1 and {max}, got {got}")]
    InvalidCoreCount { got: usize, max: usize },
    #[error("quantum must be non-zero")]
    ZeroQuantum,
    #[error("core {core} routes '{device}' to line {line}, but only lines 0..{max} exist")]
    InvalidIrqLine {
        core: usize,
        device: String,
        line: u32,
        max: u32,
    },
    #[error("failed to read configuration file {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration file {path:?}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Parses a human readable byte size such as `8KiB`, `128MiB` or a plain number.
pub fn parse_size(size_str: &str) -> anyhow::Result<u64> {
    use human_size::{Byte, Size, SpecificSize};
    let trimmed = size_str.trim();
    if let Ok(v) = parse_u64(trimmed) {
        return Ok(v);
    }
    let s: Size = trimmed
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid size format: {}", e))?;
    let bytes: SpecificSize<Byte> = s.into();
    Ok(bytes.value() as u64)
}

/// Parses decimal or `0x`-prefixed hexadecimal integers, allowing `_` separators.
pub fn parse_u64(s: &str) -> Result<u64, String> {
    let cleaned: String = s.trim().chars().filter(|c| *c != '_').collect();
    if let Some(hex) = cleaned
        .strip_prefix("0x")
        .or_else(|| cleaned.strip_prefix("0X"))
    {
        u64::from_str_radix(hex, 16).map_err(|e| format!("invalid hex number '{}': {}", s, e))
    } else {
        u64::from_str(&cleaned).map_err(|e| format!("invalid number '{}': {}", s, e))
    }
}

pub fn parse_bool(s: &str) -> Result<bool, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(format!("'{}' is not a boolean", other)),
    }
}

/// Parses a time such as `1us`, `2.5ms`, `10ns`, `250ps`, `1s` or `0` into
/// picoseconds.
pub fn parse_time_ps(s: &str) -> Result<u64, String> {
    let t = s.trim();
    let split = t
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(t.len());
    let (num, unit) = t.split_at(split);
    let value: f64 = num
        .trim()
        .parse()
        .map_err(|_| format!("invalid time value '{}'", s))?;
    if value < 0.0 || !value.is_finite() {
        return Err(format!("time '{}' must be a finite positive value", s));
    }
    let scale: f64 = match unit.trim() {
        "" | "s" | "sec" => 1e12,
        "ms" => 1e9,
        "us" => 1e6,
        "ns" => 1e3,
        "ps" => 1.0,
        other => return Err(format!("unknown time unit '{}'", other)),
    };
    let ps = (value * scale).round();
    if ps >= u64::MAX as f64 {
        return Err(format!("time '{}' is out of range", s));
    }
    Ok(ps as u64)
}

/// Parses a configuration time with nanosecond resolution. Zero means
/// "none", so a non-zero value below 1 ns is rejected rather than rounded
/// down to it.
pub fn parse_time(s: &str) -> Result<Duration, String> {
    let ps = parse_time_ps(s)?;
    let ns = ps / 1000 + u64::from(ps % 1000 >= 500);
    if ps != 0 && ns == 0 {
        return Err(format!("time '{}' is below the 1 ns resolution", s));
    }
    Ok(Duration::from_nanos(ns))
}

/// Parses a frequency such as `100MHz`, `32.768kHz` or a plain Hz value.
pub fn parse_frequency(s: &str) -> Result<u64, String> {
    let t = s.trim();
    let lower = t.to_ascii_lowercase();
    let (num, scale) = if let Some(n) = lower.strip_suffix("ghz") {
        (n, 1e9)
    } else if let Some(n) = lower.strip_suffix("mhz") {
        (n, 1e6)
    } else if let Some(n) = lower.strip_suffix("khz") {
        (n, 1e3)
    } else if let Some(n) = lower.strip_suffix("hz") {
        (n, 1.0)
    } else {
        (lower.as_str(), 1.0)
    };
    let value: f64 = num
        .trim()
        .parse()
        .map_err(|_| format!("invalid frequency '{}'", s))?;
    let hz = (value * scale).round();
    if hz < 1.0 {
        return Err(format!("frequency '{}' must be at least 1Hz", s));
    }
    Ok(hz as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_u64_hex_and_decimal() {
        assert_eq!(parse_u64("0x9000_0000").unwrap(), 0x9000_0000);
        assert_eq!(parse_u64("42").unwrap(), 42);
        assert!(parse_u64("0xZZ").is_err());
    }

    #[test]
    fn test_parse_size_units() {
        assert_eq!(parse_size("8KiB").unwrap(), 8192);
        assert_eq!(parse_size("128MiB").unwrap(), 128 * 1024 * 1024);
        assert_eq!(parse_size("0x2000").unwrap(), 0x2000);
    }

    #[test]
    fn test_parse_time_units() {
        assert_eq!(parse_time("1us").unwrap(), Duration::from_micros(1));
        assert_eq!(parse_time("2.5ms").unwrap(), Duration::from_micros(2500));
        assert_eq!(parse_time("10ns").unwrap(), Duration::from_nanos(10));
        assert_eq!(parse_time("0").unwrap(), Duration::ZERO);
        assert!(parse_time("3 fortnights").is_err());
        assert!(parse_time("1ps").is_err());
        assert!(parse_time("0ps").unwrap().is_zero());
        assert_eq!(parse_time("1500ps").unwrap(), Duration::from_nanos(2));
        assert_eq!(parse_time_ps("2.5ns").unwrap(), 2500);
    }

    #[test]
    fn test_parse_frequency() {
        assert_eq!(parse_frequency("100MHz").unwrap(), 100_000_000);
        assert_eq!(parse_frequency("32.768kHz").unwrap(), 32_768);
        assert_eq!(parse_frequency("50000000").unwrap(), 50_000_000);
        assert!(parse_frequency("0Hz").is_err());
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("true").unwrap());
        assert!(!parse_bool("Off").unwrap());
        assert!(parse_bool("maybe").is_err());
    }
}
