//! Decoding helpers for the scalar config types that are strings on the wire:
//! durations (`"150ms"`, `"1m30s"`) and signal names (`"SIGHUP"`).

use std::time::Duration;

use nix::sys::signal::Signal;
use serde::{Deserialize, Deserializer};

use crate::error::ConfigError;

/// Parses a human-readable duration: one or more `<number><unit>` segments
/// with units `ns`, `us`, `ms`, `s`, `m`, `h`. Fractions are allowed
/// (`"1.5s"`).
pub fn parse_duration(value: &str) -> Result<Duration, ConfigError> {
    let err = || ConfigError::InvalidDuration {
        value: value.to_string(),
    };

    let s = value.trim();
    if s.is_empty() {
        return Err(err());
    }

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(err)?;
        if num_len == 0 {
            return Err(err());
        }
        let number: f64 = rest[..num_len].parse().map_err(|_| err())?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let factor = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(err()),
        };
        rest = &rest[unit_len..];

        total += number * factor;
    }

    if !total.is_finite() || total < 0.0 {
        return Err(err());
    }
    Ok(Duration::from_secs_f64(total))
}

/// Parses a signal name. `"SIGHUP"`, `"sighup"` and `"HUP"` all resolve to
/// `Signal::SIGHUP`.
pub fn parse_signal(value: &str) -> Result<Signal, ConfigError> {
    let mut name = value.trim().to_ascii_uppercase();
    if !name.starts_with("SIG") {
        name.insert_str(0, "SIG");
    }
    name.parse::<Signal>()
        .map_err(|_| ConfigError::InvalidSignal {
            value: value.to_string(),
        })
}

pub fn opt_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)?
        .map(|s| parse_duration(&s).map_err(serde::de::Error::custom))
        .transpose()
}

pub fn opt_signal<'de, D>(deserializer: D) -> Result<Option<Signal>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)?
        .map(|s| parse_signal(&s).map_err(serde::de::Error::custom))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_units() {
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn compound_and_fractional() {
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("5parsecs").is_err());
    }

    #[test]
    fn signal_names() {
        assert_eq!(parse_signal("SIGHUP").unwrap(), Signal::SIGHUP);
        assert_eq!(parse_signal("sigterm").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("USR1").unwrap(), Signal::SIGUSR1);
        assert!(parse_signal("SIGNOPE").is_err());
    }
}
