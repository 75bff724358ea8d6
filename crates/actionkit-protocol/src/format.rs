//! Byte and duration formatting shared by the listener results.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::HarnessError;

const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

/// Render a byte count with the largest unit that keeps the value at or
/// above one, rounded to two decimals. The sign is preserved.
pub fn format_bytes(bytes: i64) -> String {
    let sign = if bytes < 0 { "-" } else { "" };
    let magnitude = bytes.unsigned_abs();

    let mut pow = 0;
    let mut scaled = magnitude;
    while scaled >= 1024 && pow < UNITS.len() - 1 {
        scaled /= 1024;
        pow += 1;
    }

    let value = round2(magnitude as f64 / 1024_f64.powi(pow as i32));
    format!("{sign}{value} {}", UNITS[pow])
}

/// Render a duration in milliseconds with up to two decimals.
pub fn format_duration(duration: Duration) -> String {
    format!("{}ms", round2(duration.as_secs_f64() * 1000.0))
}

/// Memory unit accepted by the profile accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryUnit {
    Bytes,
    Kilobytes,
    Megabytes,
    Gigabytes,
    Terabytes,
}

impl MemoryUnit {
    fn divisor(self) -> f64 {
        match self {
            Self::Bytes => 1.0,
            Self::Kilobytes => 1024.0,
            Self::Megabytes => 1024.0 * 1024.0,
            Self::Gigabytes => 1024.0 * 1024.0 * 1024.0,
            Self::Terabytes => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        }
    }

    /// Convert a (possibly negative) byte count into this unit, rounded to
    /// two decimals.
    pub fn convert(self, bytes: i64) -> f64 {
        round2(bytes as f64 / self.divisor())
    }
}

impl FromStr for MemoryUnit {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "B" | "BYTE" | "BYTES" => Ok(Self::Bytes),
            "KB" | "KILOBYTE" | "KILOBYTES" => Ok(Self::Kilobytes),
            "MB" | "MEGABYTE" | "MEGABYTES" => Ok(Self::Megabytes),
            "GB" | "GIGABYTE" | "GIGABYTES" => Ok(Self::Gigabytes),
            "TB" | "TERABYTE" | "TERABYTES" => Ok(Self::Terabytes),
            _ => Err(HarnessError::InvalidUnit(s.to_owned())),
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_pick_the_largest_fitting_unit() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1 KB");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5 MB");
    }

    #[test]
    fn bytes_keep_their_sign() {
        assert_eq!(format_bytes(-2048), "-2 KB");
    }

    #[test]
    fn bytes_cap_at_terabytes() {
        let petabyte = 1024_i64.pow(5);
        assert_eq!(format_bytes(petabyte), "1024 TB");
    }

    #[test]
    fn units_parse_short_and_long_names() {
        assert_eq!("kb".parse::<MemoryUnit>().unwrap(), MemoryUnit::Kilobytes);
        assert_eq!("Megabytes".parse::<MemoryUnit>().unwrap(), MemoryUnit::Megabytes);
        assert_eq!("B".parse::<MemoryUnit>().unwrap(), MemoryUnit::Bytes);
    }

    #[test]
    fn unknown_unit_is_rejected() {
        let err = "PB".parse::<MemoryUnit>().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid unit: PB. Supported units: B, KB, MB, GB, TB"
        );
    }

    #[test]
    fn conversion_rounds_to_two_decimals() {
        assert_eq!(MemoryUnit::Kilobytes.convert(1500), 1.46);
        assert_eq!(MemoryUnit::Megabytes.convert(-3 * 1024 * 1024), -3.0);
    }

    #[test]
    fn durations_render_in_milliseconds() {
        assert_eq!(format_duration(Duration::from_micros(1500)), "1.5ms");
        assert_eq!(format_duration(Duration::from_millis(42)), "42ms");
    }
}
