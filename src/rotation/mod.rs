//! Rotation, retention and compression of file destinations.
//!
//! Policies are plain values. They can be written as human strings
//! (`"10 MB"`, `"00:00"`, `"1 week"`, `"zst"`) and are parsed when the
//! handler is registered.

mod lock;
mod maintenance;
mod manager;
mod path;

pub use self::maintenance::Reporter;
pub use self::manager::RotationManager;
pub use self::path::PathPattern;

use chrono::NaiveTime;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigurationError;

/// When the active file rolls over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    /// Before a write that would push the file past this many bytes.
    Size(u64),
    /// Every day at this wall-clock time.
    Daily(NaiveTime),
    /// Every fixed interval since the file was opened.
    Interval(Duration),
}

/// Which rotated files are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    MaxAge(Duration),
    MaxCount(usize),
}

/// How rotated files are shrunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Zstd,
}

impl Compression {
    pub fn extension(self) -> &'static str {
        match self {
            Compression::Zstd => "zst",
        }
    }
}

/// The full policy of one file destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RotationPolicy {
    pub rotation: Option<Rotation>,
    pub retention: Option<Retention>,
    pub compression: Option<Compression>,
}

/// A typed value, or text to be parsed at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Setting<T> {
    Value(T),
    Text(String),
}

impl<T> Setting<T>
where
    T: FromStr<Err = ConfigurationError>,
{
    pub(crate) fn resolve(self) -> Result<T, ConfigurationError> {
        match self {
            Setting::Value(value) => Ok(value),
            Setting::Text(text) => text.parse(),
        }
    }
}

macro_rules! setting_from {
    ($ty:ty) => {
        impl From<$ty> for Setting<$ty> {
            fn from(value: $ty) -> Self {
                Setting::Value(value)
            }
        }

        impl From<&str> for Setting<$ty> {
            fn from(text: &str) -> Self {
                Setting::Text(text.to_string())
            }
        }

        impl From<String> for Setting<$ty> {
            fn from(text: String) -> Self {
                Setting::Text(text)
            }
        }
    };
}

setting_from!(Rotation);
setting_from!(Retention);
setting_from!(Compression);

impl From<u64> for Setting<Rotation> {
    fn from(bytes: u64) -> Self {
        Setting::Value(Rotation::Size(bytes))
    }
}

impl From<Duration> for Setting<Rotation> {
    fn from(interval: Duration) -> Self {
        Setting::Value(Rotation::Interval(interval))
    }
}

impl From<NaiveTime> for Setting<Rotation> {
    fn from(at: NaiveTime) -> Self {
        Setting::Value(Rotation::Daily(at))
    }
}

impl From<usize> for Setting<Retention> {
    fn from(count: usize) -> Self {
        Setting::Value(Retention::MaxCount(count))
    }
}

impl From<Duration> for Setting<Retention> {
    fn from(age: Duration) -> Self {
        Setting::Value(Retention::MaxAge(age))
    }
}

/// "10 MB", "512KiB", "100 B", "1.5 GB".
fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let number: f64 = number.parse().ok()?;
    let multiplier: f64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1.0,
        "kb" => 1e3,
        "mb" => 1e6,
        "gb" => 1e9,
        "kib" => 1024.0,
        "mib" => 1024.0 * 1024.0,
        "gib" => 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    let bytes = number * multiplier;
    (bytes.is_finite() && bytes >= 1.0).then_some(bytes as u64)
}

/// "00:00", "12:30:15", "daily", "midnight".
fn parse_time_of_day(s: &str) -> Option<NaiveTime> {
    let s = s.trim().to_ascii_lowercase();
    let s = s.strip_prefix("at ").unwrap_or(&s);
    if matches!(s, "daily" | "midnight") {
        return NaiveTime::from_hms_opt(0, 0, 0);
    }
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .ok()
}

/// "1 hour", "30 minutes", "2 days", "1 week", "hourly", "weekly".
fn parse_interval(s: &str) -> Option<Duration> {
    let s = s.trim().to_ascii_lowercase();
    match s.as_str() {
        "hourly" => return Some(Duration::from_secs(3600)),
        "weekly" => return Some(Duration::from_secs(7 * 86_400)),
        _ => {}
    }
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let number: u64 = number.parse().ok()?;
    let unit_secs = match unit.trim() {
        "s" | "sec" | "second" | "seconds" => 1,
        "m" | "min" | "minute" | "minutes" => 60,
        "h" | "hour" | "hours" => 3600,
        "d" | "day" | "days" => 86_400,
        "w" | "week" | "weeks" => 7 * 86_400,
        _ => return None,
    };
    (number > 0).then(|| Duration::from_secs(number * unit_secs))
}

impl FromStr for Rotation {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(bytes) = parse_size(s) {
            return Ok(Rotation::Size(bytes));
        }
        if let Some(at) = parse_time_of_day(s) {
            return Ok(Rotation::Daily(at));
        }
        if let Some(interval) = parse_interval(s) {
            return Ok(Rotation::Interval(interval));
        }
        Err(ConfigurationError::UnknownRotation(s.to_string()))
    }
}

impl FromStr for Retention {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(count) = s.trim().parse::<usize>() {
            return Ok(Retention::MaxCount(count));
        }
        parse_interval(s)
            .map(Retention::MaxAge)
            .ok_or_else(|| ConfigurationError::UnknownRetention(s.to_string()))
    }
}

impl FromStr for Compression {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "zst" | "zstd" => Ok(Compression::Zstd),
            _ => Err(ConfigurationError::UnknownCompression(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_strings() {
        assert_eq!("10 MB".parse::<Rotation>().unwrap(), Rotation::Size(10_000_000));
        assert_eq!("512KiB".parse::<Rotation>().unwrap(), Rotation::Size(524_288));
        assert_eq!("100".parse::<Rotation>().unwrap(), Rotation::Size(100));
        assert_eq!(
            "12:30".parse::<Rotation>().unwrap(),
            Rotation::Daily(NaiveTime::from_hms_opt(12, 30, 0).unwrap())
        );
        assert_eq!(
            "midnight".parse::<Rotation>().unwrap(),
            Rotation::Daily(NaiveTime::from_hms_opt(0, 0, 0).unwrap())
        );
        assert_eq!(
            "2 hours".parse::<Rotation>().unwrap(),
            Rotation::Interval(Duration::from_secs(7200))
        );
        assert_eq!(
            "weekly".parse::<Rotation>().unwrap(),
            Rotation::Interval(Duration::from_secs(604_800))
        );
        assert!(matches!(
            "whenever".parse::<Rotation>(),
            Err(ConfigurationError::UnknownRotation(_))
        ));
        assert!("0 MB".parse::<Rotation>().is_err());
    }

    #[test]
    fn retention_strings() {
        assert_eq!("5".parse::<Retention>().unwrap(), Retention::MaxCount(5));
        assert_eq!(
            "10 days".parse::<Retention>().unwrap(),
            Retention::MaxAge(Duration::from_secs(864_000))
        );
        assert!("forever".parse::<Retention>().is_err());
    }

    #[test]
    fn compression_strings() {
        assert_eq!(".zst".parse::<Compression>().unwrap(), Compression::Zstd);
        assert!(matches!(
            "rar".parse::<Compression>(),
            Err(ConfigurationError::UnknownCompression(_))
        ));
    }

    #[test]
    fn settings_resolve_lazily() {
        let setting: Setting<Rotation> = "1 GB".into();
        assert_eq!(setting.resolve().unwrap(), Rotation::Size(1_000_000_000));
        let setting: Setting<Retention> = 3usize.into();
        assert_eq!(setting.resolve().unwrap(), Retention::MaxCount(3));
        let setting: Setting<Rotation> = "soon".into();
        assert!(setting.resolve().is_err());
    }
}
