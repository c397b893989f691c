//! Flat configuration registry
//!
//! Loading and parsing configuration files is the host application's job;
//! it hands the server a flat `key = value` map. This module holds that map
//! and the typed accessors the component configs are built from, including
//! the duration ("30s", "5h", "3d") and byte-size ("100MB") literals the
//! defaults use.

use std::collections::HashMap;
use std::time::Duration;

/// Flat key→string configuration map with typed accessors.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    values: HashMap<String, String>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    /// Set a value, returning the previous one if present.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.values.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// String value or the given default.
    pub fn str_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    /// Boolean value or the given default. Accepts yes/no, true/false, on/off, 1/0.
    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(v) => parse_bool(v).unwrap_or(default),
            None => default,
        }
    }

    /// Integer value or the given default.
    pub fn int_or(&self, key: &str, default: i64) -> i64 {
        self.get(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
    }

    /// Float value or the given default.
    pub fn float_or(&self, key: &str, default: f64) -> f64 {
        self.get(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
    }

    /// Duration literal ("250ms", "30s", "5m", "2h", "3d") or the default.
    pub fn duration_or(&self, key: &str, default: Duration) -> Duration {
        self.get(key).and_then(parse_duration).unwrap_or(default)
    }

    /// Byte-size literal ("512", "64KB", "100MB", "1GB") or the default.
    pub fn size_or(&self, key: &str, default: usize) -> usize {
        self.get(key).and_then(parse_size).unwrap_or(default)
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "yes" | "true" | "on" | "1" => Some(true),
        "no" | "false" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// Parse a duration literal. A bare number is seconds.
pub fn parse_duration(v: &str) -> Option<Duration> {
    let v = v.trim();
    if v.is_empty() {
        return None;
    }
    if let Ok(secs) = v.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let split = v.find(|c: char| !c.is_ascii_digit() && c != '.')?;
    let (num, unit) = v.split_at(split);
    let num: f64 = num.parse().ok()?;
    let secs = match unit.trim().to_ascii_lowercase().as_str() {
        "ms" => num / 1000.0,
        "s" => num,
        "m" => num * 60.0,
        "h" => num * 3600.0,
        "d" => num * 86400.0,
        _ => return None,
    };
    Some(Duration::from_secs_f64(secs))
}

/// Parse a byte-size literal. A bare number is bytes.
pub fn parse_size(v: &str) -> Option<usize> {
    let v = v.trim();
    if let Ok(n) = v.parse::<usize>() {
        return Some(n);
    }
    let split = v.find(|c: char| !c.is_ascii_digit())?;
    let (num, unit) = v.split_at(split);
    let num: usize = num.parse().ok()?;
    let mult = match unit.trim().to_ascii_uppercase().as_str() {
        "B" => 1,
        "KB" | "K" => 1024,
        "MB" | "M" => 1024 * 1024,
        "GB" | "G" => 1024 * 1024 * 1024,
        _ => return None,
    };
    Some(num * mult)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_accessors_fall_back_to_defaults() {
        let mut s = Settings::new();
        s.set("a.flag", "yes");
        s.set("a.port", "8080");

        assert!(s.bool_or("a.flag", false));
        assert!(!s.bool_or("a.missing", false));
        assert_eq!(s.int_or("a.port", 80), 8080);
        assert_eq!(s.int_or("a.missing", 80), 80);
    }

    #[test]
    fn duration_literals() {
        assert_eq!(parse_duration("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("5h"), Some(Duration::from_secs(18_000)));
        assert_eq!(parse_duration("3d"), Some(Duration::from_secs(259_200)));
        assert_eq!(parse_duration("bogus"), None);
    }

    #[test]
    fn size_literals() {
        assert_eq!(parse_size("512"), Some(512));
        assert_eq!(parse_size("64KB"), Some(64 * 1024));
        assert_eq!(parse_size("100MB"), Some(100 * 1024 * 1024));
        assert_eq!(parse_size("oops"), None);
    }
}
