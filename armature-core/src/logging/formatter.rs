//! Log formatters

use super::entry::{Entry, TAG_SEP};
use serde_json::json;
use std::fmt::Write;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.4f";

/// Renders an [`Entry`] into the bytes a writer receives.
pub trait Formatter {
    fn format(&self, entry: &Entry) -> Vec<u8>;
}

/// Produces no bytes; entries are consumed and dropped.
pub struct NilFormatter;

impl Formatter for NilFormatter {
    fn format(&self, _entry: &Entry) -> Vec<u8> {
        Vec::new()
    }
}

/// `[time] LEVEL key="v" ... message\n`
#[derive(Default)]
pub struct TextFormatter {
    /// Tags prepended to every entry, pre-encoded.
    defaults: String,
}

impl TextFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a default tag emitted on every entry.
    pub fn with_default(mut self, key: &str, value: &str) -> Self {
        let _ = write!(self.defaults, "{}=\"{}\"{}", key, value, TAG_SEP);
        self
    }
}

impl Formatter for TextFormatter {
    fn format(&self, entry: &Entry) -> Vec<u8> {
        let mut buf = String::new();
        let _ = write!(buf, "[{}] {} ", entry.time.format(TIME_FORMAT), entry.level);
        if !self.defaults.is_empty() {
            buf.push_str(&self.defaults.replace(TAG_SEP, " "));
        }
        if !entry.tags.is_empty() {
            buf.push_str(&entry.tags.replace(TAG_SEP, " "));
        }
        buf.push_str(&sanitize(&entry.message));
        buf.push('\n');
        buf.into_bytes()
    }
}

/// JSON object with level, date, tags and message fields.
#[derive(Default)]
pub struct JsonFormatter {
    defaults: Vec<(String, String)>,
}

impl JsonFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default(mut self, key: &str, value: &str) -> Self {
        self.defaults.push((key.to_string(), value.to_string()));
        self
    }
}

impl Formatter for JsonFormatter {
    fn format(&self, entry: &Entry) -> Vec<u8> {
        let mut msg = serde_json::Map::new();
        msg.insert("level".to_string(), json!(entry.level.as_str()));
        msg.insert("date".to_string(), json!(entry.time.to_rfc3339()));
        for (key, value) in &self.defaults {
            msg.insert(key.clone(), json!(value));
        }
        for (key, value) in entry.tag_pairs() {
            msg.insert(key.to_string(), json!(value));
        }
        msg.insert("message".to_string(), json!(entry.message));
        serde_json::to_vec(&msg).unwrap_or_default()
    }
}

/// Strip CR and escape LF so an entry cannot forge extra log lines.
fn sanitize(message: &str) -> String {
    message.replace('\r', "").replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::Level;

    fn entry() -> Entry {
        let mut e = Entry::default();
        e.reset(Level::Info);
        e.tag("user", "alice");
        e.message.push_str("logged in");
        e
    }

    #[test]
    fn nil_formatter_emits_nothing() {
        assert!(NilFormatter.format(&entry()).is_empty());
    }

    #[test]
    fn text_format_shape() {
        let out = String::from_utf8(TextFormatter::new().format(&entry())).unwrap();
        assert!(out.starts_with('['));
        assert!(out.contains(" INFO "));
        assert!(out.contains("user=\"alice\""));
        assert!(out.ends_with("logged in\n"));
    }

    #[test]
    fn text_format_escapes_newlines() {
        let mut e = entry();
        e.message.push_str("\nFAKE line");
        let out = String::from_utf8(TextFormatter::new().format(&e)).unwrap();
        assert_eq!(out.matches('\n').count(), 1);
    }

    #[test]
    fn json_format_fields() {
        let out = JsonFormatter::new().with_default("service", "api").format(&entry());
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();

        assert_eq!(value["level"], "INFO");
        assert_eq!(value["service"], "api");
        assert_eq!(value["user"], "alice");
        assert_eq!(value["message"], "logged in");
        assert!(value["date"].is_string());
    }
}
