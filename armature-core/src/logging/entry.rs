//! Log entries
//!
//! Entries are pooled and reused: the queue consumer hands them back after
//! formatting, so steady-state logging allocates nothing. Tags are encoded
//! into a single buffer as `key="value"` pairs joined by a NUL sentinel the
//! formatters split on.

use super::Level;
use chrono::{DateTime, Utc};
use std::fmt::Write;

/// Sentinel between encoded tag pairs.
pub(crate) const TAG_SEP: char = '\0';

/// A log entry with its metadata.
#[derive(Debug, Clone)]
pub struct Entry {
    pub level: Level,
    pub time: DateTime<Utc>,
    /// `key="value"` pairs joined by [`TAG_SEP`]
    pub tags: String,
    pub message: String,
}

impl Default for Entry {
    fn default() -> Self {
        Self { level: Level::Info, time: Utc::now(), tags: String::new(), message: String::new() }
    }
}

impl Entry {
    /// Prepare a pooled entry for reuse.
    pub fn reset(&mut self, level: Level) {
        self.level = level;
        self.time = Utc::now();
        self.tags.clear();
        self.message.clear();
    }

    /// Attach a tag to the entry.
    pub fn tag(&mut self, key: &str, value: &str) -> &mut Self {
        let _ = write!(self.tags, "{}=\"{}\"{}", key, value, TAG_SEP);
        self
    }

    /// Iterate decoded `(key, value)` tag pairs.
    pub fn tag_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tags.split(TAG_SEP).filter(|part| !part.is_empty()).filter_map(|part| {
            let (key, value) = part.split_once('=')?;
            Some((key, value.trim_matches('"')))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_roundtrip() {
        let mut entry = Entry::default();
        entry.tag("a", "1").tag("b", "two");

        let pairs: Vec<_> = entry.tag_pairs().collect();
        assert_eq!(pairs, vec![("a", "1"), ("b", "two")]);
    }

    #[test]
    fn reset_clears_buffers() {
        let mut entry = Entry::default();
        entry.tag("a", "1");
        entry.message.push_str("hello");

        entry.reset(Level::Error);
        assert_eq!(entry.level, Level::Error);
        assert!(entry.tags.is_empty());
        assert!(entry.message.is_empty());
    }
}
