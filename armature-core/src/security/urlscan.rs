//! Crawler and exploit-scan detection
//!
//! Classifies a request as hostile when its URL probes a known-vulnerable
//! path or its user agent belongs to a published list of scan tools. A hit
//! bans the client IP for the configured duration; banned clients are
//! rejected outright until the ban lapses.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

/// URL patterns typically probed by exploit scanners.
const WEB_EXPLOITS: &[&str] = &[
    r".*\.php",
    r".*phpMyAdmin.*",
    r".*/wp-admin/.*",
    r".*/wp-content/.*",
    r".*/mysqldumper.*",
    r".*/cgi-bin/.*",
    r".*/admin/mysql/.*",
    r".*/\.env",
    r".*/\.git/.*",
];

/// User agents of known bad bots, spiders and pen-test tools.
const SCANNER_AGENTS: &[&str] = &[
    ".*acunetix.*",
    ".*webshag.*",
    ".*sqlmap.*",
    ".*nikto.*",
    ".*masscan.*",
    ".*nmap.*",
    "Alligator",
    "AlphaBot",
    "Arachmo",
    "Arachnophilia",
    "ArchiveBot",
    "AskQuickly",
    "Asterias",
    "Attach",
    "Autonomy",
    "ZmEu",
];

/// Detector with its owned banned-IP set.
pub struct UrlScanner {
    ban_duration: Duration,
    banned: RwLock<HashMap<String, DateTime<Utc>>>,
    agents: Vec<Regex>,
    exploits: Vec<Regex>,
}

impl UrlScanner {
    /// Create a scanner banning hits for `ban_duration` (zero falls back to
    /// five minutes).
    pub fn new(ban_duration: Duration) -> Self {
        let ban_duration =
            if ban_duration.is_zero() { Duration::from_secs(300) } else { ban_duration };
        Self {
            ban_duration,
            banned: RwLock::new(HashMap::new()),
            agents: compile(SCANNER_AGENTS),
            exploits: compile(WEB_EXPLOITS),
        }
    }

    /// True when the request looks like a crawler or exploit probe. A
    /// positive user-agent or URL match bans the IP as a side effect.
    pub fn is_crawler(&self, url: &str, ip: &str, user_agent: &str) -> bool {
        if let Some(ban_time) = self.ban_time(ip) {
            let ban = chrono::Duration::from_std(self.ban_duration)
                .unwrap_or_else(|_| chrono::Duration::zero());
            if ban_time + ban > Utc::now() {
                return true;
            }
        }

        if self.agents.iter().any(|re| re.is_match(user_agent)) {
            self.ban(ip);
            return true;
        }
        if self.exploits.iter().any(|re| re.is_match(url)) {
            self.ban(ip);
            return true;
        }
        false
    }

    /// Insert an IP into the banned set with the current time.
    pub fn ban(&self, ip: &str) {
        self.banned
            .write()
            .expect("banned set lock poisoned")
            .insert(ip.to_string(), Utc::now());
    }

    fn ban_time(&self, ip: &str) -> Option<DateTime<Utc>> {
        self.banned.read().expect("banned set lock poisoned").get(ip).copied()
    }
}

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().filter_map(|p| Regex::new(p).ok()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exploit_urls_ban_the_caller() {
        let scanner = UrlScanner::new(Duration::from_secs(3600));

        assert!(scanner.is_crawler("/wp-admin/setup.php", "203.0.113.5", "Mozilla/5.0"));
        // follow-up request with an innocent URL is still banned
        assert!(scanner.is_crawler("/healthcheck", "203.0.113.5", "Mozilla/5.0"));
        // other clients unaffected
        assert!(!scanner.is_crawler("/healthcheck", "203.0.113.6", "Mozilla/5.0"));
    }

    #[test]
    fn scanner_user_agents_are_detected() {
        let scanner = UrlScanner::new(Duration::from_secs(3600));
        assert!(scanner.is_crawler("/", "198.51.100.2", "sqlmap/1.5"));
        assert!(scanner.is_crawler("/", "198.51.100.3", "acunetix-scanner"));
        assert!(!scanner.is_crawler("/", "198.51.100.4", "Mozilla/5.0"));
    }

    #[test]
    fn bans_expire() {
        let scanner = UrlScanner::new(Duration::from_millis(30));
        scanner.is_crawler("/phpMyAdmin/index", "198.51.100.9", "Mozilla/5.0");
        assert!(scanner.is_crawler("/", "198.51.100.9", "Mozilla/5.0"));

        std::thread::sleep(Duration::from_millis(60));
        assert!(!scanner.is_crawler("/", "198.51.100.9", "Mozilla/5.0"));
    }

    #[test]
    fn honeypot_style_manual_ban() {
        let scanner = UrlScanner::new(Duration::from_secs(3600));
        scanner.ban("198.51.100.77");
        assert!(scanner.is_crawler("/", "198.51.100.77", "Mozilla/5.0"));
    }
}
