//! IP list matching
//!
//! Patterns understood, in the order they are tried:
//! - `*` matches anything
//! - CIDR blocks (`192.168.1.0/24`, `fc00::/7`)
//! - ranges: full `10.0.0.1-10.0.0.99` or last-octet `10.0.0.1-99`
//! - wildcards: `10.0.*.*` (each `*` spans 0..=255)
//! - exact addresses

use ipnet::IpNet;
use std::net::IpAddr;

/// True when `ip` matches any pattern in the list.
pub fn matches(ip: &str, patterns: &[impl AsRef<str>]) -> bool {
    let Ok(addr) = ip.parse::<IpAddr>() else {
        return false;
    };
    patterns.iter().any(|pattern| matches_one(addr, pattern.as_ref().trim()))
}

/// List membership with the policy switches made explicit: an empty list
/// matches everything, and `allow_private` short-circuits loopback and
/// RFC 1918 clients to true. Used for whitelists, where a locally issued
/// request should never lock the operator out.
pub fn ip_in_range(ip: &str, patterns: &[impl AsRef<str>], allow_private: bool) -> bool {
    if patterns.is_empty() {
        return true;
    }
    if allow_private {
        if let Ok(addr) = ip.parse::<IpAddr>() {
            if is_private(addr) {
                return true;
            }
        }
    }
    matches(ip, patterns)
}

fn is_private(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

fn matches_one(addr: IpAddr, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if pattern.contains('/') {
        return cidr_match(addr, pattern);
    }
    if pattern.contains('-') {
        return range_match(addr, pattern);
    }
    if pattern.contains('*') {
        return wildcard_match(addr, pattern);
    }
    pattern.parse::<IpAddr>().map(|p| p == addr).unwrap_or(false)
}

fn cidr_match(addr: IpAddr, pattern: &str) -> bool {
    pattern.parse::<IpNet>().map(|net| net.contains(&addr)).unwrap_or(false)
}

/// `A.B.C.D-E` bounds the last octet; `A.B.C.D-W.X.Y.Z` is a full inclusive
/// range.
fn range_match(addr: IpAddr, pattern: &str) -> bool {
    let cleaned: String = pattern.split_whitespace().collect();
    let Some((from, to)) = cleaned.split_once('-') else {
        return false;
    };
    let Ok(from) = from.parse::<IpAddr>() else {
        return false;
    };
    let to = match to.parse::<IpAddr>() {
        Ok(full) => full,
        // last-octet shorthand: rebuild the upper bound from the lower one
        Err(_) => {
            let Ok(last) = to.parse::<u8>() else {
                return false;
            };
            let IpAddr::V4(base) = from else {
                return false;
            };
            let mut octets = base.octets();
            octets[3] = last;
            IpAddr::from(octets)
        }
    };
    between(from, to, addr)
}

/// `A.B.*.*` expands each wildcard octet to its 0 and 255 bounds and
/// range-tests the candidate.
fn wildcard_match(addr: IpAddr, pattern: &str) -> bool {
    let from = pattern.replace('*', "0");
    let to = pattern.replace('*', "255");
    match (from.parse::<IpAddr>(), to.parse::<IpAddr>()) {
        (Ok(from @ IpAddr::V4(_)), Ok(to)) => between(from, to, addr),
        _ => false,
    }
}

/// Inclusive range test over the 16-byte forms, so mixed v4/v6 comparisons
/// behave like byte comparison of mapped addresses.
fn between(from: IpAddr, to: IpAddr, addr: IpAddr) -> bool {
    let widen = |a: IpAddr| -> [u8; 16] {
        match a {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        }
    };
    let (from, to, addr) = (widen(from), widen(to), widen(addr));
    addr >= from && addr <= to
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        assert!(matches("10.1.2.3", &["10.1.2.3"]));
        assert!(!matches("10.1.2.4", &["10.1.2.3"]));
        assert!(matches("::1", &["::1"]));
    }

    #[test]
    fn cidr_match_v4() {
        assert!(matches("192.168.1.100", &["192.168.1.0/24"]));
        assert!(!matches("192.168.2.100", &["192.168.1.0/24"]));
    }

    #[test]
    fn last_octet_range() {
        assert!(matches("10.0.0.5", &["10.0.0.1-9"]));
        assert!(!matches("10.0.0.10", &["10.0.0.1-9"]));
    }

    #[test]
    fn full_range() {
        assert!(matches("10.0.1.200", &["10.0.0.0-10.0.2.0"]));
        assert!(!matches("10.0.3.1", &["10.0.0.0-10.0.2.0"]));
    }

    #[test]
    fn wildcard() {
        assert!(matches("172.16.3.4", &["172.16.*.*"]));
        assert!(!matches("172.17.3.4", &["172.16.*.*"]));
    }

    #[test]
    fn catch_all() {
        assert!(matches("8.8.8.8", &["*"]));
    }

    #[test]
    fn garbage_candidate_never_matches() {
        assert!(!matches("not-an-ip", &["*"]));
    }

    #[test]
    fn empty_list_allows_everyone() {
        let empty: &[&str] = &[];
        assert!(ip_in_range("8.8.8.8", empty, false));
    }

    #[test]
    fn private_allowance_is_a_flag() {
        let list = &["203.0.113.7"];
        assert!(ip_in_range("127.0.0.1", list, true));
        assert!(ip_in_range("10.9.9.9", list, true));
        assert!(ip_in_range("192.168.0.12", list, true));
        assert!(ip_in_range("::1", list, true));

        assert!(!ip_in_range("127.0.0.1", list, false));
        assert!(!ip_in_range("10.9.9.9", list, false));
    }
}
