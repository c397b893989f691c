//! Self-checked session tokens
//!
//! A token is 16 bytes of cryptographic randomness followed by the big-endian
//! CRC32 of those bytes, hex-encoded: 40 lowercase characters total. The
//! trailing checksum lets the server reject malformed or tampered tokens
//! without touching the store.

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// 40-hex-char self-checked identifier used for sessions and CSRF.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    /// Generate a fresh token.
    pub fn generate() -> Self {
        let mut buf = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut buf[..16]);
        let checksum = crc32fast::hash(&buf[..16]);
        buf[16..].copy_from_slice(&checksum.to_be_bytes());
        Token(hex::encode(buf))
    }

    /// Wrap an untrusted string. Call [`is_valid`](Self::is_valid) before use.
    pub fn from_string(raw: impl Into<String>) -> Self {
        Token(raw.into())
    }

    /// True when the token parses and its checksum matches.
    pub fn is_valid(&self) -> bool {
        if self.0.len() != 40 {
            return false;
        }
        let Ok(data) = hex::decode(&self.0[..32]) else {
            return false;
        };
        let Ok(tail) = hex::decode(&self.0[32..]) else {
            return false;
        };
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&tail);
        crc32fast::hash(&data) == u32::from_be_bytes(checksum)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Token {
    fn from(raw: &str) -> Self {
        Token(raw.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_validate() {
        for _ in 0..64 {
            let token = Token::generate();
            assert_eq!(token.as_str().len(), 40);
            assert!(token.is_valid(), "token {} failed validation", token);
        }
    }

    #[test]
    fn flipping_any_digit_invalidates() {
        let token = Token::generate();
        let original = token.as_str().to_string();
        for idx in 0..original.len() {
            let mut chars: Vec<char> = original.chars().collect();
            chars[idx] = if chars[idx] == '0' { '1' } else { '0' };
            let mutated = Token::from_string(chars.into_iter().collect::<String>());
            assert!(!mutated.is_valid(), "mutation at {} still validated", idx);
        }
    }

    #[test]
    fn malformed_tokens_are_invalid() {
        assert!(!Token::from_string("").is_valid());
        assert!(!Token::from_string("zz".repeat(20)).is_valid());
        assert!(!Token::from_string("ab".repeat(19)).is_valid());
    }
}
