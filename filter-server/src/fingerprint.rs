use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use sha2::{Digest, Sha256};
use std::fmt;

/// One-way identifier of a (sender, recipient) pair.
///
/// SHA-256 over `sender`, a newline and `recipient`, base64url encoded
/// without padding. A newline can never appear inside a protocol field, so
/// distinct pairs never hash the same input.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(sender: &str, recipient: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(sender.as_bytes());
        hasher.update(b"\n");
        hasher.update(recipient.as_bytes());

        Fingerprint(URL_SAFE_NO_PAD.encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() {
        assert_eq!(
            Fingerprint::new("alice@example.com", "bob@example.com"),
            Fingerprint::new("alice@example.com", "bob@example.com")
        );
    }

    #[test]
    fn test_distinct_pairs() {
        let pairs = [
            ("alice@example.com", "bob@example.com"),
            ("bob@example.com", "alice@example.com"),
            ("alice@example.com", "bob@example.org"),
            ("alice@example.co", "mbob@example.com"),
            ("", "alice@example.combob@example.com"),
        ];

        for (i, a) in pairs.iter().enumerate() {
            for b in &pairs[i + 1..] {
                assert_ne!(
                    Fingerprint::new(a.0, a.1),
                    Fingerprint::new(b.0, b.1),
                    "{:?} and {:?} collide",
                    a,
                    b
                );
            }
        }
    }

    #[test]
    fn test_does_not_leak_addresses() {
        let fingerprint = Fingerprint::new("alice@example.com", "bob@example.com");
        let s = fingerprint.as_str();

        assert!(!s.contains("alice"));
        assert!(!s.contains("bob"));
        assert!(!s.contains("example"));
        assert!(!s.contains('@'));
    }

    #[test]
    fn test_compact_and_printable() {
        let fingerprint = Fingerprint::new("alice@example.com", "bob@example.com");

        // 32 bytes of digest, unpadded base64.
        assert_eq!(fingerprint.as_str().len(), 43);
        assert!(fingerprint
            .as_str()
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_eq!(fingerprint.to_string(), fingerprint.as_str());
    }

    #[test]
    fn test_known_vector() {
        // sha256("\n") = 01ba4719c80b6fe911b091a7c05124b64eeece964e09c058ef8f9805daca546b
        assert_eq!(
            Fingerprint::new("", "").as_str(),
            "AbpHGcgLb-kRsJGnwFEktk7uzpZOCcBY74-YBdrKVGs"
        );
    }
}
