//! Handshake identity: a 32-character base-62 token derived once per process start.
//! Distinguishes peers to a human reading the handshake; it is not a credential.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

const BASE62: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Token length in characters (and bytes; the alphabet is ASCII).
pub const TOKEN_LEN: usize = 32;

/// Salt mixed into every token.
pub const DEFAULT_SALT: &str = "m4t-salve-v1";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityToken(String);

impl IdentityToken {
    /// Derive a token from this machine: hardware id (or a timestamp fallback), user name,
    /// a high-resolution clock reading and `salt`.
    pub fn generate(salt: &str) -> Self {
        let hardware = hardware_id().unwrap_or_else(timestamp_fallback);
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_default();
        let counter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        Self::from_parts(&hardware, &user, counter, salt)
    }

    /// Deterministic derivation from explicit inputs.
    pub fn from_parts(hardware: &[u8], user: &str, counter: u128, salt: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(hardware);
        hasher.update(counter.to_be_bytes());
        hasher.update(user.as_bytes());
        hasher.update(salt.as_bytes());
        let digest: [u8; 32] = hasher.finalize().into();
        let mut encoded = encode_base62(&digest);
        if encoded.len() < TOKEN_LEN {
            encoded.insert_str(0, &"0".repeat(TOKEN_LEN - encoded.len()));
        }
        encoded.truncate(TOKEN_LEN);
        IdentityToken(encoded)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Big-endian bytes as a base-62 number, most significant digit first.
fn encode_base62(bytes: &[u8]) -> String {
    let mut num: Vec<u8> = bytes.iter().copied().skip_while(|&b| b == 0).collect();
    let mut digits = Vec::new();
    while !num.is_empty() {
        let mut rem: u32 = 0;
        let mut quotient = Vec::with_capacity(num.len());
        for &byte in &num {
            let acc = (rem << 8) | u32::from(byte);
            let q = (acc / 62) as u8;
            rem = acc % 62;
            if !(quotient.is_empty() && q == 0) {
                quotient.push(q);
            }
        }
        digits.push(BASE62[rem as usize]);
        num = quotient;
    }
    digits.reverse();
    String::from_utf8(digits).unwrap_or_default()
}

/// First non-loopback interface with a real MAC address (Linux sysfs).
///
/// Other platforms have no sysfs and always take the timestamp fallback; the token only has to
/// tell peers apart, so that is accepted rather than probing per-OS APIs.
fn hardware_id() -> Option<Vec<u8>> {
    let entries = std::fs::read_dir("/sys/class/net").ok()?;
    let mut names: Vec<_> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name())
        .filter(|n| n != "lo")
        .collect();
    names.sort();
    names.into_iter().find_map(|name| {
        let path = std::path::Path::new("/sys/class/net")
            .join(&name)
            .join("address");
        let mac = std::fs::read_to_string(path).ok()?;
        let mac = mac.trim();
        if mac.is_empty() || mac == "00:00:00:00:00:00" {
            return None;
        }
        Some(mac.as_bytes().to_vec())
    })
}

fn timestamp_fallback() -> Vec<u8> {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    millis.to_be_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_32_base62_chars() {
        let token = IdentityToken::generate(DEFAULT_SALT);
        assert_eq!(token.as_str().len(), TOKEN_LEN);
        assert!(token.as_str().bytes().all(|b| BASE62.contains(&b)));
    }

    #[test]
    fn derivation_is_deterministic_per_input() {
        let a = IdentityToken::from_parts(b"aa:bb", "alice", 42, DEFAULT_SALT);
        let b = IdentityToken::from_parts(b"aa:bb", "alice", 42, DEFAULT_SALT);
        let c = IdentityToken::from_parts(b"aa:bb", "alice", 43, DEFAULT_SALT);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[cfg(not(target_os = "linux"))]
    #[test]
    fn non_linux_uses_timestamp_fallback() {
        assert!(hardware_id().is_none());
    }

    #[test]
    fn base62_small_values() {
        assert_eq!(encode_base62(&[0, 61]), "z");
        assert_eq!(encode_base62(&[62]), "10");
        assert_eq!(encode_base62(&[1, 0]), "48");
        assert_eq!(encode_base62(&[0, 0]), "");
    }
}
