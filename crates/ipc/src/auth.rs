//! Bearer-token authentication for the loopback surface.
//!
//! One token is generated per daemon start and published only through the
//! owner-readable port file. The raw token is never held by the server;
//! requests are checked against its SHA-256 hash.

use rand::RngCore;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone)]
pub struct TokenGuard {
    hash: [u8; 32],
}

/// 32 random bytes, hex encoded.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

impl TokenGuard {
    pub fn new(token: &str) -> Self {
        Self { hash: sha256(token.as_bytes()) }
    }

    pub fn verify(&self, presented: &str) -> bool {
        // Comparing fixed-length hashes keeps the comparison length
        // independent of the attacker-controlled input.
        sha256(presented.as_bytes()) == self.hash
    }

    /// Extract and verify the token from an `Authorization: Bearer …` value.
    pub fn verify_header(&self, header: Option<&str>) -> bool {
        header
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(|token| self.verify(token.trim()))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_are_long_and_unique() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }

    #[test]
    fn verify_accepts_only_the_exact_token() {
        let token = generate_token();
        let guard = TokenGuard::new(&token);
        assert!(guard.verify(&token));
        assert!(!guard.verify("nope"));
        assert!(!guard.verify(&token[..63]));
    }

    #[test]
    fn header_parsing() {
        let guard = TokenGuard::new("secret");
        assert!(guard.verify_header(Some("Bearer secret")));
        assert!(guard.verify_header(Some("Bearer secret ")));
        assert!(!guard.verify_header(Some("secret")));
        assert!(!guard.verify_header(Some("Basic secret")));
        assert!(!guard.verify_header(None));
    }
}
