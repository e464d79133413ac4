//! Bearer token validation.

use subtle::ConstantTimeEq;

/// Decides whether a presented bearer token grants access.
pub trait TokenValidator: Send + Sync {
    fn is_token_valid(&self, token: &str) -> bool;
}

/// Validator backed by a single configured token.
#[derive(Debug, Clone)]
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl TokenValidator for StaticToken {
    fn is_token_valid(&self, token: &str) -> bool {
        let expected = self.token.as_bytes();
        let given = token.as_bytes();
        if expected.is_empty() {
            return false;
        }
        // ct_eq is false for slices of different lengths.
        expected.ct_eq(given).into()
    }
}

/// Generate a random access token (hex-encoded, 16 bytes = 32 hex chars).
pub fn generate_token() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}
