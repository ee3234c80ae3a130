//! Password hashing and token generation.
//!
//! Passwords are hashed with Argon2id into PHC strings (the salt and cost
//! parameters travel inside the string), so verification always uses the
//! parameters a hash was created with. Session tokens are 256 bits from the
//! OS RNG, hex encoded, and only ever stored as a SHA-256 digest.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use vestibule_core::{VestibuleError, VestibuleResult};

/// Minimum password length in characters.
pub const MIN_PASSWORD_LENGTH: usize = 8;

/// Maximum password length in characters.
pub const MAX_PASSWORD_LENGTH: usize = 128;

const SALT_BYTES: usize = 16;
const TOKEN_BYTES: usize = 32;

/// Argon2id cost parameters used for new hashes.
#[derive(Debug, Clone, Deserialize)]
pub struct HashingConfig {
    /// Memory cost in KiB.
    #[serde(default = "default_memory_kib")]
    pub memory_kib: u32,
    /// Time cost (passes over memory).
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    /// Lanes.
    #[serde(default = "default_parallelism")]
    pub parallelism: u32,
}

impl Default for HashingConfig {
    fn default() -> Self {
        Self {
            memory_kib: default_memory_kib(),
            iterations: default_iterations(),
            parallelism: default_parallelism(),
        }
    }
}

impl HashingConfig {
    /// Cheapest parameters Argon2 accepts. Only for tests.
    pub fn insecure_fast() -> Self {
        Self {
            memory_kib: 8,
            iterations: 1,
            parallelism: 1,
        }
    }
}

fn default_memory_kib() -> u32 {
    Params::DEFAULT_M_COST
}
fn default_iterations() -> u32 {
    Params::DEFAULT_T_COST
}
fn default_parallelism() -> u32 {
    Params::DEFAULT_P_COST
}

/// Hashes and verifies passwords with a fixed Argon2id configuration.
#[derive(Clone)]
pub struct PasswordHashing {
    argon2: Argon2<'static>,
}

impl PasswordHashing {
    /// Validate `config` and build the hasher.
    pub fn new(config: &HashingConfig) -> VestibuleResult<Self> {
        let params = Params::new(
            config.memory_kib,
            config.iterations,
            config.parallelism,
            None,
        )
        .map_err(|e| VestibuleError::Config(format!("Invalid hashing parameters: {e}")))?;

        Ok(Self {
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        })
    }

    /// Hash `password` with a fresh random salt.
    pub fn hash(&self, password: &str) -> VestibuleResult<String> {
        let mut salt_bytes = [0u8; SALT_BYTES];
        getrandom::getrandom(&mut salt_bytes)
            .map_err(|e| VestibuleError::Security(format!("Failed to generate salt: {e}")))?;
        let salt = SaltString::encode_b64(&salt_bytes)
            .map_err(|e| VestibuleError::Security(format!("Failed to encode salt: {e}")))?;

        self.argon2
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| VestibuleError::Security(format!("Password hashing failed: {e}")))
    }

    /// Check `candidate` against a stored PHC hash. The digest comparison is
    /// constant-time; a malformed hash simply fails verification.
    pub fn verify(&self, candidate: &str, phc: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(phc) else {
            return false;
        };
        self.argon2
            .verify_password(candidate.as_bytes(), &parsed)
            .is_ok()
    }
}

/// Reject passwords outside the length policy or made only of whitespace.
pub fn validate_password_policy(password: &str) -> VestibuleResult<()> {
    if password.trim().is_empty() {
        return Err(VestibuleError::InvalidPassword(
            "password cannot be empty or whitespace".into(),
        ));
    }
    let len = password.chars().count();
    if len < MIN_PASSWORD_LENGTH {
        return Err(VestibuleError::InvalidPassword(format!(
            "password must be at least {MIN_PASSWORD_LENGTH} characters"
        )));
    }
    if len > MAX_PASSWORD_LENGTH {
        return Err(VestibuleError::InvalidPassword(format!(
            "password must be at most {MAX_PASSWORD_LENGTH} characters"
        )));
    }
    Ok(())
}

/// Generate a session token: 32 random bytes, hex encoded.
pub fn generate_token() -> VestibuleResult<String> {
    let mut bytes = [0u8; TOKEN_BYTES];
    getrandom::getrandom(&mut bytes)
        .map_err(|e| VestibuleError::Security(format!("Failed to generate token: {e}")))?;
    Ok(hex::encode(bytes))
}

/// SHA-256 digest of a token, hex encoded. Used as the lookup key so raw
/// tokens never sit in memory maps.
pub fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn hashing() -> PasswordHashing {
        PasswordHashing::new(&HashingConfig::insecure_fast()).unwrap()
    }

    #[test]
    fn test_hash_and_verify() {
        let h = hashing();
        let phc = h.hash("correct horse battery").unwrap();
        assert!(phc.starts_with("$argon2id$"));
        assert!(h.verify("correct horse battery", &phc));
        assert!(!h.verify("wrong horse battery", &phc));
    }

    #[test]
    fn test_same_password_gets_different_salts() {
        let h = hashing();
        let a = h.hash("same-password").unwrap();
        let b = h.hash("same-password").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_malformed_hash_fails_verification() {
        assert!(!hashing().verify("anything", "not-a-phc-string"));
    }

    #[test]
    fn test_policy() {
        assert!(validate_password_policy("longenough").is_ok());
        assert!(validate_password_policy("short").is_err());
        assert!(validate_password_policy("          ").is_err());
        assert!(validate_password_policy(&"x".repeat(129)).is_err());
    }

    #[test]
    fn test_token_is_256_bits_and_unique() {
        let a = generate_token().unwrap();
        let b = generate_token().unwrap();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
        assert_eq!(token_digest(&a), token_digest(&a));
        assert_ne!(token_digest(&a), a);
    }
}
