//! Password hashing and generation.
//!
//! Stored passwords are argon2id PHC strings with the per-user salt embedded;
//! verification re-derives from the stored parameters. Generated passwords
//! come from the OS CSPRNG and are handed out exactly once.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, SaltString},
    Argon2, PasswordHasher, PasswordVerifier,
};
use rand::seq::SliceRandom;
use thiserror::Error;

pub const GENERATED_PASSWORD_LENGTH: usize = 20;
const UPPERCASE: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const LOWERCASE: &str = "abcdefghijklmnopqrstuvwxyz";
const DIGITS: &str = "0123456789";
const SYMBOLS: &str = "!@#$%^&*";

#[derive(Debug, Error)]
pub enum PasswordError {
    #[error("password hashing failed: {0}")]
    HashingFailed(String),
    #[error("stored password hash is malformed")]
    InvalidHashFormat,
}

pub fn hash_password(password: &str) -> Result<String, PasswordError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| PasswordError::HashingFailed(e.to_string()))
}

pub fn verify_password(password: &str, stored: &str) -> Result<bool, PasswordError> {
    let parsed = PasswordHash::new(stored).map_err(|_| PasswordError::InvalidHashFormat)?;
    Ok(Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok())
}

/// Generate a password containing at least one character from every class.
pub fn generate_password() -> String {
    let mut rng = rand::rngs::OsRng;
    let mut chars: Vec<char> = Vec::with_capacity(GENERATED_PASSWORD_LENGTH);
    for class in [UPPERCASE, LOWERCASE, DIGITS, SYMBOLS] {
        let pool: Vec<char> = class.chars().collect();
        chars.push(*pool.choose(&mut rng).expect("non-empty charset"));
    }
    let all: Vec<char> = [UPPERCASE, LOWERCASE, DIGITS, SYMBOLS].concat().chars().collect();
    while chars.len() < GENERATED_PASSWORD_LENGTH {
        chars.push(*all.choose(&mut rng).expect("non-empty charset"));
    }
    chars.shuffle(&mut rng);
    chars.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify_round_trip() {
        let hash = hash_password("MyStr0ng!Passw0rd").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("MyStr0ng!Passw0rd", &hash).unwrap());
        assert!(!verify_password("WrongPassword", &hash).unwrap());
    }

    #[test]
    fn salts_differ_between_hashes() {
        let first = hash_password("same-password").unwrap();
        let second = hash_password("same-password").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn malformed_hash_is_an_error() {
        assert!(verify_password("anything", "not-a-phc-string").is_err());
    }

    #[test]
    fn generated_passwords_cover_all_classes() {
        let password = generate_password();
        assert_eq!(password.len(), GENERATED_PASSWORD_LENGTH);
        assert!(password.chars().any(|c| c.is_ascii_uppercase()));
        assert!(password.chars().any(|c| c.is_ascii_lowercase()));
        assert!(password.chars().any(|c| c.is_ascii_digit()));
        assert!(password.chars().any(|c| SYMBOLS.contains(c)));
        assert_ne!(generate_password(), password);
    }
}
