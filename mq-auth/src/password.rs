//! Password hashing with Argon2id and strength validation.

use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};

use crate::error::{AuthError, AuthResult};

const MIN_LENGTH: usize = 8;

/// Reject weak passwords: length ≥ 8 with at least one uppercase,
/// lowercase, digit and symbol.
pub fn validate_strength(password: &str) -> AuthResult<()> {
    if password.chars().count() < MIN_LENGTH {
        return Err(AuthError::WeakPassword(format!(
            "must be at least {MIN_LENGTH} characters"
        )));
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(AuthError::WeakPassword(
            "must contain an uppercase letter".to_string(),
        ));
    }
    if !password.chars().any(|c| c.is_ascii_lowercase()) {
        return Err(AuthError::WeakPassword(
            "must contain a lowercase letter".to_string(),
        ));
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(AuthError::WeakPassword("must contain a digit".to_string()));
    }
    if password.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(AuthError::WeakPassword("must contain a symbol".to_string()));
    }
    Ok(())
}

/// Hash a password with a fresh random salt. Returns a PHC-formatted
/// string that embeds algorithm, parameters, salt and hash.
pub fn hash_password(password: &str) -> AuthResult<String> {
    let salt = SaltString::generate(&mut rand::thread_rng());
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AuthError::Hash(e.to_string()))
}

/// Verify a password against a stored PHC hash.
pub fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strength_rules() {
        assert!(validate_strength("Short1!").is_err());
        assert!(validate_strength("alllowercase1!").is_err());
        assert!(validate_strength("ALLUPPERCASE1!").is_err());
        assert!(validate_strength("NoDigitsHere!").is_err());
        assert!(validate_strength("NoSymbols123").is_err());
        assert!(validate_strength("Correct1Horse!").is_ok());
    }

    #[test]
    fn test_hash_and_verify() {
        let hash = hash_password("Correct1Horse!").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("Correct1Horse!", &hash));
        assert!(!verify_password("wrong-password", &hash));
    }

    #[test]
    fn test_salts_are_random() {
        let a = hash_password("Correct1Horse!").unwrap();
        let b = hash_password("Correct1Horse!").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_malformed_hash_never_verifies() {
        assert!(!verify_password("anything", "not-a-phc-string"));
    }
}
