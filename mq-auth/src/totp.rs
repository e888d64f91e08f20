//! Time-based one-time passwords and single-use backup codes.

use rand::Rng;
use sha2::{Digest, Sha256};
use totp_rs::{Algorithm, Secret, TOTP};

use crate::error::{AuthError, AuthResult};

const TOTP_DIGITS: usize = 6;
const TOTP_STEP: u64 = 30;
/// ±1 step tolerance for clock drift.
const TOTP_SKEW: u8 = 1;

const BACKUP_CODE_COUNT: usize = 10;
const BACKUP_CODE_LENGTH: usize = 8;

/// Generate a fresh base32 TOTP secret (20 bytes, the RFC size).
pub fn generate_secret() -> String {
    let mut secret_bytes = vec![0u8; 20];
    rand::thread_rng().fill(&mut secret_bytes[..]);
    Secret::Raw(secret_bytes).to_encoded().to_string()
}

/// Provisioning URI for authenticator apps.
pub fn provisioning_uri(secret_base32: &str, issuer: &str, account: &str) -> String {
    format!(
        "otpauth://totp/{issuer}:{account}?secret={secret_base32}&issuer={issuer}&algorithm=SHA256&digits={TOTP_DIGITS}&period={TOTP_STEP}"
    )
}

fn build(secret_base32: &str) -> AuthResult<TOTP> {
    let secret_bytes = Secret::Encoded(secret_base32.to_string())
        .to_bytes()
        .map_err(|_| AuthError::MfaInvalid)?;
    TOTP::new(
        Algorithm::SHA256,
        TOTP_DIGITS,
        TOTP_SKEW,
        TOTP_STEP,
        secret_bytes,
    )
    .map_err(|e| AuthError::Hash(e.to_string()))
}

/// Verify a code at an explicit Unix timestamp, with the ±1 step
/// window.
pub fn verify_code_at(secret_base32: &str, code: &str, unix_time: u64) -> AuthResult<bool> {
    Ok(build(secret_base32)?.check(code, unix_time))
}

/// Generate the current code; used by enrollment tests and the CLI.
pub fn generate_code_at(secret_base32: &str, unix_time: u64) -> AuthResult<String> {
    Ok(build(secret_base32)?.generate(unix_time))
}

/// Fresh numeric backup codes. Returned in plaintext exactly once;
/// only hashes are stored.
pub fn generate_backup_codes() -> Vec<String> {
    let mut rng = rand::thread_rng();
    (0..BACKUP_CODE_COUNT)
        .map(|_| {
            (0..BACKUP_CODE_LENGTH)
                .map(|_| rng.gen_range(0..10).to_string())
                .collect()
        })
        .collect()
}

/// Hash a backup code for storage.
pub fn hash_backup_code(code: &str) -> String {
    hex::encode(Sha256::digest(code.as_bytes()))
}

/// Constant-time backup code comparison.
pub fn verify_backup_code(code: &str, stored_hash: &str) -> bool {
    let computed = hash_backup_code(code);
    if computed.len() != stored_hash.len() {
        return false;
    }
    let mut diff = 0u8;
    for (a, b) in computed.bytes().zip(stored_hash.bytes()) {
        diff |= a ^ b;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_is_base32() {
        let secret = generate_secret();
        assert!(!secret.is_empty());
        assert!(secret
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_code_roundtrip_with_skew() {
        let secret = generate_secret();
        let now = 1_772_000_000u64;
        let code = generate_code_at(&secret, now).unwrap();

        assert!(verify_code_at(&secret, &code, now).unwrap());
        // One step of drift either way is tolerated.
        assert!(verify_code_at(&secret, &code, now + TOTP_STEP).unwrap());
        assert!(verify_code_at(&secret, &code, now - TOTP_STEP).unwrap());
        // Two steps is not.
        assert!(!verify_code_at(&secret, &code, now + 3 * TOTP_STEP).unwrap());
        assert!(!verify_code_at(&secret, "000000", now).unwrap());
    }

    #[test]
    fn test_backup_codes() {
        let codes = generate_backup_codes();
        assert_eq!(codes.len(), 10);
        for code in &codes {
            assert_eq!(code.len(), 8);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
        let hash = hash_backup_code(&codes[0]);
        assert!(verify_backup_code(&codes[0], &hash));
        assert!(!verify_backup_code("00000000", &hash));
    }

    #[test]
    fn test_provisioning_uri_shape() {
        let uri = provisioning_uri("JBSWY3DPEHPK3PXP", "MallQuest", "u@example.com");
        assert!(uri.starts_with("otpauth://totp/MallQuest:u@example.com?"));
        assert!(uri.contains("secret=JBSWY3DPEHPK3PXP"));
    }
}
