//! AuthGate: identity proofing and session lifecycle.
//!
//! Passwords hash with Argon2id (random salt per user), MFA is
//! standard TOTP with single-use backup codes, access tokens are HS256
//! JWTs with rotation support, refresh tokens are opaque random values
//! stored hashed in the session table.

pub mod error;
pub mod gate;
pub mod password;
pub mod tokens;
pub mod totp;

pub use error::{AuthError, AuthResult};
pub use gate::{AuthGate, AuthGateConfig, AuthSubject, LoginTokens, MfaSetup};
pub use tokens::{Claims, TokenSigner};
