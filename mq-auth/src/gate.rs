//! The auth gate: registration, login with MFA and lockout, token
//! verification, refresh and revocation.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use mq_core::types::{MfaEnrollment, Role, Session, SessionId, TenantId, User, UserId};
use mq_store::{Store, UserAggregate};

use crate::error::{AuthError, AuthResult};
use crate::password;
use crate::tokens::{generate_refresh_token, token_hash, Claims, TokenSigner};
use crate::totp;

/// Gate tuning. Defaults follow the production policy: 5 failures in
/// 15 minutes lock the account for 15 minutes.
#[derive(Debug, Clone)]
pub struct AuthGateConfig {
    pub access_ttl_secs: i64,
    pub refresh_ttl_secs: i64,
    pub max_failed_attempts: u32,
    pub failed_window_mins: i64,
    pub lockout_mins: i64,
    pub totp_issuer: String,
}

impl Default for AuthGateConfig {
    fn default() -> Self {
        Self {
            access_ttl_secs: 24 * 3_600,
            refresh_ttl_secs: 7 * 24 * 3_600,
            max_failed_attempts: 5,
            failed_window_mins: 15,
            lockout_mins: 15,
            totp_issuer: "MallQuest".to_string(),
        }
    }
}

/// The verified identity attached to a request.
#[derive(Debug, Clone)]
pub struct AuthSubject {
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub role: Role,
    pub token_hash: String,
}

/// Issued token pair.
#[derive(Debug, Clone)]
pub struct LoginTokens {
    pub user_id: UserId,
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
}

/// MFA enrollment material, returned to the client exactly once.
#[derive(Debug, Clone)]
pub struct MfaSetup {
    pub secret: String,
    pub provisioning_uri: String,
    pub backup_codes: Vec<String>,
}

#[derive(Debug, Default)]
struct FailureState {
    failures: Vec<DateTime<Utc>>,
    locked_until: Option<DateTime<Utc>>,
}

/// Identity proofing and session lifecycle.
pub struct AuthGate {
    store: Arc<dyn Store>,
    signer: TokenSigner,
    config: AuthGateConfig,
    /// Failed-attempt tracking, keyed by (tenant, email). Process
    /// local; the session table is the cross-process source of truth.
    lockouts: Mutex<HashMap<String, FailureState>>,
}

impl AuthGate {
    pub fn new(
        store: Arc<dyn Store>,
        config: AuthGateConfig,
        secret: impl Into<String>,
        previous_secret: Option<String>,
    ) -> Self {
        let signer = TokenSigner::new(secret, previous_secret, config.access_ttl_secs);
        Self {
            store,
            signer,
            config,
            lockouts: Mutex::new(HashMap::new()),
        }
    }

    pub fn signer(&self) -> &TokenSigner {
        &self.signer
    }

    /// Register a new user. Password strength rules apply to every
    /// role.
    pub async fn register(
        &self,
        tenant: &TenantId,
        email: &str,
        display_name: &str,
        password_plain: &str,
        role: Role,
    ) -> AuthResult<User> {
        let email = email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(AuthError::Validation(
                "a valid email address is required".to_string(),
            ));
        }
        password::validate_strength(password_plain)?;
        let hash = password::hash_password(password_plain)?;
        let user = User::new(
            tenant.clone(),
            email.to_ascii_lowercase(),
            display_name,
            hash,
            role,
            Utc::now(),
        );
        match self.store.create_user(UserAggregate::new(user.clone())).await {
            Ok(()) => Ok(user),
            Err(mq_store::StoreError::AlreadyExists(what)) => {
                Err(AuthError::AlreadyExists(what))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Verify credentials (and TOTP when enrolled), then issue a
    /// session.
    pub async fn login(
        &self,
        tenant: &TenantId,
        email: &str,
        password_plain: &str,
        mfa_code: Option<&str>,
        ip: Option<String>,
        user_agent: Option<String>,
    ) -> AuthResult<LoginTokens> {
        let now = Utc::now();
        let lockout_key = format!("{}\u{0}{}", tenant.as_str(), email.to_ascii_lowercase());
        if let Some(until) = self.locked_until(&lockout_key, now).await {
            return Err(AuthError::Locked { until });
        }

        let Some(mut aggregate) = self.store.find_user_by_email(tenant, email).await? else {
            self.record_failure(&lockout_key, tenant, email, now).await;
            return Err(AuthError::InvalidCredentials);
        };

        if !password::verify_password(password_plain, &aggregate.user.password_hash) {
            self.record_failure(&lockout_key, tenant, email, now).await;
            return Err(AuthError::InvalidCredentials);
        }

        if aggregate.user.mfa_enabled() {
            let Some(code) = mfa_code else {
                return Err(AuthError::MfaRequired);
            };
            self.check_mfa_code(&mut aggregate, code, now).await?;
        }

        self.clear_failures(&lockout_key).await;
        self.issue_session(&aggregate.user, ip, user_agent, now).await
    }

    async fn check_mfa_code(
        &self,
        aggregate: &mut UserAggregate,
        code: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<()> {
        let enrollment = aggregate
            .user
            .mfa
            .clone()
            .ok_or(AuthError::MfaInvalid)?;

        if totp::verify_code_at(&enrollment.secret, code, now.timestamp() as u64)? {
            return Ok(());
        }

        // Fall back to a single-use backup code.
        let Some(index) = enrollment
            .backup_code_hashes
            .iter()
            .position(|hash| totp::verify_backup_code(code, hash))
        else {
            return Err(AuthError::MfaInvalid);
        };

        let mut user = aggregate.user.clone();
        if let Some(mfa) = user.mfa.as_mut() {
            mfa.backup_code_hashes.remove(index);
        }
        let updated = self.store.update_user(user).await?;
        aggregate.user = updated.user;
        tracing::info!(
            user_id = %aggregate.user.id,
            "backup code consumed during login"
        );
        Ok(())
    }

    async fn issue_session(
        &self,
        user: &User,
        ip: Option<String>,
        user_agent: Option<String>,
        now: DateTime<Utc>,
    ) -> AuthResult<LoginTokens> {
        let (access_token, claims) =
            self.signer.issue(&user.tenant_id, &user.id, user.role, now)?;
        let refresh_token = generate_refresh_token();
        let refresh_expires_at = now + chrono::Duration::seconds(self.config.refresh_ttl_secs);
        let access_expires_at = DateTime::<Utc>::from_timestamp(claims.exp, 0)
            .unwrap_or(now + chrono::Duration::seconds(self.config.access_ttl_secs));

        let session = Session {
            id: SessionId::generate(),
            tenant_id: user.tenant_id.clone(),
            user_id: user.id.clone(),
            token_hash: token_hash(&access_token),
            refresh_hash: token_hash(&refresh_token),
            issued_at: now,
            expires_at: access_expires_at,
            refresh_expires_at,
            ip,
            user_agent,
            revoked: false,
        };
        self.store.record_session(session).await?;

        Ok(LoginTokens {
            user_id: user.id.clone(),
            access_token,
            refresh_token,
            access_expires_at,
            refresh_expires_at,
        })
    }

    /// Verify an access token: signature, expiry, revocation.
    pub async fn verify(&self, token: &str) -> AuthResult<AuthSubject> {
        let claims: Claims = self.signer.verify(token)?;
        let hash = token_hash(token);
        let session = self
            .store
            .get_session_by_token(&hash)
            .await?
            .ok_or_else(|| AuthError::TokenInvalid("unknown session".to_string()))?;
        if session.revoked {
            return Err(AuthError::TokenRevoked);
        }
        if Utc::now() >= session.expires_at {
            return Err(AuthError::TokenExpired);
        }
        Ok(AuthSubject {
            tenant_id: claims.tenant_id(),
            user_id: claims.user_id(),
            role: claims.role,
            token_hash: hash,
        })
    }

    /// Rotate an access token. The old session is revoked and a new
    /// one recorded; refreshing a revoked token fails and leaves the
    /// chain revoked.
    pub async fn refresh(
        &self,
        refresh_token: &str,
        ip: Option<String>,
        user_agent: Option<String>,
    ) -> AuthResult<LoginTokens> {
        let now = Utc::now();
        let rhash = token_hash(refresh_token);
        let session = self
            .store
            .get_session_by_refresh(&rhash)
            .await?
            .ok_or_else(|| AuthError::TokenInvalid("unknown refresh token".to_string()))?;
        if session.revoked {
            return Err(AuthError::TokenRevoked);
        }
        if now >= session.refresh_expires_at {
            return Err(AuthError::TokenExpired);
        }

        let aggregate = self
            .store
            .load_user(&session.tenant_id, &session.user_id)
            .await?
            .ok_or_else(|| AuthError::TokenInvalid("user no longer exists".to_string()))?;

        self.store.revoke_session(&session.token_hash).await?;
        self.issue_session(&aggregate.user, ip, user_agent, now).await
    }

    /// Revoke a session by access token. Subsequent `verify` fails.
    pub async fn revoke(&self, token: &str) -> AuthResult<bool> {
        Ok(self.store.revoke_session(&token_hash(token)).await?)
    }

    /// Begin TOTP enrollment. The enrollment gates login only after
    /// `confirm_mfa` sees a valid code.
    pub async fn setup_mfa(&self, tenant: &TenantId, user_id: &UserId) -> AuthResult<MfaSetup> {
        let aggregate = self
            .store
            .load_user(tenant, user_id)
            .await?
            .ok_or_else(|| AuthError::NotFound(format!("user {user_id}")))?;

        let secret = totp::generate_secret();
        let backup_codes = totp::generate_backup_codes();
        let uri = totp::provisioning_uri(&secret, &self.config.totp_issuer, &aggregate.user.email);

        let mut user = aggregate.user;
        user.mfa = Some(MfaEnrollment {
            secret: secret.clone(),
            backup_code_hashes: backup_codes.iter().map(|c| totp::hash_backup_code(c)).collect(),
            confirmed: false,
        });
        self.store.update_user(user).await?;

        Ok(MfaSetup {
            secret,
            provisioning_uri: uri,
            backup_codes,
        })
    }

    /// Confirm enrollment with a live code.
    pub async fn confirm_mfa(
        &self,
        tenant: &TenantId,
        user_id: &UserId,
        code: &str,
    ) -> AuthResult<()> {
        let aggregate = self
            .store
            .load_user(tenant, user_id)
            .await?
            .ok_or_else(|| AuthError::NotFound(format!("user {user_id}")))?;
        let mut user = aggregate.user;
        let enrollment = user.mfa.as_mut().ok_or(AuthError::MfaInvalid)?;
        if !totp::verify_code_at(&enrollment.secret, code, Utc::now().timestamp() as u64)? {
            return Err(AuthError::MfaInvalid);
        }
        enrollment.confirmed = true;
        self.store.update_user(user).await?;
        Ok(())
    }

    async fn locked_until(&self, key: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut lockouts = self.lockouts.lock().await;
        let state = lockouts.get_mut(key)?;
        match state.locked_until {
            Some(until) if now < until => Some(until),
            Some(_) => {
                // Lockout elapsed.
                state.locked_until = None;
                state.failures.clear();
                None
            }
            None => None,
        }
    }

    async fn record_failure(
        &self,
        key: &str,
        tenant: &TenantId,
        email: &str,
        now: DateTime<Utc>,
    ) {
        let window = chrono::Duration::minutes(self.config.failed_window_mins);
        let mut lockouts = self.lockouts.lock().await;
        let state = lockouts.entry(key.to_string()).or_default();
        state.failures.push(now);
        state.failures.retain(|at| now - *at <= window);
        if state.failures.len() as u32 >= self.config.max_failed_attempts {
            let until = now + chrono::Duration::minutes(self.config.lockout_mins);
            state.locked_until = Some(until);
            tracing::warn!(
                tenant_id = %tenant,
                email,
                locked_until = %until,
                "security_audit: account locked after repeated failures"
            );
        }
    }

    async fn clear_failures(&self, key: &str) {
        self.lockouts.lock().await.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mq_store::MemoryStore;

    const PASSWORD: &str = "Correct1Horse!";

    fn gate() -> AuthGate {
        AuthGate::new(
            Arc::new(MemoryStore::new()),
            AuthGateConfig::default(),
            "test-secret",
            None,
        )
    }

    async fn registered(gate: &AuthGate) -> (TenantId, User) {
        let tenant = TenantId::new("t1");
        let user = gate
            .register(&tenant, "visitor@example.com", "Visitor", PASSWORD, Role::Player)
            .await
            .unwrap();
        (tenant, user)
    }

    #[tokio::test]
    async fn test_register_rejects_weak_password() {
        let gate = gate();
        let tenant = TenantId::new("t1");
        let err = gate
            .register(&tenant, "a@example.com", "A", "weakpass", Role::Player)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::WeakPassword(_)));
    }

    #[tokio::test]
    async fn test_login_verify_revoke_cycle() {
        let gate = gate();
        let (tenant, _) = registered(&gate).await;

        let tokens = gate
            .login(&tenant, "visitor@example.com", PASSWORD, None, None, None)
            .await
            .unwrap();

        let subject = gate.verify(&tokens.access_token).await.unwrap();
        assert_eq!(subject.tenant_id, tenant);
        assert_eq!(subject.role, Role::Player);

        assert!(gate.revoke(&tokens.access_token).await.unwrap());
        let err = gate.verify(&tokens.access_token).await.unwrap_err();
        assert!(matches!(err, AuthError::TokenRevoked));
    }

    #[tokio::test]
    async fn test_wrong_password_is_opaque() {
        let gate = gate();
        let (tenant, _) = registered(&gate).await;

        let wrong_password = gate
            .login(&tenant, "visitor@example.com", "Wrong1Pass!", None, None, None)
            .await
            .unwrap_err();
        let unknown_user = gate
            .login(&tenant, "nobody@example.com", PASSWORD, None, None, None)
            .await
            .unwrap_err();
        // The two failures are indistinguishable.
        assert!(matches!(wrong_password, AuthError::InvalidCredentials));
        assert!(matches!(unknown_user, AuthError::InvalidCredentials));
    }

    #[tokio::test]
    async fn test_lockout_after_repeated_failures() {
        let gate = gate();
        let (tenant, _) = registered(&gate).await;

        for _ in 0..5 {
            let _ = gate
                .login(&tenant, "visitor@example.com", "Wrong1Pass!", None, None, None)
                .await;
        }
        let err = gate
            .login(&tenant, "visitor@example.com", PASSWORD, None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Locked { .. }));
    }

    #[tokio::test]
    async fn test_refresh_rotates_and_revokes_old_access() {
        let gate = gate();
        let (tenant, _) = registered(&gate).await;

        let first = gate
            .login(&tenant, "visitor@example.com", PASSWORD, None, None, None)
            .await
            .unwrap();
        let second = gate
            .refresh(&first.refresh_token, None, None)
            .await
            .unwrap();
        assert_ne!(first.access_token, second.access_token);

        // Old access token is revoked with its session.
        assert!(matches!(
            gate.verify(&first.access_token).await.unwrap_err(),
            AuthError::TokenRevoked
        ));
        assert!(gate.verify(&second.access_token).await.is_ok());

        // The consumed refresh token cannot be replayed.
        assert!(matches!(
            gate.refresh(&first.refresh_token, None, None)
                .await
                .unwrap_err(),
            AuthError::TokenRevoked
        ));
    }

    #[tokio::test]
    async fn test_mfa_enrollment_and_login() {
        let gate = gate();
        let (tenant, user) = registered(&gate).await;

        let setup = gate.setup_mfa(&tenant, &user.id).await.unwrap();
        assert_eq!(setup.backup_codes.len(), 10);

        // Unconfirmed enrollment does not gate login.
        gate.login(&tenant, "visitor@example.com", PASSWORD, None, None, None)
            .await
            .unwrap();

        let code =
            crate::totp::generate_code_at(&setup.secret, Utc::now().timestamp() as u64).unwrap();
        gate.confirm_mfa(&tenant, &user.id, &code).await.unwrap();

        // Now a code is required.
        assert!(matches!(
            gate.login(&tenant, "visitor@example.com", PASSWORD, None, None, None)
                .await
                .unwrap_err(),
            AuthError::MfaRequired
        ));

        let code =
            crate::totp::generate_code_at(&setup.secret, Utc::now().timestamp() as u64).unwrap();
        gate.login(
            &tenant,
            "visitor@example.com",
            PASSWORD,
            Some(&code),
            None,
            None,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_backup_code_is_single_use() {
        let gate = gate();
        let (tenant, user) = registered(&gate).await;

        let setup = gate.setup_mfa(&tenant, &user.id).await.unwrap();
        let code =
            crate::totp::generate_code_at(&setup.secret, Utc::now().timestamp() as u64).unwrap();
        gate.confirm_mfa(&tenant, &user.id, &code).await.unwrap();

        let backup = &setup.backup_codes[0];
        gate.login(
            &tenant,
            "visitor@example.com",
            PASSWORD,
            Some(backup),
            None,
            None,
        )
        .await
        .unwrap();

        // Second use of the same backup code fails.
        assert!(matches!(
            gate.login(
                &tenant,
                "visitor@example.com",
                PASSWORD,
                Some(backup),
                None,
                None,
            )
            .await
            .unwrap_err(),
            AuthError::MfaInvalid
        ));
    }
}
