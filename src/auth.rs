//! Bearer-token authentication for the single administrative identity.
//!
//! Tokens are HS256 JWTs carrying `sub` and `exp`. There is no revocation
//! list: a token is valid as long as its signature checks out and it has
//! not expired. Every verification failure maps to the same
//! [`AuthError::InvalidOrExpired`] so callers cannot tell a forged token
//! from an expired one.

use anyhow::Result;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::config::AuthConfig;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid or expired token")]
    InvalidOrExpired,
}

/// Claims embedded in access tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    /// Expiry (unix seconds).
    pub exp: i64,
    /// Issued at (unix seconds).
    pub iat: i64,
    pub jti: String,
}

/// The one principal allowed to log in.
#[derive(Clone)]
pub struct AdminCredential {
    pub username: String,
    pub password_hash: Option<String>,
    pub password_plain: Option<String>,
}

impl std::fmt::Debug for AdminCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminCredential")
            .field("username", &self.username)
            .field("password_hash", &self.password_hash.as_ref().map(|_| "<set>"))
            .field("password_plain", &self.password_plain.as_ref().map(|_| "<set>"))
            .finish()
    }
}

pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
    admin: AdminCredential,
}

impl TokenService {
    pub fn new(config: &AuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            encoding: EncodingKey::from_secret(config.jwt_secret.as_bytes()),
            decoding: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            validation,
            ttl: Duration::hours(config.token_ttl_hours),
            admin: AdminCredential {
                username: config.admin_username.clone(),
                password_hash: config.admin_password_hash.clone(),
                password_plain: config.admin_password.clone(),
            },
        }
    }

    pub fn admin_username(&self) -> &str {
        &self.admin.username
    }

    pub fn issue_token(&self, username: &str) -> Result<String> {
        self.issue_token_with_ttl(username, self.ttl)
    }

    fn issue_token_with_ttl(&self, username: &str, ttl: Duration) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: username.to_string(),
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
            jti: uuid::Uuid::new_v4().to_string(),
        };
        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?;
        Ok(token)
    }

    /// Decode a token and return its subject.
    pub fn verify_token(&self, token: &str) -> Result<String, AuthError> {
        jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims.sub)
            .map_err(|e| {
                tracing::debug!(error = %e, "token rejected");
                AuthError::InvalidOrExpired
            })
    }

    pub fn authenticate(&self, username: &str, password: &str) -> bool {
        if username != self.admin.username {
            return false;
        }
        if let Some(hash) = &self.admin.password_hash {
            return verify_password(password, hash);
        }
        match &self.admin.password_plain {
            Some(plain) => password == plain,
            None => false,
        }
    }
}

/// Check a password against an Argon2 PHC string. Unparseable hashes fail.
pub fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            tracing::warn!(error = %e, "configured admin password hash is not a valid PHC string");
            false
        }
    }
}

/// Produce an Argon2id PHC string for `auth.admin_password_hash`.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut argon2::password_hash::rand_core::OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("failed to hash password: {}", e))?;
    Ok(hash.to_string())
}
