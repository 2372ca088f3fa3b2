//! Bearer credential verification.
//!
//! Tokens are issued by the external auth service; this side only checks
//! them and resolves the caller's identity.

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// Caller role as asserted by the auth service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    fn from_claim(value: Option<&str>) -> Self {
        match value {
            Some("admin") => Role::Admin,
            _ => Role::User,
        }
    }
}

/// Identity resolved from a valid credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedUser {
    pub user_id: String,
    pub name: String,
    pub role: Role,
}

impl VerifiedUser {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Checks an opaque bearer credential.
///
/// `Ok(None)` means the credential is invalid or expired. `Err` is reserved
/// for infrastructure failures (verifier unreachable and the like).
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, credential: &str) -> Result<Option<VerifiedUser>, ApiError>;
}

/// Claims carried by access tokens from the auth service.
#[derive(Debug, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: String,
    pub exp: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

/// HS256 JWT verifier sharing a secret with the auth service.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, credential: &str) -> Result<Option<VerifiedUser>, ApiError> {
        let data = match jsonwebtoken::decode::<AccessClaims>(credential, &self.key, &self.validation)
        {
            Ok(data) => data,
            Err(e) => {
                tracing::debug!(?e, "access token rejected");
                return Ok(None);
            }
        };

        let claims = data.claims;
        if claims.sub.is_empty() {
            return Ok(None);
        }

        Ok(Some(VerifiedUser {
            name: claims.name.unwrap_or_else(|| claims.sub.clone()),
            role: Role::from_claim(claims.role.as_deref()),
            user_id: claims.sub,
        }))
    }
}

/// Mint an HS256 access token. Used by local tooling and tests; production
/// tokens come from the auth service.
pub fn mint_access_token(
    secret: &str,
    user_id: &str,
    name: &str,
    role: Role,
    ttl_secs: i64,
) -> Result<String, ApiError> {
    let claims = AccessClaims {
        sub: user_id.to_string(),
        exp: chrono::Utc::now().timestamp() + ttl_secs,
        name: Some(name.to_string()),
        role: Some(match role {
            Role::Admin => "admin".to_string(),
            Role::User => "user".to_string(),
        }),
    };
    jsonwebtoken::encode(
        &jsonwebtoken::Header::new(Algorithm::HS256),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| {
        tracing::error!(?e, "token encoding failed");
        ApiError::internal("Failed to mint token")
    })
}
