//! Token lifecycle.
//!
//! Access tokens are HS256 JWTs carrying `{sub, iat, exp, jti}` and are only
//! honored while their `jti` sits in the server-side allowlist; a
//! well-formed, unexpired token that is missing there is treated as revoked.
//! Refresh tokens carry a server-side version nonce, one per username; a
//! presented version that no longer matches the stored one deletes the
//! stored record outright.

use std::sync::Arc;

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{ApiError, ApiResult};
use crate::models::{RefreshTokenRecord, TokenRecord};
use crate::storage::Store;

pub const ACCESS_TOKEN_TTL_SECS: i64 = 8 * 60 * 60;
pub const REFRESH_TOKEN_TTL_SECS: i64 = 14 * 24 * 60 * 60;
pub const SERVICE_TOKEN_TTL_SECS: i64 = 60;

#[derive(Debug, Serialize, Deserialize)]
struct AccessClaims {
    sub: String,
    iat: i64,
    exp: i64,
    jti: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct RefreshClaims {
    sub: String,
    version: String,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
}

pub struct TokenService {
    store: Arc<dyn Store>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

fn fresh_version() -> String {
    let mut nonce = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    hex::encode(nonce)
}

impl TokenService {
    pub fn new(store: Arc<dyn Store>, secret_key: &str) -> Self {
        Self {
            store,
            encoding_key: EncodingKey::from_secret(secret_key.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret_key.as_bytes()),
        }
    }

    /// Issue an access/refresh pair, allowlisting the access token and
    /// rotating the stored refresh version.
    pub async fn issue_pair(&self, username: &str) -> ApiResult<TokenPair> {
        let now = Utc::now();
        let jti = Uuid::new_v4().to_string();
        let access_claims = AccessClaims {
            sub: username.to_string(),
            iat: now.timestamp(),
            exp: now.timestamp() + ACCESS_TOKEN_TTL_SECS,
            jti: jti.clone(),
        };
        let access_token = encode(&Header::new(Algorithm::HS256), &access_claims, &self.encoding_key)
            .map_err(ApiError::internal)?;
        self.store
            .put_token(&TokenRecord {
                username: username.to_string(),
                jti,
                issued_at: now,
                expires_at: now + Duration::seconds(ACCESS_TOKEN_TTL_SECS),
            })
            .await?;

        let version = fresh_version();
        let refresh_claims = RefreshClaims {
            sub: username.to_string(),
            version: version.clone(),
            iat: now.timestamp(),
            exp: now.timestamp() + REFRESH_TOKEN_TTL_SECS,
        };
        let refresh_token =
            encode(&Header::new(Algorithm::HS256), &refresh_claims, &self.encoding_key)
                .map_err(ApiError::internal)?;
        self.store
            .put_refresh_token(&RefreshTokenRecord {
                username: username.to_string(),
                version,
                issued_at: now,
            })
            .await?;

        tracing::debug!(username, "token pair issued");
        Ok(TokenPair { access_token, refresh_token, expires_in: ACCESS_TOKEN_TTL_SECS })
    }

    /// Resolve a presented bearer token to its username.
    pub async fn validate_access(&self, token: &str) -> ApiResult<String> {
        let claims = decode::<AccessClaims>(
            token,
            &self.decoding_key,
            &Validation::new(Algorithm::HS256),
        )
        .map_err(|_| ApiError::AuthenticationFailed)?
        .claims;
        // signature and expiry alone are not trusted; the allowlist decides
        match self.store.get_token(&claims.sub, &claims.jti).await? {
            Some(_) => Ok(claims.sub),
            None => Err(ApiError::TokenRevoked),
        }
    }

    /// Exchange a refresh token for a fresh pair. A version mismatch against
    /// the stored record deletes that record, so a stolen older token cannot
    /// be retried forever.
    pub async fn refresh(&self, refresh_token: &str) -> ApiResult<TokenPair> {
        let claims = decode::<RefreshClaims>(
            refresh_token,
            &self.decoding_key,
            &Validation::new(Algorithm::HS256),
        )
        .map_err(|_| ApiError::AuthenticationFailed)?
        .claims;
        let stored = self
            .store
            .get_refresh_token(&claims.sub)
            .await?
            .ok_or(ApiError::TokenRevoked)?;
        if stored.version != claims.version {
            self.store.delete_refresh_token(&claims.sub).await?;
            tracing::warn!(username = %claims.sub, "refresh token version mismatch, record dropped");
            return Err(ApiError::TokenRevoked);
        }
        self.issue_pair(&claims.sub).await
    }

    /// Drop every access-token allowlist entry and the refresh record for a
    /// user. Used by logout, block, and password change.
    pub async fn revoke_all(&self, username: &str) -> ApiResult<()> {
        let revoked = self.store.delete_user_tokens(username).await?;
        self.store.delete_refresh_token(username).await?;
        tracing::info!(username, revoked, "tokens revoked");
        Ok(())
    }

    /// Short-lived inter-service token injected into backend calls. Never
    /// allowlisted: it is outgoing-only and dies by expiry.
    pub fn issue_service_token(&self, username: &str) -> ApiResult<String> {
        let now = Utc::now();
        let claims = AccessClaims {
            sub: username.to_string(),
            iat: now.timestamp(),
            exp: now.timestamp() + SERVICE_TOKEN_TTL_SECS,
            jti: Uuid::new_v4().to_string(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(ApiError::internal)
    }
}
