use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Minimum HMAC key length accepted for HS256.
pub const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

/// Signed token claims.
///
/// Access tokens carry a roles snapshot; refresh tokens carry identity only.
/// `jti` keeps two tokens minted for the same user within the same second distinct,
/// which the session fingerprint and revocation ledger rely on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenClaims {
    pub user_id: String,
    pub username: String,
    pub token_type: TokenType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

impl TokenClaims {
    /// Remaining validity at `now` (unix seconds). `None` once the token is at or past expiry;
    /// callers must not write a store entry in that case.
    pub fn remaining_ttl(&self, now: i64) -> Option<Duration> {
        let remaining = self.exp - now;
        (remaining > 0).then(|| Duration::from_secs(remaining as u64))
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("token expired")]
    Expired,
    #[error("token rejected: {0}")]
    Invalid(String),
    #[error("token signing failed: {0}")]
    Signing(String),
    #[error("signing secret must be at least {MIN_SECRET_LEN} bytes")]
    WeakSecret,
}

/// HS256 encoder/verifier for access and refresh tokens.
///
/// - Key material is not printable via Debug.
#[derive(Clone)]
pub struct TokenCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    access_ttl_seconds: u64,
    refresh_ttl_seconds: u64,
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec")
            .field("access_ttl_seconds", &self.access_ttl_seconds)
            .field("refresh_ttl_seconds", &self.refresh_ttl_seconds)
            .field("leeway", &self.validation.leeway)
            .finish()
    }
}

impl TokenCodec {
    pub fn new(
        secret: &[u8],
        access_ttl_seconds: u64,
        refresh_ttl_seconds: u64,
        leeway_seconds: u64,
    ) -> Result<Self, CodecError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(CodecError::WeakSecret);
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = leeway_seconds;

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            access_ttl_seconds,
            refresh_ttl_seconds,
        })
    }

    pub fn access_ttl_seconds(&self) -> u64 {
        self.access_ttl_seconds
    }

    pub fn access_claims(
        &self,
        user_id: &str,
        username: &str,
        roles: &[String],
        now: i64,
    ) -> TokenClaims {
        TokenClaims {
            user_id: user_id.to_string(),
            username: username.to_string(),
            token_type: TokenType::Access,
            roles: Some(roles.to_vec()),
            jti: Uuid::new_v4().to_string(),
            iat: now,
            exp: now + self.access_ttl_seconds as i64,
        }
    }

    pub fn refresh_claims(&self, user_id: &str, username: &str, now: i64) -> TokenClaims {
        TokenClaims {
            user_id: user_id.to_string(),
            username: username.to_string(),
            token_type: TokenType::Refresh,
            roles: None,
            jti: Uuid::new_v4().to_string(),
            iat: now,
            exp: now + self.refresh_ttl_seconds as i64,
        }
    }

    pub fn encode(&self, claims: &TokenClaims) -> Result<String, CodecError> {
        let mut header = Header::new(Algorithm::HS256);
        header.typ = Some("JWT".to_string());
        jsonwebtoken::encode(&header, claims, &self.encoding_key)
            .map_err(|e| CodecError::Signing(e.to_string()))
    }

    /// Verify signature and expiry, then decode.
    pub fn decode(&self, token: &str) -> Result<TokenClaims, CodecError> {
        let data = jsonwebtoken::decode::<TokenClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => CodecError::Expired,
                _ => CodecError::Invalid(e.to_string()),
            })?;

        if data.claims.user_id.trim().is_empty() {
            return Err(CodecError::Invalid("empty 'userId' claim".to_string()));
        }

        Ok(data.claims)
    }
}

/// Lookup key for session and revocation records: sha256(token) as URL-safe base64.
pub fn fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Prefix of a fingerprint that is safe to put in logs.
pub fn short_fingerprint(fingerprint: &str) -> &str {
    fingerprint.get(..8).unwrap_or(fingerprint)
}
