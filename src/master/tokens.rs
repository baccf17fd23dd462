//! HMAC-SHA256 signed bearer tokens.
//!
//! Wire format: `base64url(claims_json) "." base64url(hmac(claims_b64))`,
//! both unpadded. Used for operator sessions and step-up elevation; the
//! `typ` claim keeps one kind from being replayed as the other.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use super::models::Role;
use crate::errors::TokenError;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Session,
    StepUp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    /// Operator id.
    pub sub: i64,
    pub typ: TokenType,
    pub iat: i64,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
}

impl Claims {
    pub fn session(sub: i64, email: &str, role: Role, now: i64, ttl_secs: i64) -> Self {
        Self {
            sub,
            typ: TokenType::Session,
            iat: now,
            exp: now + ttl_secs,
            email: Some(email.to_string()),
            role: Some(role),
        }
    }

    pub fn step_up(sub: i64, now: i64, ttl_secs: i64) -> Self {
        Self {
            sub,
            typ: TokenType::StepUp,
            iat: now,
            exp: now + ttl_secs,
            email: None,
            role: None,
        }
    }
}

pub struct TokenSigner {
    key: Vec<u8>,
}

impl TokenSigner {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: secret.to_vec(),
        }
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length")
    }

    pub fn sign(&self, claims: &Claims) -> anyhow::Result<String> {
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
        let mut mac = self.mac();
        mac.update(payload.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{}.{}", payload, signature))
    }

    /// Check signature, type and expiry. `now` is unix seconds.
    pub fn verify(&self, token: &str, expected: TokenType, now: i64) -> Result<Claims, TokenError> {
        let (payload, signature) = token.trim().split_once('.').ok_or(TokenError::Malformed)?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| TokenError::Malformed)?;

        let mut mac = self.mac();
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::BadSignature)?;

        let raw = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| TokenError::Malformed)?;
        let claims: Claims = serde_json::from_slice(&raw).map_err(|_| TokenError::Malformed)?;

        if claims.typ != expected {
            return Err(TokenError::WrongType);
        }
        if claims.exp <= now {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }
}
