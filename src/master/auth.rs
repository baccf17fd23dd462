//! Operator sessions: password login and the bearer-token middleware
//! guarding the `/master` routes.

use anyhow::Context;
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use axum::extract::{FromRequestParts, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::{Json, body::Bytes};
use rand::rngs::OsRng;
use serde::Deserialize;

use super::api::{ApiError, SharedState, parse_json};
use super::audit::ClientIp;
use super::models::Role;
use super::tokens::{Claims, TokenType};

/// Authenticated operator, placed in request and response extensions by
/// [`require_session`].
#[derive(Debug, Clone, PartialEq)]
pub struct AuthUser {
    pub id: i64,
    pub email: String,
    pub role: Role,
}

/// Hash a password into a PHC string.
pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| anyhow::anyhow!("Failed to hash password: {}", e))
}

/// Check a password against a stored PHC hash. Malformed hashes never match.
pub fn verify_password(password: &str, phc: &str) -> bool {
    match PasswordHash::new(phc) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            tracing::warn!(error = %e, "stored password hash is malformed");
            false
        }
    }
}

/// [`verify_password`] on the blocking pool, off the async workers.
pub async fn check_password(password: String, phc: String) -> anyhow::Result<bool> {
    tokio::task::spawn_blocking(move || verify_password(&password, &phc))
        .await
        .context("Password verification task failed")
}

/// Low-cost hash for tests; verification reads the cost from the PHC string.
#[cfg(test)]
pub(crate) fn quick_hash(password: &str) -> String {
    let params = argon2::Params::new(1024, 1, 1, None).unwrap();
    let argon = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);
    argon
        .hash_password(password.as_bytes(), &SaltString::generate(&mut OsRng))
        .unwrap()
        .to_string()
}

pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

fn bearer_token(parts: &axum::http::HeaderMap) -> Option<&str> {
    parts
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Reject requests without a valid session token; expose the caller as
/// [`AuthUser`] to handlers and, via the response, to the audit layer.
pub async fn require_session(
    State(state): State<SharedState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(req.headers())
        .ok_or_else(|| ApiError::Unauthorized("Missing bearer token".into()))?;
    let claims = state
        .signer
        .verify(token, TokenType::Session, now_secs())
        .map_err(|e| ApiError::Unauthorized(e.to_string()))?;

    let (Some(email), Some(role)) = (claims.email, claims.role) else {
        return Err(ApiError::Forbidden(
            "Session is not allowed on the control plane".into(),
        ));
    };
    let user = AuthUser {
        id: claims.sub,
        email,
        role,
    };
    if user.role != Role::Master {
        tracing::warn!(user_id = user.id, role = user.role.as_str(), "non-master session refused");
        let mut response = ApiError::Forbidden("Master role required".into()).into_response();
        response.extensions_mut().insert(user);
        return Ok(response);
    }

    req.extensions_mut().insert(user.clone());
    let mut response = next.run(req).await;
    response.extensions_mut().insert(user);
    Ok(response)
}

impl<S: Send + Sync> FromRequestParts<S> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthUser>()
            .cloned()
            .ok_or_else(|| ApiError::Unauthorized("Not authenticated".into()))
    }
}

#[derive(Debug, Default, Deserialize)]
struct LoginRequest {
    #[serde(default)]
    email: String,
    #[serde(default)]
    password: String,
}

/// `POST /auth/login`
///
/// Failures count against both the client IP and the email; either one
/// running out of attempts gets `429` until its window slides.
pub async fn login(
    State(state): State<SharedState>,
    ClientIp(ip): ClientIp,
    body: Bytes,
) -> Result<Response, ApiError> {
    let req: LoginRequest = parse_json(&body)?;
    let email = req.email.trim().to_string();
    if email.is_empty() || req.password.is_empty() {
        return Err(ApiError::InvalidCredentials);
    }

    let keys = [format!("ip:{}", ip), format!("email:{}", email.to_lowercase())];
    for key in &keys {
        state.login_limiter.check(key).map_err(|retry| {
            tracing::warn!(ip = %ip, "login rate limited");
            ApiError::rate_limited(retry)
        })?;
    }

    let operator = {
        let email = email.clone();
        state
            .db
            .call(move |db| db.find_operator_by_email(&email))
            .await?
    };
    let verified = match &operator {
        Some(op) => check_password(req.password, op.password_hash.clone()).await?,
        None => false,
    };
    let operator = match operator {
        Some(op) if verified => op,
        other => {
            tracing::info!(ip = %ip, user_id = other.map(|op| op.id), "login rejected");
            for key in &keys {
                state.login_limiter.record_failure(key);
            }
            return Err(ApiError::InvalidCredentials);
        }
    };
    for key in &keys {
        state.login_limiter.clear(key);
    }

    let ttl = state.config.auth.session_ttl_secs;
    let claims = Claims::session(operator.id, &operator.email, operator.role, now_secs(), ttl);
    let token = state.signer.sign(&claims)?;
    tracing::info!(user_id = operator.id, "operator logged in");

    Ok(Json(serde_json::json!({
        "token": token,
        "expires_in": ttl,
        "user": operator,
    }))
    .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let hash = hash_password("hunter2").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("hunter2", &hash));
        assert!(!verify_password("hunter3", &hash));
        assert!(!verify_password("hunter2", "not-a-phc-string"));
        assert!(verify_password("quick", &quick_hash("quick")));
    }

    #[tokio::test]
    async fn test_check_password_on_blocking_pool() {
        let hash = quick_hash("quick");
        assert!(check_password("quick".into(), hash.clone()).await.unwrap());
        assert!(!check_password("slow".into(), hash).await.unwrap());
        assert!(!check_password("quick".into(), "garbage".into()).await.unwrap());
    }

    #[test]
    fn test_bearer_token_parsing() {
        let mut headers = axum::http::HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert(AUTHORIZATION, "Bearer abc.def".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc.def"));
        headers.insert(AUTHORIZATION, "Basic xyz".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }
}
