//! Step-up re-authentication for dangerous operations.
//!
//! An operator with a session re-enters their password at
//! `POST /master/step-up` and receives a short-lived token bound to their
//! id. Handlers that take the [`StepUp`] extractor refuse to run unless the
//! request carries that token in `X-Step-Up-Token`.

use axum::body::Bytes;
use axum::extract::{FromRequestParts, State};
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use super::api::{ApiError, SharedState, parse_json};
use super::auth::{AuthUser, check_password, now_secs};
use super::tokens::{Claims, TokenType};

pub const STEP_UP_HEADER: &str = "x-step-up-token";

#[derive(Debug, Default, Deserialize)]
struct StepUpRequest {
    #[serde(default)]
    password: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StepUpGrant {
    pub token: String,
    pub expires_in: i64,
    pub expires_at: i64,
}

/// `POST /master/step-up`
///
/// Wrong passwords count against the operator; once they run out the
/// endpoint answers `429` without checking the password.
pub async fn elevate(
    State(state): State<SharedState>,
    user: AuthUser,
    body: Bytes,
) -> Result<Response, ApiError> {
    let req: StepUpRequest = parse_json(&body)?;
    let password = req
        .password
        .filter(|p| !p.is_empty())
        .ok_or(ApiError::InvalidCredentials)?;

    let user_id = user.id;
    let key = format!("operator:{}", user_id);
    state.step_up_limiter.check(&key).map_err(|retry| {
        tracing::warn!(user_id, "step-up rate limited");
        ApiError::rate_limited(retry)
    })?;

    let operator = state
        .db
        .call(move |db| db.get_operator(user_id))
        .await?
        .ok_or(ApiError::InvalidCredentials)?;
    if !check_password(password, operator.password_hash).await? {
        tracing::warn!(user_id, "step-up rejected");
        state.step_up_limiter.record_failure(&key);
        return Err(ApiError::InvalidCredentials);
    }
    state.step_up_limiter.clear(&key);

    let ttl = state.config.step_up.ttl_secs;
    let claims = Claims::step_up(user_id, now_secs(), ttl);
    let grant = StepUpGrant {
        token: state.signer.sign(&claims)?,
        expires_in: ttl,
        expires_at: claims.exp,
    };
    tracing::info!(user_id, "step-up granted");
    Ok(Json(grant).into_response())
}

/// Proof that the caller holds a valid step-up token for their own id.
/// A no-op when step-up is disabled in config.
#[derive(Debug, Clone, Copy)]
pub struct StepUp;

impl FromRequestParts<SharedState> for StepUp {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        if !state.config.step_up.enabled {
            return Ok(StepUp);
        }
        let user = parts
            .extensions
            .get::<AuthUser>()
            .ok_or(ApiError::StepUpRequired)?;
        let token = parts
            .headers
            .get(STEP_UP_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::StepUpRequired)?;

        match state.signer.verify(token, TokenType::StepUp, now_secs()) {
            Ok(claims) if claims.sub == user.id => Ok(StepUp),
            Ok(claims) => {
                tracing::warn!(user_id = user.id, token_sub = claims.sub, "step-up subject mismatch");
                Err(ApiError::StepUpRequired)
            }
            Err(e) => {
                tracing::debug!(user_id = user.id, error = %e, "step-up token rejected");
                Err(ApiError::StepUpRequired)
            }
        }
    }
}
