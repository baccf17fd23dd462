//! OAuth Authorization-Code + PKCE broker for the agent's own credentials.
//!
//! Flow:
//! 1. `start` creates a verifier/challenge pair and a random state, keeps
//!    them in the single pending session (replacing any older one) and
//!    returns the authorization URL for the operator to open.
//! 2. The operator pastes back the code shown by the provider, usually as
//!    `<code>#<state>`.
//! 3. `complete` consumes the pending session, exchanges the code at the
//!    token endpoint, enriches the result from the profile endpoint and
//!    writes the credential file the supervisor reads.

use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::credentials::{OAuthCredentials, write_credentials};
use crate::config::OAuthConfig;
use crate::errors::OAuthError;

/// Longest provider error body surfaced to the caller.
const MAX_ERROR_BODY: usize = 2_000;

struct OAuthSession {
    code_verifier: String,
    state: String,
    account_dir: PathBuf,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OAuthStart {
    pub url: String,
    pub account_dir: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OAuthComplete {
    pub account_dir: String,
    pub expires_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    account: Option<TokenAccount>,
}

#[derive(Debug, Deserialize)]
struct TokenAccount {
    #[serde(default)]
    email_address: Option<String>,
}

/// Base64url (unpadded) encoding of `len` random bytes.
pub fn random_urlsafe(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// S256 code challenge for a verifier.
pub fn pkce_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Keep only the authorization code from what the operator pasted.
pub fn clean_code(raw: &str) -> &str {
    let trimmed = raw.trim();
    trimmed.split('#').next().unwrap_or_default().trim()
}

/// Absolute expiry in unix ms. Provider values are untrusted, so the
/// arithmetic saturates instead of overflowing.
fn expiry_ms(now_ms: i64, expires_in_secs: Option<i64>) -> i64 {
    now_ms.saturating_add(expires_in_secs.unwrap_or(3600).saturating_mul(1000))
}

fn truncate_body(body: &str) -> String {
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => format!("{}…", &body[..idx]),
        None => body.to_string(),
    }
}

pub struct OAuthBroker {
    config: OAuthConfig,
    http: reqwest::Client,
    session: Mutex<Option<OAuthSession>>,
}

impl OAuthBroker {
    pub fn new(config: OAuthConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build OAuth HTTP client")?;
        Ok(Self {
            config,
            http,
            session: Mutex::new(None),
        })
    }

    fn session_slot(&self) -> std::sync::MutexGuard<'_, Option<OAuthSession>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn has_session(&self) -> bool {
        self.session_slot().is_some()
    }

    /// Account directory of the pending login, if any.
    pub fn pending_account(&self) -> Option<String> {
        self.session_slot()
            .as_ref()
            .map(|s| s.account_dir.display().to_string())
    }

    /// Begin a login for `account_dir`. Any earlier pending login is discarded.
    pub fn start(&self, account_dir: PathBuf) -> Result<OAuthStart, OAuthError> {
        let code_verifier = random_urlsafe(32);
        let state = random_urlsafe(32);
        let challenge = pkce_challenge(&code_verifier);
        let scope = self.config.scopes.join(" ");

        let url = Url::parse_with_params(
            &self.config.authorize_url,
            &[
                ("code", "true"),
                ("client_id", self.config.client_id.as_str()),
                ("response_type", "code"),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("scope", scope.as_str()),
                ("code_challenge", challenge.as_str()),
                ("code_challenge_method", "S256"),
                ("state", state.as_str()),
            ],
        )
        .map_err(|e| OAuthError::InvalidEndpoint {
            url: self.config.authorize_url.clone(),
            reason: e.to_string(),
        })?;

        let account = account_dir.display().to_string();
        let previous = self.session_slot().replace(OAuthSession {
            code_verifier,
            state,
            account_dir,
            created_at: Utc::now(),
        });
        if let Some(previous) = previous {
            tracing::info!(
                started_at = %previous.created_at,
                "replacing pending OAuth session"
            );
        }

        Ok(OAuthStart {
            url: url.into(),
            account_dir: account,
        })
    }

    /// Finish the pending login with the code the operator pasted.
    ///
    /// The pending session is consumed whether or not the exchange succeeds.
    pub async fn complete(&self, raw_code: &str) -> Result<OAuthComplete, OAuthError> {
        let code = clean_code(raw_code);
        if code.is_empty() {
            return Err(OAuthError::EmptyCode);
        }
        let session = self.session_slot().take().ok_or(OAuthError::NoSession)?;

        let tokens = self.exchange(code, &session).await?;
        let now_ms = Utc::now().timestamp_millis();
        let mut credentials = OAuthCredentials {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at: expiry_ms(now_ms, tokens.expires_in),
            scopes: tokens
                .scope
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_else(|| self.config.scopes.clone()),
            subscription_type: None,
            email: tokens.account.and_then(|a| a.email_address),
        };
        self.enrich_from_profile(&mut credentials).await;

        {
            let (dir, credentials) = (session.account_dir.clone(), credentials.clone());
            tokio::task::spawn_blocking(move || write_credentials(&dir, &credentials))
                .await
                .map_err(|e| OAuthError::Background(e.to_string()))??;
        }
        tracing::info!(
            account_dir = %session.account_dir.display(),
            "stored agent credentials"
        );

        Ok(OAuthComplete {
            account_dir: session.account_dir.display().to_string(),
            expires_at: credentials.expires_at,
            email: credentials.email,
        })
    }

    async fn exchange(&self, code: &str, session: &OAuthSession) -> Result<TokenResponse, OAuthError> {
        let body = serde_json::json!({
            "grant_type": "authorization_code",
            "code": code,
            "state": session.state,
            "client_id": self.config.client_id,
            "redirect_uri": self.config.redirect_uri,
            "code_verifier": session.code_verifier,
        });

        let resp = self
            .http
            .post(&self.config.token_url)
            .json(&body)
            .send()
            .await
            .map_err(OAuthError::Transport)?;
        let status = resp.status();
        let text = resp.text().await.map_err(OAuthError::Transport)?;

        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), "OAuth token exchange rejected");
            return Err(OAuthError::Exchange {
                status: status.as_u16(),
                body: truncate_body(&text),
            });
        }
        serde_json::from_str(&text).map_err(|e| OAuthError::InvalidResponse(e.to_string()))
    }

    /// Fill in email and subscription from the profile endpoint. Failures
    /// are logged and ignored.
    async fn enrich_from_profile(&self, credentials: &mut OAuthCredentials) {
        let Some(url) = &self.config.profile_url else {
            return;
        };
        let profile: Value = match self
            .http
            .get(url)
            .bearer_auth(&credentials.access_token)
            .send()
            .await
            .and_then(|r| r.error_for_status())
        {
            Ok(resp) => match resp.json().await {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "unreadable OAuth profile response");
                    return;
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "OAuth profile fetch failed");
                return;
            }
        };

        let account = &profile["account"];
        if let Some(email) = account["email"]
            .as_str()
            .or_else(|| account["email_address"].as_str())
        {
            credentials.email = Some(email.to_string());
        }
        if let Some(kind) = profile["organization"]["organization_type"].as_str() {
            credentials.subscription_type =
                Some(kind.strip_prefix("claude_").unwrap_or(kind).to_string());
        }
    }
}
