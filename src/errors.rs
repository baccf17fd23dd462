//! Typed error hierarchy for the master control plane.
//!
//! One enum per subsystem; the HTTP layer (`master::api::ApiError`) maps
//! each variant onto a status code and a stable error code:
//! - `PlanError`: plan path validation and linkage
//! - `GateError`: single-flight task slot
//! - `TokenError`: signed session / step-up tokens
//! - `CredentialsError`: on-disk agent credentials
//! - `OAuthError`: PKCE start/complete exchange

use std::path::PathBuf;

use thiserror::Error;

/// Errors from the plan linker.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("A linked plan is required before running (pass plan_path)")]
    Missing,

    #[error("Plan path must not be empty")]
    EmptyPath,

    #[error("Plan path must be relative to the repository root: {0}")]
    Absolute(String),

    #[error("Plan path must use forward slashes: {0}")]
    Backslash(String),

    #[error("Plan path contains an invalid segment: {0}")]
    InvalidSegment(String),

    #[error("Plan path must end in .{extension}: {path}")]
    Extension { path: String, extension: &'static str },

    #[error("Plan path escapes the repository root: {0}")]
    Traversal(String),

    #[error("Plan file not found: {0}")]
    NotFound(String),

    #[error("Plan {path} is not linked for repo {repo}; create or link it first")]
    NotLinked { repo: String, path: String },

    #[error("Plan title must contain at least one letter or digit")]
    EmptyTitle,

    #[error("Failed to access plan at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PlanError {
    /// Whether the error means "no usable plan" rather than a malformed path.
    pub fn requires_plan(&self) -> bool {
        matches!(
            self,
            PlanError::Missing | PlanError::NotFound(_) | PlanError::NotLinked { .. }
        )
    }
}

/// Errors from the single-flight task gate.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("A task is already running: {task_id}")]
    AlreadyRunning { task_id: String },

    #[error("Task not found or already finished: {task_id}")]
    NotFound { task_id: String },
}

/// Errors verifying a signed token.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("Token is malformed")]
    Malformed,

    #[error("Token signature is invalid")]
    BadSignature,

    #[error("Token has expired")]
    Expired,

    #[error("Token has the wrong type")]
    WrongType,
}

/// Errors reading or writing the agent credential file.
#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("Failed to access credentials at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Credentials at {path} are not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Credentials at {0} do not contain an access token")]
    MissingToken(PathBuf),

    #[error("Failed to serialize credentials: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Errors from the OAuth PKCE broker.
#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("Authorization code is empty")]
    EmptyCode,

    #[error("No OAuth session in progress; start a new login first")]
    NoSession,

    #[error("Invalid account directory: {0}")]
    InvalidAccount(String),

    #[error("Invalid OAuth endpoint URL {url}: {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error("Token exchange failed ({status}): {body}")]
    Exchange { status: u16, body: String },

    #[error("Token exchange request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("Token endpoint returned an unusable response: {0}")]
    InvalidResponse(String),

    #[error("Credential write task failed: {0}")]
    Background(String),

    #[error(transparent)]
    Credentials(#[from] CredentialsError),
}
