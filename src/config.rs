//! Layered configuration for the master control plane.
//!
//! Values are read from `master.toml` (optional), then overridden by the
//! environment (`.env` is loaded by `main`), then by CLI flags.
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3000
//! db_path = ".master/master.db"
//!
//! [auth]
//! token_secret = "change-me"
//! max_attempts = 5
//! attempt_window_secs = 900
//!
//! [step_up]
//! enabled = true
//! ttl_secs = 300
//!
//! [runner]
//! claude_cmd = "/home/deploy/local/bin/claude"
//! default_repo = "site-a"
//! default_account = "primary"
//! accounts_root = "/home/deploy/.claude-accounts"
//!
//! [runner.repos]
//! site-a = "/home/deploy/repositories/site-a"
//! site-b = "/home/deploy/repositories/site-b"
//!
//! [plans]
//! dir = "tasks/kanban"
//! max_bytes = 65536
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Lower clamp for a task timeout (1 minute).
pub const MIN_TIMEOUT_MS: u64 = 60_000;
/// Upper clamp for a task timeout (60 minutes).
pub const MAX_TIMEOUT_MS: u64 = 3_600_000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MasterConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub step_up: StepUpConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub plans: PlansConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Permissive CORS for a local admin UI dev server.
    #[serde(default)]
    pub dev: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".master/master.db")
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db_path: default_db_path(),
            dev: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HMAC key for session and step-up tokens. Usually set via `MASTER_TOKEN_SECRET`.
    #[serde(default, skip_serializing)]
    pub token_secret: Option<String>,
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: i64,
    /// Failed password attempts allowed per key (client IP for login,
    /// operator for step-up) within `attempt_window_secs`.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_attempt_window")]
    pub attempt_window_secs: u64,
}

fn default_session_ttl() -> i64 {
    24 * 60 * 60
}

fn default_max_attempts() -> usize {
    5
}

fn default_attempt_window() -> u64 {
    15 * 60
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_secret: None,
            session_ttl_secs: default_session_ttl(),
            max_attempts: default_max_attempts(),
            attempt_window_secs: default_attempt_window(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepUpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_step_up_ttl")]
    pub ttl_secs: i64,
}

fn default_true() -> bool {
    true
}

fn default_step_up_ttl() -> i64 {
    5 * 60
}

impl Default for StepUpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_step_up_ttl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_claude_cmd")]
    pub claude_cmd: String,
    /// Repository name → working directory.
    #[serde(default)]
    pub repos: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub default_repo: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Curated PATH handed to the agent process.
    #[serde(default = "default_agent_path")]
    pub path: String,
    /// HOME for the agent process; defaults to the server user's home.
    #[serde(default)]
    pub home: Option<PathBuf>,
    /// Directory holding one sub-directory per agent account.
    #[serde(default)]
    pub accounts_root: Option<PathBuf>,
    #[serde(default)]
    pub default_account: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// How long to wait for output pipes to drain after a kill.
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
}

fn default_claude_cmd() -> String {
    "claude".to_string()
}

fn default_timeout_ms() -> u64 {
    600_000
}

fn default_agent_path() -> String {
    "/usr/local/bin:/usr/bin:/bin".to_string()
}

fn default_keep_alive_secs() -> u64 {
    5
}

fn default_kill_grace_ms() -> u64 {
    3_000
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            claude_cmd: default_claude_cmd(),
            repos: BTreeMap::new(),
            default_repo: None,
            default_timeout_ms: default_timeout_ms(),
            path: default_agent_path(),
            home: None,
            accounts_root: None,
            default_account: None,
            keep_alive_secs: default_keep_alive_secs(),
            kill_grace_ms: default_kill_grace_ms(),
        }
    }
}

impl RunnerConfig {
    pub fn home_dir(&self) -> PathBuf {
        self.home
            .clone()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("/"))
    }

    pub fn accounts_root(&self) -> PathBuf {
        self.accounts_root
            .clone()
            .unwrap_or_else(|| self.home_dir())
    }

    /// Account directory used when a request names none.
    pub fn default_account_dir(&self) -> PathBuf {
        match &self.default_account {
            Some(name) => self.accounts_root().join(name),
            None => self.home_dir().join(".claude"),
        }
    }

    /// Clamp a requested timeout into the allowed window, falling back to the default.
    pub fn clamp_timeout(&self, requested_ms: Option<u64>) -> u64 {
        requested_ms
            .unwrap_or(self.default_timeout_ms)
            .clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlansConfig {
    /// Repo-relative directory that generated plans are written to.
    #[serde(default = "default_plans_dir")]
    pub dir: String,
    #[serde(default = "default_plan_max_bytes")]
    pub max_bytes: usize,
}

fn default_plans_dir() -> String {
    "tasks/kanban".to_string()
}

fn default_plan_max_bytes() -> usize {
    64 * 1024
}

impl Default for PlansConfig {
    fn default() -> Self {
        Self {
            dir: default_plans_dir(),
            max_bytes: default_plan_max_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    #[serde(default = "default_authorize_url")]
    pub authorize_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    /// Best-effort identity lookup after a successful exchange.
    #[serde(default = "default_profile_url")]
    pub profile_url: Option<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
}

fn default_authorize_url() -> String {
    "https://claude.ai/oauth/authorize".to_string()
}

fn default_token_url() -> String {
    "https://console.anthropic.com/v1/oauth/token".to_string()
}

fn default_profile_url() -> Option<String> {
    Some("https://api.anthropic.com/api/oauth/profile".to_string())
}

fn default_client_id() -> String {
    "9d1c250a-e61b-44d9-88ed-5944d1962f5e".to_string()
}

fn default_redirect_uri() -> String {
    "https://console.anthropic.com/oauth/code/callback".to_string()
}

fn default_scopes() -> Vec<String> {
    vec![
        "org:create_api_key".to_string(),
        "user:profile".to_string(),
        "user:inference".to_string(),
    ]
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            authorize_url: default_authorize_url(),
            token_url: default_token_url(),
            profile_url: default_profile_url(),
            client_id: default_client_id(),
            redirect_uri: default_redirect_uri(),
            scopes: default_scopes(),
        }
    }
}

impl MasterConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid master.toml")
    }

    /// Load from `path` when it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) if p.exists() => Self::load(p),
            Some(p) => {
                tracing::debug!(path = %p.display(), "config file not found, using defaults");
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup (tests pass a map).
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(secret) = lookup("MASTER_TOKEN_SECRET").filter(|s| !s.is_empty()) {
            self.auth.token_secret = Some(secret);
        }
        if let Some(port) = lookup("MASTER_PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
        if let Some(db_path) = lookup("MASTER_DB_PATH") {
            self.server.db_path = PathBuf::from(db_path);
        }
        if let Some(cmd) = lookup("CLAUDE_CMD").filter(|s| !s.is_empty()) {
            self.runner.claude_cmd = cmd;
        }
        if let Some(enabled) = lookup("MASTER_STEP_UP") {
            self.step_up.enabled = enabled != "false" && enabled != "0";
        }
    }

    /// Resolve a repo reference (or the default repo) to its configured directory.
    pub fn resolve_repo(&self, repo: Option<&str>) -> Option<(String, PathBuf)> {
        let name = match repo.map(str::trim).filter(|r| !r.is_empty()) {
            Some(name) => name.to_string(),
            None => self.runner.default_repo.clone()?,
        };
        self.runner
            .repos
            .get(&name)
            .map(|path| (name.clone(), path.clone()))
    }

    /// Return human-readable warnings about the effective configuration.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        match self.auth.token_secret.as_deref() {
            None => warnings.push(
                "auth.token_secret is not set (MASTER_TOKEN_SECRET); sessions will not survive a restart"
                    .to_string(),
            ),
            Some(s) if s.len() < 32 => {
                warnings.push("auth.token_secret is shorter than 32 bytes".to_string())
            }
            Some(_) => {}
        }

        if self.auth.max_attempts == 0 {
            warnings.push("auth.max_attempts is 0; password attempts are not rate limited".to_string());
        }

        if self.runner.repos.is_empty() {
            warnings.push("runner.repos is empty; no task can be started".to_string());
        }

        if let Some(ref default_repo) = self.runner.default_repo
            && !self.runner.repos.contains_key(default_repo)
        {
            warnings.push(format!(
                "runner.default_repo '{}' is not listed in runner.repos",
                default_repo
            ));
        }

        for (name, path) in &self.runner.repos {
            if !path.is_absolute() {
                warnings.push(format!(
                    "runner.repos.{} should be an absolute path (got {})",
                    name,
                    path.display()
                ));
            }
        }

        let clamped = self.runner.default_timeout_ms.clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS);
        if clamped != self.runner.default_timeout_ms {
            warnings.push(format!(
                "runner.default_timeout_ms {} is outside 1-60 minutes and will be clamped to {}",
                self.runner.default_timeout_ms, clamped
            ));
        }

        if !self.step_up.enabled {
            warnings.push("step_up.enabled = false; sensitive operations are not re-authenticated".to_string());
        }

        if self.plans.dir.starts_with('/') || self.plans.dir.split('/').any(|s| s == "..") {
            warnings.push(format!(
                "plans.dir '{}' must be a relative path inside the repository",
                self.plans.dir
            ));
        }

        warnings
    }
}
