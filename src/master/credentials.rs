//! Agent credential file handling.
//!
//! Credentials live at `<account_dir>/.credentials.json` under a
//! `claudeAiOauth` key, written by the OAuth broker and read by the
//! process supervisor. Readers accept older layouts too: a bare top-level
//! object, snake_case keys and expiry in seconds instead of milliseconds.

use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::RunnerConfig;
use crate::errors::{CredentialsError, OAuthError};

pub const CREDENTIALS_FILE: &str = ".credentials.json";

/// Expiry values below this are taken to be unix seconds.
const SECONDS_CUTOFF: i64 = 10_000_000_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OAuthCredentials {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Unix epoch milliseconds.
    pub expires_at: i64,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl OAuthCredentials {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at <= now_ms
    }
}

#[derive(Serialize)]
struct CredentialsFile<'a> {
    #[serde(rename = "claudeAiOauth")]
    claude_ai_oauth: &'a OAuthCredentials,
}

/// What `GET /master/claude-oauth/status` reports.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CredentialStatus {
    pub authenticated: bool,
    pub expired: bool,
    pub expires_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_type: Option<String>,
    pub account_dir: String,
}

pub fn credentials_path(account_dir: &Path) -> PathBuf {
    account_dir.join(CREDENTIALS_FILE)
}

/// Map an optional account name onto its directory.
///
/// No name means the configured default account. A name must be a single
/// plain path segment and is resolved under the accounts root.
pub fn resolve_account_dir(
    runner: &RunnerConfig,
    account: Option<&str>,
) -> Result<PathBuf, OAuthError> {
    let name = match account.map(str::trim) {
        None | Some("") => return Ok(runner.default_account_dir()),
        Some(name) => name,
    };
    let valid = name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        return Err(OAuthError::InvalidAccount(name.to_string()));
    }
    Ok(runner.accounts_root().join(name))
}

fn str_field(obj: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(str::to_string)
}

/// Parse a credential file in any of the layouts seen in the wild.
pub fn parse_credentials(path: &Path, content: &str) -> Result<OAuthCredentials, CredentialsError> {
    let root: Value = serde_json::from_str(content).map_err(|source| CredentialsError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    let obj = root
        .get("claudeAiOauth")
        .or_else(|| root.get("claude_ai_oauth"))
        .unwrap_or(&root);

    let access_token = str_field(obj, &["accessToken", "access_token"])
        .filter(|t| !t.is_empty())
        .ok_or_else(|| CredentialsError::MissingToken(path.to_path_buf()))?;

    let expires_at = ["expiresAt", "expires_at"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_i64))
        .map(|v| if v < SECONDS_CUTOFF { v * 1000 } else { v })
        .unwrap_or(0);

    let scopes = match obj.get("scopes").or_else(|| obj.get("scope")) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) => s.split_whitespace().map(str::to_string).collect(),
        _ => Vec::new(),
    };

    Ok(OAuthCredentials {
        access_token,
        refresh_token: str_field(obj, &["refreshToken", "refresh_token"]),
        expires_at,
        scopes,
        subscription_type: str_field(obj, &["subscriptionType", "subscription_type"]),
        email: str_field(obj, &["email", "emailAddress", "email_address"]),
    })
}

/// Read the credentials for an account; `Ok(None)` when no file exists.
pub async fn load_credentials(
    account_dir: &Path,
) -> Result<Option<OAuthCredentials>, CredentialsError> {
    let path = credentials_path(account_dir);
    match tokio::fs::read_to_string(&path).await {
        Ok(content) => parse_credentials(&path, &content).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(CredentialsError::Io { path, source }),
    }
}

/// Atomically replace the credential file: write a 0600 temp file, then rename.
pub fn write_credentials(
    account_dir: &Path,
    credentials: &OAuthCredentials,
) -> Result<PathBuf, CredentialsError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| CredentialsError::Io { path, source }
    };

    std::fs::create_dir_all(account_dir).map_err(io_err(account_dir))?;
    std::fs::set_permissions(account_dir, std::fs::Permissions::from_mode(0o700))
        .map_err(io_err(account_dir))?;

    let body = serde_json::to_vec_pretty(&CredentialsFile {
        claude_ai_oauth: credentials,
    })
    .map_err(CredentialsError::Serialize)?;

    let target = credentials_path(account_dir);
    let tmp = account_dir.join(format!("{}.{}.tmp", CREDENTIALS_FILE, uuid::Uuid::new_v4()));
    let result = (|| {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&tmp)?;
        file.write_all(&body)?;
        file.sync_all()?;
        std::fs::rename(&tmp, &target)
    })();
    if let Err(source) = result {
        let _ = std::fs::remove_file(&tmp);
        return Err(CredentialsError::Io {
            path: target,
            source,
        });
    }
    Ok(target)
}

/// Summarize the stored credentials for an account.
pub async fn credential_status(
    account_dir: &Path,
    now_ms: i64,
) -> Result<CredentialStatus, CredentialsError> {
    let account = account_dir.display().to_string();
    Ok(match load_credentials(account_dir).await? {
        Some(creds) => CredentialStatus {
            authenticated: true,
            expired: creds.is_expired(now_ms),
            expires_at: Some(creds.expires_at),
            email: creds.email,
            subscription_type: creds.subscription_type,
            account_dir: account,
        },
        None => CredentialStatus {
            authenticated: false,
            expired: false,
            expires_at: None,
            email: None,
            subscription_type: None,
            account_dir: account,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> OAuthCredentials {
        OAuthCredentials {
            access_token: "sk-ant-oat-abc".into(),
            refresh_token: Some("sk-ant-ort-def".into()),
            expires_at: 1_900_000_000_000,
            scopes: vec!["user:inference".into()],
            subscription_type: Some("max".into()),
            email: Some("ops@example.com".into()),
        }
    }

    #[test]
    fn test_write_is_private_and_wrapped() {
        let dir = TempDir::new().unwrap();
        let account = dir.path().join("acct");
        let path = write_credentials(&account, &sample()).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        let dir_mode = std::fs::metadata(&account).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["claudeAiOauth"]["accessToken"], "sk-ant-oat-abc");
        assert_eq!(raw["claudeAiOauth"]["expiresAt"], 1_900_000_000_000i64);

        // No temp files left behind.
        let entries: Vec<_> = std::fs::read_dir(&account).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_write_overwrites_previous() {
        let dir = TempDir::new().unwrap();
        write_credentials(dir.path(), &sample()).unwrap();
        let mut newer = sample();
        newer.access_token = "second".into();
        let path = write_credentials(dir.path(), &newer).unwrap();
        let parsed = parse_credentials(&path, &std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed.access_token, "second");
    }

    #[test]
    fn test_parse_legacy_shapes() {
        let p = Path::new("creds.json");

        let flat = r#"{"accessToken":"a","expiresAt":1900000000000,"scopes":["x"]}"#;
        assert_eq!(parse_credentials(p, flat).unwrap().access_token, "a");

        let snake = r#"{"access_token":"b","refresh_token":"r","expires_at":1900000000,"scope":"a b"}"#;
        let parsed = parse_credentials(p, snake).unwrap();
        assert_eq!(parsed.access_token, "b");
        assert_eq!(parsed.refresh_token.as_deref(), Some("r"));
        assert_eq!(parsed.expires_at, 1_900_000_000_000);
        assert_eq!(parsed.scopes, vec!["a", "b"]);
    }

    #[test]
    fn test_parse_errors() {
        let p = Path::new("creds.json");
        assert!(matches!(
            parse_credentials(p, "not json"),
            Err(CredentialsError::Parse { .. })
        ));
        assert!(matches!(
            parse_credentials(p, r#"{"claudeAiOauth":{"expiresAt":1}}"#),
            Err(CredentialsError::MissingToken(_))
        ));
    }

    #[tokio::test]
    async fn test_status_reports_expiry() {
        let dir = TempDir::new().unwrap();
        let missing = credential_status(dir.path(), 0).await.unwrap();
        assert!(!missing.authenticated);

        write_credentials(dir.path(), &sample()).unwrap();
        let fresh = credential_status(dir.path(), 1_800_000_000_000).await.unwrap();
        assert!(fresh.authenticated);
        assert!(!fresh.expired);
        assert_eq!(fresh.email.as_deref(), Some("ops@example.com"));

        let stale = credential_status(dir.path(), 2_000_000_000_000).await.unwrap();
        assert!(stale.expired);
    }

    #[test]
    fn test_resolve_account_dir() {
        let runner = RunnerConfig {
            home: Some(PathBuf::from("/home/agent")),
            accounts_root: Some(PathBuf::from("/srv/accounts")),
            ..RunnerConfig::default()
        };
        assert_eq!(
            resolve_account_dir(&runner, None).unwrap(),
            PathBuf::from("/home/agent/.claude")
        );
        assert_eq!(
            resolve_account_dir(&runner, Some("  ")).unwrap(),
            PathBuf::from("/home/agent/.claude")
        );
        assert_eq!(
            resolve_account_dir(&runner, Some("team-b")).unwrap(),
            PathBuf::from("/srv/accounts/team-b")
        );
        for bad in ["..", "a/b", "../etc", "a\\b", "."] {
            assert!(
                matches!(
                    resolve_account_dir(&runner, Some(bad)),
                    Err(OAuthError::InvalidAccount(_))
                ),
                "{bad}"
            );
        }
    }
}
