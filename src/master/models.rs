use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Agent model selectable for a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModelId {
    #[default]
    Sonnet,
    Opus,
    Haiku,
}

impl ModelId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sonnet => "sonnet",
            Self::Opus => "opus",
            Self::Haiku => "haiku",
        }
    }
}

impl FromStr for ModelId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sonnet" => Ok(Self::Sonnet),
            "opus" => Ok(Self::Opus),
            "haiku" => Ok(Self::Haiku),
            _ => Err(format!("Invalid model: {} (expected sonnet, opus or haiku)", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Completed,
    Killed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Killed => "killed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "killed" => Ok(Self::Killed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

/// Fully resolved parameters of one agent run.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSpec {
    pub id: String,
    pub repo: String,
    pub repo_path: std::path::PathBuf,
    pub model: ModelId,
    #[serde(skip)]
    pub prompt: String,
    pub plan_path: String,
    pub timeout_ms: u64,
}

/// Row in the task history table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub repo: String,
    pub model: String,
    pub plan_path: String,
    pub prompt_preview: String,
    pub timeout_ms: i64,
    pub status: TaskStatus,
    pub exit_code: Option<i32>,
    pub user_id: Option<i64>,
    pub started_at: String,
    pub finished_at: Option<String>,
}

/// A plan file recorded as linked to a repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanLink {
    pub id: i64,
    pub repo: String,
    pub plan_path: String,
    pub title: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Master,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Master => "master",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Self::Admin),
            "master" => Ok(Self::Master),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

/// Operator account allowed into the control plane.
#[derive(Debug, Clone, Serialize)]
pub struct Operator {
    pub id: i64,
    pub email: String,
    pub name: Option<String>,
    pub role: Role,
    #[serde(skip)]
    pub password_hash: String,
}

/// One row of the privileged-call audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub user_id: Option<i64>,
    pub path: String,
    pub method: String,
    pub ip: String,
    pub status: u16,
    pub meta: serde_json::Value,
    pub created_at: String,
}

/// First `max_chars` characters of a prompt, for logs and audit rows.
pub fn preview(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_id_round_trip_and_default() {
        assert_eq!(ModelId::default(), ModelId::Sonnet);
        assert_eq!("opus".parse::<ModelId>().unwrap(), ModelId::Opus);
        assert!("gpt".parse::<ModelId>().is_err());
        let json = serde_json::to_string(&ModelId::Haiku).unwrap();
        assert_eq!(json, "\"haiku\"");
    }

    #[test]
    fn test_task_status_strings() {
        for status in [
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Killed,
            TaskStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("master".parse::<Role>().unwrap(), Role::Master);
        assert!("user".parse::<Role>().is_err());
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        assert_eq!(preview("  short  ", 10), "short");
        assert_eq!(preview("æøåæøå", 3), "æøå…");
        assert_eq!(preview("abc", 3), "abc");
    }
}
