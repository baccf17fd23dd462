//! Plan linker: repo-relative planning documents required before a run.
//!
//! A plan path is accepted only if it is relative, uses forward slashes,
//! has no empty/`.`/`..` segments and ends in `.md`. After resolving it
//! against the canonical repository root (symlinks included) it must still
//! lie inside that root.

use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::PlansConfig;
use crate::errors::PlanError;

pub const PLAN_EXTENSION: &str = "md";

/// A plan file loaded from disk, capped at the configured size.
#[derive(Debug, Clone, Serialize)]
pub struct PlanDocument {
    pub repo_relative_path: String,
    pub content: String,
    pub size_bytes: u64,
    pub truncated: bool,
}

/// Result of generating a plan from the template.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedPlan {
    pub plan_path: String,
    /// False when a file with the derived name already existed and was left untouched.
    pub created: bool,
}

/// Convert a title to a filename-safe slug, limited to `max_len` characters.
pub fn slugify(title: &str, max_len: usize) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        slug[..max_len].trim_end_matches('-').to_string()
    } else {
        slug
    }
}

/// Check the shape of a candidate path without touching the filesystem.
pub fn validate_plan_path(candidate: &str) -> Result<String, PlanError> {
    let path = candidate.trim();
    if path.is_empty() {
        return Err(PlanError::EmptyPath);
    }
    if path.contains('\\') {
        return Err(PlanError::Backslash(path.to_string()));
    }
    if path.starts_with('/') || Path::new(path).has_root() || path.contains(':') {
        return Err(PlanError::Absolute(path.to_string()));
    }
    for segment in path.split('/') {
        if segment.is_empty() || segment == "." {
            return Err(PlanError::InvalidSegment(path.to_string()));
        }
        if segment == ".." {
            return Err(PlanError::Traversal(path.to_string()));
        }
    }
    let has_extension = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(PLAN_EXTENSION));
    if !has_extension {
        return Err(PlanError::Extension {
            path: path.to_string(),
            extension: PLAN_EXTENSION,
        });
    }
    // Belt and braces for anything Path parses differently from a '/' split.
    if Path::new(path)
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(PlanError::InvalidSegment(path.to_string()));
    }
    Ok(path.to_string())
}

fn io_error(path: &Path, source: std::io::Error) -> PlanError {
    PlanError::Io {
        path: path.to_path_buf(),
        source,
    }
}

async fn canonical_root(repo_root: &Path) -> Result<PathBuf, PlanError> {
    tokio::fs::canonicalize(repo_root)
        .await
        .map_err(|e| io_error(repo_root, e))
}

/// Resolve an existing plan file, rejecting anything outside `repo_root`.
pub async fn resolve_in_repo(repo_root: &Path, relative: &str) -> Result<PathBuf, PlanError> {
    let relative = validate_plan_path(relative)?;
    let root = canonical_root(repo_root).await?;
    let joined = root.join(&relative);
    let resolved = match tokio::fs::canonicalize(&joined).await {
        Ok(p) => p,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(PlanError::NotFound(relative));
        }
        Err(e) => return Err(io_error(&joined, e)),
    };
    if !resolved.starts_with(&root) {
        return Err(PlanError::Traversal(relative));
    }
    if !resolved.is_file() {
        return Err(PlanError::NotFound(relative));
    }
    Ok(resolved)
}

fn render_template(title: &str, repo: &str, summary: Option<&str>) -> String {
    let summary = summary
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("_Describe what this run should achieve._");
    format!(
        "# {title}\n\
         \n\
         - Repository: `{repo}`\n\
         - Created: {created}\n\
         \n\
         ## Goal\n\
         \n\
         {summary}\n\
         \n\
         ## Scope\n\
         \n\
         - Files and areas the agent may change:\n\
         \n\
         ## Steps\n\
         \n\
         1. \n\
         \n\
         ## Acceptance criteria\n\
         \n\
         - [ ] \n\
         \n\
         ## Out of scope\n\
         \n\
         - \n",
        created = chrono::Utc::now().format("%Y-%m-%d"),
    )
}

/// Prompt handed to the agent: the operator's request followed by the plan.
pub fn agent_prompt(prompt: &str, plan: &PlanDocument) -> String {
    let mut out = format!(
        "{}\n\nFollow the linked plan at {}:\n\n{}",
        prompt.trim(),
        plan.repo_relative_path,
        plan.content
    );
    if plan.truncated {
        out.push_str("\n\n[plan truncated; read the full file from the repository]");
    }
    out
}

pub struct PlanLinker {
    plans_dir: String,
    max_bytes: usize,
}

impl PlanLinker {
    pub fn new(config: &PlansConfig) -> Self {
        Self {
            plans_dir: config.dir.trim_matches('/').to_string(),
            max_bytes: config.max_bytes,
        }
    }

    /// Repo-relative path a plan titled `title` is generated at.
    pub fn derived_path(&self, title: &str) -> Result<String, PlanError> {
        let slug = slugify(title, 80);
        if slug.is_empty() {
            return Err(PlanError::EmptyTitle);
        }
        validate_plan_path(&format!("{}/{}.{}", self.plans_dir, slug, PLAN_EXTENSION))
    }

    /// Generate a templated plan under the plans directory. Never overwrites.
    pub async fn create(
        &self,
        repo_root: &Path,
        repo: &str,
        title: &str,
        summary: Option<&str>,
    ) -> Result<CreatedPlan, PlanError> {
        let plan_path = self.derived_path(title)?;
        let root = canonical_root(repo_root).await?;

        self.ensure_plans_dir(&root).await?;

        let target = root.join(&plan_path);
        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)
            .await
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                // Make sure the existing entry is a real file inside the repo.
                resolve_in_repo(&root, &plan_path).await?;
                return Ok(CreatedPlan {
                    plan_path,
                    created: false,
                });
            }
            Err(e) => return Err(io_error(&target, e)),
        };

        file.write_all(render_template(title.trim(), repo, summary).as_bytes())
            .await
            .map_err(|e| io_error(&target, e))?;
        file.flush().await.map_err(|e| io_error(&target, e))?;

        tracing::info!(repo, plan_path = %plan_path, "generated plan");
        Ok(CreatedPlan {
            plan_path,
            created: true,
        })
    }

    /// Create the plans directory one segment at a time, resolving each
    /// step so nothing is ever created through a link leading out of `root`.
    async fn ensure_plans_dir(&self, root: &Path) -> Result<PathBuf, PlanError> {
        let mut current = root.to_path_buf();
        for segment in self.plans_dir.split('/').filter(|s| !s.is_empty()) {
            let next = current.join(segment);
            match tokio::fs::create_dir(&next).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(io_error(&next, e)),
            }
            let resolved = tokio::fs::canonicalize(&next)
                .await
                .map_err(|e| io_error(&next, e))?;
            if !resolved.starts_with(root) {
                return Err(PlanError::Traversal(self.plans_dir.clone()));
            }
            if !resolved.is_dir() {
                return Err(PlanError::InvalidSegment(self.plans_dir.clone()));
            }
            current = resolved;
        }
        Ok(current)
    }

    /// Resolve and read a plan, truncating content beyond the size cap.
    pub async fn load(&self, repo_root: &Path, relative: &str) -> Result<PlanDocument, PlanError> {
        let resolved = resolve_in_repo(repo_root, relative).await?;
        let file = tokio::fs::File::open(&resolved)
            .await
            .map_err(|e| io_error(&resolved, e))?;
        let size_bytes = file
            .metadata()
            .await
            .map_err(|e| io_error(&resolved, e))?
            .len();

        let mut buf = Vec::with_capacity(self.max_bytes.min(size_bytes as usize));
        file.take(self.max_bytes as u64)
            .read_to_end(&mut buf)
            .await
            .map_err(|e| io_error(&resolved, e))?;

        Ok(PlanDocument {
            repo_relative_path: validate_plan_path(relative)?,
            content: String::from_utf8_lossy(&buf).into_owned(),
            size_bytes,
            truncated: size_bytes > self.max_bytes as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn linker() -> PlanLinker {
        PlanLinker::new(&PlansConfig::default())
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("v1.1 task 7", 80), "v1-1-task-7");
        assert_eq!(slugify("  Fix: header/footer!! ", 80), "fix-header-footer");
        assert_eq!(slugify("abc def ghi", 6), "abc-de");
        assert_eq!(slugify("abc def", 4), "abc");
        assert_eq!(slugify("!!!", 10), "");
    }

    #[test]
    fn test_validate_accepts_nested_markdown() {
        assert_eq!(
            validate_plan_path("tasks/kanban/v1-1-task-7.md").unwrap(),
            "tasks/kanban/v1-1-task-7.md"
        );
        assert!(validate_plan_path("PLAN.MD").is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_shapes() {
        assert!(matches!(validate_plan_path("  "), Err(PlanError::EmptyPath)));
        assert!(matches!(
            validate_plan_path("/etc/passwd.md"),
            Err(PlanError::Absolute(_))
        ));
        assert!(matches!(
            validate_plan_path("tasks\\plan.md"),
            Err(PlanError::Backslash(_))
        ));
        assert!(matches!(
            validate_plan_path("tasks//plan.md"),
            Err(PlanError::InvalidSegment(_))
        ));
        assert!(matches!(
            validate_plan_path("./plan.md"),
            Err(PlanError::InvalidSegment(_))
        ));
        assert!(matches!(
            validate_plan_path("tasks/../../secret.md"),
            Err(PlanError::Traversal(_))
        ));
        assert!(matches!(
            validate_plan_path("tasks/plan.txt"),
            Err(PlanError::Extension { .. })
        ));
        assert!(matches!(
            validate_plan_path("C:/plan.md"),
            Err(PlanError::Absolute(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_rejects_symlink_escape() {
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret.md"), "secret").unwrap();

        let repo = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), repo.path().join("linked")).unwrap();

        let err = resolve_in_repo(repo.path(), "linked/secret.md")
            .await
            .unwrap_err();
        assert!(matches!(err, PlanError::Traversal(_)));
    }

    #[tokio::test]
    async fn test_create_refuses_linked_plans_dir_without_touching_target() {
        let outside = TempDir::new().unwrap();
        let repo = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), repo.path().join("tasks")).unwrap();

        let err = linker()
            .create(repo.path(), "site-a", "escape attempt", None)
            .await
            .unwrap_err();
        assert!(matches!(err, PlanError::Traversal(_)));
        assert!(!outside.path().join("kanban").exists());
        assert_eq!(std::fs::read_dir(outside.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_resolve_missing_file_is_not_found() {
        let repo = TempDir::new().unwrap();
        let err = resolve_in_repo(repo.path(), "tasks/nope.md")
            .await
            .unwrap_err();
        assert!(matches!(err, PlanError::NotFound(_)));
        assert!(err.requires_plan());
    }

    #[tokio::test]
    async fn test_resolve_directory_is_not_found() {
        let repo = TempDir::new().unwrap();
        std::fs::create_dir_all(repo.path().join("dir.md")).unwrap();
        let err = resolve_in_repo(repo.path(), "dir.md").await.unwrap_err();
        assert!(matches!(err, PlanError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_create_generates_template_once() {
        let repo = TempDir::new().unwrap();
        let linker = linker();

        let created = linker
            .create(repo.path(), "site-a", "v1.1 task 7", Some("Ship the kanban board"))
            .await
            .unwrap();
        assert!(created.created);
        assert_eq!(created.plan_path, "tasks/kanban/v1-1-task-7.md");

        let on_disk =
            std::fs::read_to_string(repo.path().join("tasks/kanban/v1-1-task-7.md")).unwrap();
        assert!(on_disk.starts_with("# v1.1 task 7"));
        assert!(on_disk.contains("Ship the kanban board"));
        assert!(on_disk.contains("`site-a`"));

        std::fs::write(repo.path().join("tasks/kanban/v1-1-task-7.md"), "edited").unwrap();
        let again = linker
            .create(repo.path(), "site-a", "v1.1 task 7", None)
            .await
            .unwrap();
        assert!(!again.created);
        assert_eq!(again.plan_path, created.plan_path);
        let on_disk =
            std::fs::read_to_string(repo.path().join("tasks/kanban/v1-1-task-7.md")).unwrap();
        assert_eq!(on_disk, "edited");
    }

    #[tokio::test]
    async fn test_create_rejects_empty_title() {
        let repo = TempDir::new().unwrap();
        let err = linker()
            .create(repo.path(), "site-a", "???", None)
            .await
            .unwrap_err();
        assert!(matches!(err, PlanError::EmptyTitle));
    }

    #[tokio::test]
    async fn test_load_truncates_beyond_cap() {
        let repo = TempDir::new().unwrap();
        std::fs::write(repo.path().join("big.md"), "x".repeat(100)).unwrap();
        let linker = PlanLinker::new(&PlansConfig {
            dir: "tasks/kanban".into(),
            max_bytes: 10,
        });

        let doc = linker.load(repo.path(), "big.md").await.unwrap();
        assert_eq!(doc.content.len(), 10);
        assert_eq!(doc.size_bytes, 100);
        assert!(doc.truncated);
    }

    #[test]
    fn test_agent_prompt_appends_plan() {
        let doc = PlanDocument {
            repo_relative_path: "tasks/kanban/a.md".into(),
            content: "# A\n".into(),
            size_bytes: 4,
            truncated: true,
        };
        let prompt = agent_prompt("  fix it ", &doc);
        assert!(prompt.starts_with("fix it\n\nFollow the linked plan at tasks/kanban/a.md"));
        assert!(prompt.contains("# A\n"));
        assert!(prompt.ends_with("repository]"));
    }

    #[tokio::test]
    async fn test_load_small_file_untouched() {
        let repo = TempDir::new().unwrap();
        std::fs::create_dir_all(repo.path().join("docs")).unwrap();
        std::fs::write(repo.path().join("docs/plan.md"), "# Plan\n").unwrap();

        let doc = linker().load(repo.path(), "docs/plan.md").await.unwrap();
        assert_eq!(doc.content, "# Plan\n");
        assert_eq!(doc.repo_relative_path, "docs/plan.md");
        assert!(!doc.truncated);
    }
}
