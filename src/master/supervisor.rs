//! Agent process supervision.
//!
//! `AgentEnv` is the only way secrets reach the child: the supervisor
//! clears the server's environment and hands the agent exactly the
//! variables resolved here. `Supervisor::launch` spawns the CLI, pumps
//! stdout/stderr line by line into the relay channel, and ends the run on
//! exit, cancellation (explicit or client disconnect) or timeout.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

#[cfg(unix)]
use nix::sys::signal::{Signal, killpg};
#[cfg(unix)]
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::credentials::load_credentials;
use super::db::DbHandle;
use super::gate::TaskLease;
use super::models::{TaskSpec, TaskStatus};
use super::relay::{RunEvent, strip_control};
use crate::config::RunnerConfig;

/// Events buffered between the process readers and the HTTP body.
const CHANNEL_CAPACITY: usize = 256;

/// Environment handed to the agent process.
#[derive(Clone)]
pub struct AgentEnv {
    vars: Vec<(String, String)>,
    has_token: bool,
}

impl fmt::Debug for AgentEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<&str> = self.vars.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("AgentEnv")
            .field("keys", &keys)
            .field("has_token", &self.has_token)
            .finish()
    }
}

impl AgentEnv {
    pub fn new(runner: &RunnerConfig, account_dir: &Path, oauth_token: Option<String>) -> Self {
        let mut vars = vec![
            ("PATH".to_string(), runner.path.clone()),
            ("HOME".to_string(), runner.home_dir().display().to_string()),
            ("LANG".to_string(), "C.UTF-8".to_string()),
            ("TERM".to_string(), "dumb".to_string()),
            ("NO_COLOR".to_string(), "1".to_string()),
            ("CI".to_string(), "1".to_string()),
            ("DISABLE_AUTOUPDATER".to_string(), "1".to_string()),
            ("DISABLE_TELEMETRY".to_string(), "1".to_string()),
            ("DISABLE_ERROR_REPORTING".to_string(), "1".to_string()),
            (
                "CLAUDE_CONFIG_DIR".to_string(),
                account_dir.display().to_string(),
            ),
        ];
        let has_token = oauth_token.is_some();
        if let Some(token) = oauth_token {
            vars.push(("CLAUDE_CODE_OAUTH_TOKEN".to_string(), token));
        }
        Self { vars, has_token }
    }

    /// Build the environment for `account_dir`, reading its stored credentials.
    ///
    /// Missing or unreadable credentials are not fatal: the agent is started
    /// without a token and falls back to whatever login its config dir holds.
    pub async fn resolve(runner: &RunnerConfig, account_dir: &Path) -> Self {
        let token = match load_credentials(account_dir).await {
            Ok(Some(creds)) => {
                if creds.is_expired(chrono::Utc::now().timestamp_millis()) {
                    tracing::warn!(
                        account_dir = %account_dir.display(),
                        "stored agent credentials are expired"
                    );
                }
                Some(creds.access_token)
            }
            Ok(None) => {
                tracing::warn!(
                    account_dir = %account_dir.display(),
                    "no stored agent credentials; starting agent without a token"
                );
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to read agent credentials");
                None
            }
        };
        Self::new(runner, account_dir, token)
    }

    pub fn vars(&self) -> &[(String, String)] {
        &self.vars
    }

    pub fn has_token(&self) -> bool {
        self.has_token
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

pub struct Supervisor {
    claude_cmd: PathBuf,
    kill_grace: Duration,
    db: DbHandle,
}

impl Supervisor {
    pub fn new(runner: &RunnerConfig, db: DbHandle) -> Self {
        Self {
            claude_cmd: PathBuf::from(&runner.claude_cmd),
            kill_grace: Duration::from_millis(runner.kill_grace_ms),
            db,
        }
    }

    pub fn build_command(&self, spec: &TaskSpec, env: &AgentEnv) -> Command {
        let mut cmd = Command::new(&self.claude_cmd);
        cmd.args([
            "--print",
            "--dangerously-skip-permissions",
            "--model",
            spec.model.as_str(),
            "-p",
            spec.prompt.as_str(),
        ])
        .current_dir(&spec.repo_path)
        .env_clear()
        .envs(env.vars().iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
        // Own process group, so anything the agent backgrounds dies with it.
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    /// Start the run in the background and return its event stream.
    ///
    /// The first event is always `start` and the last is always `done`. The
    /// lease is released before `done` is sent, so a client reacting to
    /// `done` can immediately start the next run.
    pub fn launch(&self, spec: TaskSpec, env: AgentEnv, lease: TaskLease) -> mpsc::Receiver<RunEvent> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut cmd = self.build_command(&spec, &env);
        let claude_cmd = self.claude_cmd.clone();
        let kill_grace = self.kill_grace;
        let db = self.db.clone();

        tokio::spawn(async move {
            let token = lease.cancel_token();
            let task_id = spec.id.clone();
            // The channel is empty here; try_send never waits on the client.
            let _ = tx.try_send(RunEvent::Start {
                task_id: task_id.clone(),
                repo: spec.repo.clone(),
                cwd: spec.repo_path.clone(),
                model: spec.model,
                plan_path: spec.plan_path.clone(),
                timeout_ms: spec.timeout_ms,
            });

            tracing::info!(
                task_id = %task_id,
                repo = %spec.repo,
                model = spec.model.as_str(),
                has_token = env.has_token(),
                "starting agent"
            );

            let (code, status) = match cmd.spawn() {
                Ok(child) => {
                    let timeout = Duration::from_millis(spec.timeout_ms);
                    supervise(child, &tx, token, timeout, kill_grace).await
                }
                Err(e) => {
                    tracing::error!(task_id = %task_id, error = %e, "failed to spawn agent");
                    let _ = tx.try_send(RunEvent::Err {
                        text: format!("Failed to start {}: {}", claude_cmd.display(), e),
                    });
                    (Some(1), TaskStatus::Failed)
                }
            };

            {
                let task_id = task_id.clone();
                if let Err(e) = db
                    .call(move |db| db.finish_task(&task_id, status, code))
                    .await
                {
                    tracing::warn!(error = %e, "failed to record task result");
                }
            }
            drop(lease);

            tracing::info!(task_id = %task_id, ?code, status = status.as_str(), "agent finished");
            let _ = tx.send(RunEvent::Done { code, status }).await;
        });

        rx
    }
}

/// Wait for the child to exit, be cancelled or time out. Nothing in the
/// termination path waits on the event channel, so a client that stopped
/// reading cannot keep the process alive.
async fn supervise(
    mut child: Child,
    tx: &mpsc::Sender<RunEvent>,
    token: CancellationToken,
    timeout: Duration,
    kill_grace: Duration,
) -> (Option<i32>, TaskStatus) {
    let pgid = child.id();
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(pump(stdout, tx.clone(), Stream::Stdout)));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(pump(stderr, tx.clone(), Stream::Stderr)));
    }

    let mut timed_out = false;
    let outcome = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => {
                let state = if status.success() {
                    TaskStatus::Completed
                } else {
                    TaskStatus::Failed
                };
                (status.code(), state)
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to wait for agent");
                (None, TaskStatus::Failed)
            }
        },
        _ = token.cancelled() => {
            tracing::info!("agent cancelled");
            kill(&mut child, pgid).await;
            (None, TaskStatus::Killed)
        }
        _ = tokio::time::sleep(timeout) => {
            tracing::warn!(timeout_ms = timeout.as_millis() as u64, "agent timed out");
            kill(&mut child, pgid).await;
            timed_out = true;
            (None, TaskStatus::Killed)
        }
    };

    // Leftovers from a clean exit still hold the pipes open.
    kill_group(pgid);

    // Let buffered output drain; readers still blocked after the grace
    // period are abandoned.
    let aborts: Vec<_> = readers.iter().map(|h| h.abort_handle()).collect();
    let drain = futures_util::future::join_all(readers);
    if tokio::time::timeout(kill_grace, drain).await.is_err() {
        tracing::debug!("output readers still open after grace period");
        for handle in aborts {
            handle.abort();
        }
    }

    if timed_out {
        let notice = RunEvent::Err {
            text: format!("Task timed out after {} ms", timeout.as_millis()),
        };
        if tokio::time::timeout(kill_grace, tx.send(notice)).await.is_err() {
            tracing::debug!("timeout notice dropped; client is not reading");
        }
    }

    outcome
}

/// SIGKILL the agent's process group. A group that is already gone is fine.
#[cfg(unix)]
fn kill_group(pgid: Option<u32>) {
    let Some(pgid) = pgid else {
        return;
    };
    match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pgid, error = %e, "failed to signal agent process group"),
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: Option<u32>) {}

async fn kill(child: &mut Child, pgid: Option<u32>) {
    kill_group(pgid);
    if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, "failed to kill agent process");
    }
}

async fn pump<R: AsyncRead + Unpin>(reader: R, tx: mpsc::Sender<RunEvent>, stream: Stream) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = strip_control(&String::from_utf8_lossy(&buf));
                if text.is_empty() {
                    continue;
                }
                let event = match stream {
                    Stream::Stdout => RunEvent::Out { text },
                    Stream::Stderr => RunEvent::Err { text },
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(?stream, error = %e, "agent output read failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master::db::MasterDb;
    use crate::master::gate::TaskGate;
    use crate::master::models::ModelId;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn fake_cli(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-claude.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn runner(cmd: &Path, home: &Path) -> RunnerConfig {
        RunnerConfig {
            claude_cmd: cmd.display().to_string(),
            home: Some(home.to_path_buf()),
            kill_grace_ms: 500,
            ..RunnerConfig::default()
        }
    }

    fn spec(repo: &Path, timeout_ms: u64) -> TaskSpec {
        TaskSpec {
            id: uuid::Uuid::new_v4().to_string(),
            repo: "site-a".into(),
            repo_path: repo.to_path_buf(),
            model: ModelId::Haiku,
            prompt: "fix the header".into(),
            plan_path: "tasks/kanban/header.md".into(),
            timeout_ms,
        }
    }

    fn db() -> DbHandle {
        DbHandle::new(MasterDb::new_in_memory().unwrap())
    }

    async fn collect(mut rx: mpsc::Receiver<RunEvent>) -> Vec<RunEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn output(events: &[RunEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                RunEvent::Out { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    async fn run(
        script: &str,
        timeout_ms: u64,
        env_token: Option<&str>,
    ) -> (Vec<RunEvent>, TaskGate, DbHandle, String) {
        let tmp = TempDir::new().unwrap();
        let cli = fake_cli(tmp.path(), script);
        let runner = runner(&cli, tmp.path());
        let db = db();
        let gate = TaskGate::new();
        let spec = spec(tmp.path(), timeout_ms);
        let id = spec.id.clone();
        db.lock_sync().unwrap().insert_task(&spec, None).unwrap();

        let lease = gate.try_acquire(&spec).unwrap();
        let env = AgentEnv::new(
            &runner,
            &tmp.path().join(".claude"),
            env_token.map(str::to_string),
        );
        let rx = Supervisor::new(&runner, db.clone()).launch(spec, env, lease);
        let events = collect(rx).await;
        (events, gate, db, id)
    }

    #[tokio::test]
    async fn test_successful_run_event_order() {
        let (events, gate, db, id) = run("echo one\necho two >&2\necho three", 60_000, None).await;

        assert!(matches!(events.first(), Some(RunEvent::Start { .. })));
        assert_eq!(
            events.last(),
            Some(&RunEvent::Done {
                code: Some(0),
                status: TaskStatus::Completed
            })
        );
        assert_eq!(output(&events), "one\nthree\n");
        assert!(events.contains(&RunEvent::Err { text: "two\n".into() }));

        assert!(gate.current().is_none());
        let record = db.lock_sync().unwrap().get_task(&id).unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_environment_is_sanitized() {
        let script = r#"echo "token=$CLAUDE_CODE_OAUTH_TOKEN"
echo "ci=$CI"
echo "cargo=${CARGO_PKG_NAME:-unset}"
echo "args=$*""#;
        let (events, ..) = run(script, 60_000, Some("sk-test")).await;
        let out = output(&events);
        assert!(out.contains("token=sk-test\n"), "{out}");
        assert!(out.contains("ci=1\n"));
        assert!(out.contains("cargo=unset\n"));
        assert!(out.contains("--model haiku -p fix the header"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failed() {
        let (events, ..) = run("echo oops >&2\nexit 3", 60_000, None).await;
        assert_eq!(
            events.last(),
            Some(&RunEvent::Done {
                code: Some(3),
                status: TaskStatus::Failed
            })
        );
    }

    #[tokio::test]
    async fn test_control_codes_stripped() {
        let (events, ..) = run(r"printf '\033[31mred\033[0m\n'", 60_000, None).await;
        assert_eq!(output(&events), "red\n");
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let started = std::time::Instant::now();
        let (events, gate, db, id) = run("echo begin\nexec sleep 30", 300, None).await;
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(
            events.last(),
            Some(&RunEvent::Done {
                code: None,
                status: TaskStatus::Killed
            })
        );
        assert!(events.iter().any(
            |e| matches!(e, RunEvent::Err { text } if text.contains("timed out"))
        ));
        assert!(gate.current().is_none());
        let record = db.lock_sync().unwrap().get_task(&id).unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Killed);
    }

    #[tokio::test]
    async fn test_cancel_kills_process_and_releases_gate() {
        let tmp = TempDir::new().unwrap();
        let cli = fake_cli(tmp.path(), "echo ready\nexec sleep 30");
        let runner = runner(&cli, tmp.path());
        let gate = TaskGate::new();
        let spec = spec(tmp.path(), 60_000);
        let id = spec.id.clone();

        let lease = gate.try_acquire(&spec).unwrap();
        let env = AgentEnv::new(&runner, tmp.path(), None);
        let mut rx = Supervisor::new(&runner, db()).launch(spec, env, lease);

        // Wait for the process to be up before cancelling.
        loop {
            match rx.recv().await {
                Some(RunEvent::Out { .. }) => break,
                Some(_) => continue,
                None => panic!("stream ended early"),
            }
        }
        gate.cancel(&id).unwrap();

        let rest = tokio::time::timeout(Duration::from_secs(5), collect(rx))
            .await
            .unwrap();
        assert_eq!(
            rest.last(),
            Some(&RunEvent::Done {
                code: None,
                status: TaskStatus::Killed
            })
        );
        assert!(gate.current().is_none());
    }

    /// Linux: a zombie awaiting its reaper counts as gone.
    #[cfg(target_os = "linux")]
    fn process_alive(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .is_some_and(|rest| !rest.trim_start().starts_with('Z')),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    async fn wait_gone(pid: i32) -> bool {
        for _ in 0..40 {
            if !process_alive(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_cancel_kills_background_children() {
        let tmp = TempDir::new().unwrap();
        let pid_file = tmp.path().join("bg.pid");
        let script = format!(
            "sleep 30 &\necho $! > '{}'\necho started\nwait",
            pid_file.display()
        );
        let cli = fake_cli(tmp.path(), &script);
        let runner = runner(&cli, tmp.path());
        let gate = TaskGate::new();
        let spec = spec(tmp.path(), 60_000);
        let id = spec.id.clone();

        let lease = gate.try_acquire(&spec).unwrap();
        let env = AgentEnv::new(&runner, tmp.path(), None);
        let mut rx = Supervisor::new(&runner, db()).launch(spec, env, lease);
        loop {
            match rx.recv().await {
                Some(RunEvent::Out { .. }) => break,
                Some(_) => continue,
                None => panic!("stream ended early"),
            }
        }
        let bg: i32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(process_alive(bg));

        gate.cancel(&id).unwrap();
        let rest = tokio::time::timeout(Duration::from_secs(5), collect(rx))
            .await
            .unwrap();
        assert!(matches!(
            rest.last(),
            Some(RunEvent::Done {
                status: TaskStatus::Killed,
                ..
            })
        ));
        assert!(wait_gone(bg).await, "background child {} survived cancel", bg);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timeout_fires_while_client_not_reading() {
        let tmp = TempDir::new().unwrap();
        let pid_file = tmp.path().join("agent.pid");
        let script = format!(
            "echo $$ > '{}'\ni=0\nwhile [ $i -lt 2000 ]; do echo line $i; i=$((i+1)); done\nexec sleep 30",
            pid_file.display()
        );
        let cli = fake_cli(tmp.path(), &script);
        let runner = runner(&cli, tmp.path());
        let gate = TaskGate::new();
        let spec = spec(tmp.path(), 300);

        let lease = gate.try_acquire(&spec).unwrap();
        let env = AgentEnv::new(&runner, tmp.path(), None);
        // Hold the receiver without reading so the channel fills up.
        let rx = Supervisor::new(&runner, db()).launch(spec, env, lease);

        let mut released = false;
        for _ in 0..100 {
            if gate.current().is_none() {
                released = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(released, "gate still held after timeout");

        let agent: i32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(wait_gone(agent).await, "agent {} survived timeout", agent);

        let events = tokio::time::timeout(Duration::from_secs(5), collect(rx))
            .await
            .unwrap();
        assert_eq!(
            events.last(),
            Some(&RunEvent::Done {
                code: None,
                status: TaskStatus::Killed
            })
        );
    }

    #[tokio::test]
    async fn test_spawn_failure_reports_and_releases() {
        let tmp = TempDir::new().unwrap();
        let runner = runner(&tmp.path().join("missing-cli"), tmp.path());
        let gate = TaskGate::new();
        let spec = spec(tmp.path(), 60_000);
        let lease = gate.try_acquire(&spec).unwrap();
        let env = AgentEnv::new(&runner, tmp.path(), None);

        let events = collect(Supervisor::new(&runner, db()).launch(spec, env, lease)).await;
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[1], RunEvent::Err { text } if text.contains("Failed to start")));
        assert_eq!(
            events[2],
            RunEvent::Done {
                code: Some(1),
                status: TaskStatus::Failed
            }
        );
        assert!(gate.current().is_none());
    }

    #[tokio::test]
    async fn test_resolve_reads_stored_token() {
        let tmp = TempDir::new().unwrap();
        let account = tmp.path().join("acct");
        crate::master::credentials::write_credentials(
            &account,
            &crate::master::credentials::OAuthCredentials {
                access_token: "sk-stored".into(),
                refresh_token: None,
                expires_at: 4_000_000_000_000,
                scopes: vec![],
                subscription_type: None,
                email: None,
            },
        )
        .unwrap();

        let runner = RunnerConfig::default();
        let env = AgentEnv::resolve(&runner, &account).await;
        assert!(env.has_token());
        assert!(
            env.vars()
                .contains(&("CLAUDE_CODE_OAUTH_TOKEN".to_string(), "sk-stored".to_string()))
        );
        assert!(!format!("{:?}", env).contains("sk-stored"));

        let empty = AgentEnv::resolve(&runner, &tmp.path().join("none")).await;
        assert!(!empty.has_token());
    }
}
