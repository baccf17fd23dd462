//! Master control plane: remote agent runner and credential exchange.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Admin   │ ───────> │  server.rs  (axum Router, start_server)          │
//! │  client  │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘   SSE    │         │  auth.rs / step_up.rs / audit.rs       │
//!                       │         │                                        │
//!                       │         │ TaskGate::try_acquire()                │
//!                       │         v                                        │
//!                       │  gate.rs  (single-slot TaskGate, TaskLease)      │
//!                       │         │                                        │
//!                       │         │ PlanLinker::load() → agent prompt      │
//!                       │         v                                        │
//!                       │  supervisor.rs  (AgentEnv, Supervisor::launch)   │
//!                       │         │                                        │
//!                       │         │ mpsc::Receiver<RunEvent>               │
//!                       │         v                                        │
//!                       │  relay.rs  (SSE response, disconnect → cancel)   │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module        | Responsibility                                          |
//! |---------------|---------------------------------------------------------|
//! | `models`      | Shared types: `TaskSpec`, `TaskStatus`, `ModelId`, `Role` |
//! | `db`          | SQLite access via `DbHandle` (thin `Arc<Mutex<_>>`)     |
//! | `tokens`      | HMAC-signed session and step-up tokens                  |
//! | `plans`       | Plan path validation, creation and bounded loading      |
//! | `credentials` | Per-account credential file parsing and atomic writes   |
//! | `oauth`       | PKCE authorization-code broker                          |
//! | `limiter`     | Sliding-window limit on failed password attempts        |
//!
//! ## Typical Request Flow (start a run)
//!
//! 1. `POST /master/claude-run` passes `audit::record` and
//!    `auth::require_session`, then the `StepUp` extractor.
//! 2. The handler validates the prompt, repo, model and account, then takes
//!    the gate. A second run while one is active gets `409` with the
//!    active task id.
//! 3. The linked plan is loaded and appended to the prompt; the account's
//!    credentials are resolved into an `AgentEnv`.
//! 4. `Supervisor::launch` spawns the agent CLI with a sanitized
//!    environment and streams `start`, `out`/`err`, `done` events.
//! 5. The lease is released before `done` is sent, so the next run can
//!    start as soon as the client sees the end of the stream.

pub mod api;
pub mod audit;
pub mod auth;
pub mod credentials;
pub mod db;
pub mod gate;
pub mod limiter;
pub mod models;
pub mod oauth;
pub mod plans;
pub mod relay;
pub mod server;
pub mod step_up;
pub mod supervisor;
pub mod tokens;
