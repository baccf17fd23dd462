//! Streaming relay: typed run events delivered as Server-Sent Events.
//!
//! The supervisor produces [`RunEvent`]s into a bounded channel; the HTTP
//! response consumes them. The consumer side owns a `DropGuard` on the
//! task's cancellation token, so when the client goes away and axum drops
//! the body stream, the task is cancelled through the same path as an
//! explicit `DELETE` or a timeout.

use std::convert::Infallible;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::LazyLock;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::http::HeaderValue;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::{Stream, StreamExt};
use regex::Regex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::DropGuard;

use super::models::{ModelId, TaskStatus};

pub const TASK_ID_HEADER: &str = "x-task-id";

// CSI, OSC (BEL or ST terminated), then any remaining two-byte escape.
static ANSI_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-_]").unwrap()
});

/// Remove terminal escape sequences and non-printing characters, keeping
/// newlines and tabs.
pub fn strip_control(text: &str) -> String {
    ANSI_REGEX
        .replace_all(text, "")
        .chars()
        .filter(|c| *c == '\n' || *c == '\t' || !c.is_control())
        .collect()
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    #[serde(rename_all = "camelCase")]
    Start {
        task_id: String,
        repo: String,
        cwd: PathBuf,
        model: ModelId,
        plan_path: String,
        timeout_ms: u64,
    },
    Out {
        text: String,
    },
    Err {
        text: String,
    },
    /// Always the last event. `code` is `None` when the process died by signal.
    Done {
        code: Option<i32>,
        status: TaskStatus,
    },
}

impl RunEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Out { .. } => "out",
            Self::Err { .. } => "err",
            Self::Done { .. } => "done",
        }
    }

    pub fn to_sse(&self) -> Event {
        let data = serde_json::to_string(self).unwrap_or_else(|e| {
            serde_json::json!({"type": "err", "text": e.to_string()}).to_string()
        });
        Event::default().event(self.name()).data(data)
    }
}

/// Body stream that cancels its task when dropped.
struct GuardedStream<S> {
    inner: S,
    _guard: DropGuard,
}

impl<S: Stream + Unpin> Stream for GuardedStream<S> {
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Turn the receiving half of a run into an SSE response carrying the
/// task id header.
pub fn sse_response(
    rx: mpsc::Receiver<RunEvent>,
    guard: DropGuard,
    task_id: &str,
    keep_alive: Duration,
) -> Response {
    let stream = GuardedStream {
        inner: ReceiverStream::new(rx).map(|event| Ok::<_, Infallible>(event.to_sse())),
        _guard: guard,
    };
    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(keep_alive))
        .into_response();
    if let Ok(value) = HeaderValue::from_str(task_id) {
        response.headers_mut().insert(TASK_ID_HEADER, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_strip_control_sequences() {
        assert_eq!(strip_control("\x1b[1;32mok\x1b[0m\n"), "ok\n");
        assert_eq!(strip_control("\x1b]0;title\x07body"), "body");
        assert_eq!(strip_control("a\tb\r\x07\x08c"), "a\tbc");
        assert_eq!(strip_control("plain æøå"), "plain æøå");
    }

    #[test]
    fn test_event_json_shape() {
        let start = RunEvent::Start {
            task_id: "t1".into(),
            repo: "site-a".into(),
            cwd: "/srv/site-a".into(),
            model: ModelId::Opus,
            plan_path: "tasks/kanban/a.md".into(),
            timeout_ms: 60_000,
        };
        let json = serde_json::to_value(&start).unwrap();
        assert_eq!(json["type"], "start");
        assert_eq!(json["taskId"], "t1");
        assert_eq!(json["model"], "opus");
        assert_eq!(json["planPath"], "tasks/kanban/a.md");

        let done = RunEvent::Done {
            code: None,
            status: TaskStatus::Killed,
        };
        let json = serde_json::to_value(&done).unwrap();
        assert_eq!(json["type"], "done");
        assert!(json["code"].is_null());
        assert_eq!(json["status"], "killed");
    }

    #[tokio::test]
    async fn test_sse_response_streams_events_in_order() {
        let (tx, rx) = mpsc::channel(8);
        let token = CancellationToken::new();
        let response = sse_response(rx, token.clone().drop_guard(), "t1", Duration::from_secs(5));
        assert_eq!(response.headers()[TASK_ID_HEADER], "t1");

        tx.send(RunEvent::Out { text: "hello\n".into() }).await.unwrap();
        tx.send(RunEvent::Done {
            code: Some(0),
            status: TaskStatus::Completed,
        })
        .await
        .unwrap();
        drop(tx);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        let out = text.find(r#""type":"out""#).unwrap();
        let done = text.find(r#""type":"done""#).unwrap();
        assert!(out < done);
        assert!(text.contains(r#""status":"completed""#));
        // Body fully consumed and dropped: the guard fires.
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_idle_stream_sends_keep_alive_comments() {
        let (tx, rx) = mpsc::channel(8);
        let token = CancellationToken::new();
        let response = sse_response(rx, token.clone().drop_guard(), "t1", Duration::from_millis(50));
        let mut body = response.into_body();

        let frame = tokio::time::timeout(Duration::from_secs(2), body.frame())
            .await
            .expect("no keep-alive within 2s")
            .unwrap()
            .unwrap();
        let data = frame.into_data().unwrap();
        assert!(data.starts_with(b":"), "{:?}", data);
        assert!(!token.is_cancelled());
        drop(tx);
    }

    #[tokio::test]
    async fn test_dropping_response_cancels_task() {
        let (_tx, rx) = mpsc::channel(8);
        let token = CancellationToken::new();
        let response = sse_response(rx, token.clone().drop_guard(), "t1", Duration::from_secs(5));
        assert!(!token.is_cancelled());
        drop(response);
        assert!(token.is_cancelled());
    }
}
