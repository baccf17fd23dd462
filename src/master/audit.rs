//! Audit trail for the privileged route group.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, FromRequestParts, OriginalUri, Request, State};
use axum::http::HeaderMap;
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::Response;
use serde_json::Value;

use super::api::SharedState;
use super::auth::AuthUser;

/// Handler-supplied details attached to the response for the audit row.
#[derive(Debug, Clone)]
pub struct AuditMeta(pub Value);

/// First hop of `X-Forwarded-For`, else the peer address.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Caller address as resolved by [`client_ip`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClientIp(pub String);

impl<S: Send + Sync> FromRequestParts<S> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Ok(ClientIp(client_ip(&parts.headers, peer)))
    }
}

/// Record every call, including ones rejected by authentication. The
/// write happens after the response is produced and never affects it.
pub async fn record(State(state): State<SharedState>, req: Request, next: Next) -> Response {
    // Inside a nested router the URI has the mount prefix stripped.
    let path = req
        .extensions()
        .get::<OriginalUri>()
        .map(|OriginalUri(uri)| uri.path().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let method = req.method().to_string();
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let ip = client_ip(req.headers(), peer);

    let response = next.run(req).await;

    let user_id = response.extensions().get::<AuthUser>().map(|u| u.id);
    let meta = response
        .extensions()
        .get::<AuditMeta>()
        .map(|m| m.0.clone())
        .unwrap_or_else(|| Value::Object(Default::default()));
    let status = response.status().as_u16();

    let db = state.db.clone();
    tokio::spawn(async move {
        let result = db
            .call(move |db| db.insert_audit(user_id, &path, &method, &ip, status, &meta))
            .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to write audit entry");
        }
    });

    response
}
