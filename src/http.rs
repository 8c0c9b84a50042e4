//! The `/raft/*` and `/cluster/*` control-plane router (spec §4.5, §6), plus
//! the leader write-redirect fabric (spec §4.6) that lets a client address
//! any node for writes.
//!
//! Generalizes the teacher's `hyper`-based RPC server
//! (`pkg/haystack/src/http.rs`'s `HTTPServer`/`Service` pair) to `axum`,
//! with an HMAC-verification layer standing in for the teacher's trusted
//! intra-datacenter assumption. This crate has no public application routes
//! of its own (out of scope, see SPEC_FULL.md §1), but `leader_redirect`
//! wraps the whole router so that any future write-bearing route mounted
//! here picks up the redirect/proxy behavior automatically, exactly as
//! spec.md §4.6 and its scenario 1 ("B proxies to A") describe.

use crate::consensus::Engine;
use crate::domain::DomainStore;
use crate::errors::Error;
use crate::peers::PeerStore;
use crate::rpc::{
    sign, verify, AppendEntriesRequest, AppendEntriesResponse, GossipNode, HealthResponse, JoinRequest, JoinResponse, LeaveRequest,
    LocalEvent, RequestVoteRequest, RequestVoteResponse, SIGNATURE_HEADER,
};
use crate::types::NodeSource;
use axum::body::{to_bytes, Body};
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Bounds how many rows a single `local-events`/`local-audit` poll returns;
/// a reconciler simply picks the cursor back up next cycle for the rest.
const LOCAL_EVENTS_PAGE_LIMIT: i64 = 500;

const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub peers: Arc<PeerStore>,
    pub domain: Arc<dyn DomainStore>,
    pub secret: String,
    pub http_client: reqwest::Client,
}

pub fn router(state: AppState) -> Router {
    let signed = Router::new()
        .route("/raft/request-vote", post(request_vote))
        .route("/raft/append-entries", post(append_entries))
        .route("/cluster/join", post(join))
        .route("/cluster/leave", post(leave))
        .route("/cluster/nodes", get(nodes))
        .route("/cluster/local-events/:family", get(local_events))
        .route("/cluster/local-audit/users", get(local_audit_users))
        .layer(middleware::from_fn_with_state(state.clone(), verify_signature));

    Router::new()
        .route("/raft/health", get(health))
        .merge(signed)
        .layer(middleware::from_fn_with_state(state.clone(), leader_redirect))
        .with_state(state)
}

fn is_internal_path(path: &str) -> bool {
    path.starts_with("/raft/") || path.starts_with("/cluster/")
}

fn is_write_method(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::DELETE | Method::PATCH)
}

fn is_browser_user_agent(req: &Request) -> bool {
    req.headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|ua| ua.contains("Mozilla"))
        .unwrap_or(false)
}

fn inject_cors_headers(headers: &mut axum::http::HeaderMap) {
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, PUT, PATCH, DELETE, OPTIONS"),
    );
    headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("*"));
}

fn cors_preflight_response() -> Response {
    let mut resp = StatusCode::NO_CONTENT.into_response();
    inject_cors_headers(resp.headers_mut());
    resp
}

fn redirect_307(target: &str) -> Response {
    let mut resp = StatusCode::TEMPORARY_REDIRECT.into_response();
    if let Ok(value) = HeaderValue::from_str(target) {
        resp.headers_mut().insert(header::LOCATION, value);
    }
    resp
}

/// Forwards a write request to the current leader when this node isn't it
/// (spec §4.6). Internal control paths (`/raft/*`, `/cluster/*`) always
/// serve locally; reads always pass through; a write on a follower is
/// proxied (browser clients) or 307-redirected (everything else) to the
/// leader address looked up via `PeerStore::current_leader`/
/// `Engine::leader_hint`. If no leader is known the request is served
/// locally, so a Propose call downstream fails with the engine's own
/// "not leader" error instead of this middleware guessing.
async fn leader_redirect(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let path = req.uri().path().to_string();
    if is_internal_path(&path) {
        return next.run(req).await;
    }
    if req.method() == Method::OPTIONS {
        return cors_preflight_response();
    }
    if !is_write_method(req.method()) || state.engine.is_leader() {
        return next.run(req).await;
    }

    let Some(leader_id) = state.peers.current_leader().or_else(|| state.engine.leader_hint()) else {
        return next.run(req).await;
    };
    let Some(leader_addr) = state.peers.address_of(&leader_id) else {
        return next.run(req).await;
    };

    let path_and_query = req.uri().path_and_query().map(|pq| pq.as_str().to_string()).unwrap_or(path);
    let target = format!("http://{}{}", leader_addr, path_and_query);

    if is_browser_user_agent(&req) {
        proxy_to_leader(state.http_client.clone(), req, &target).await
    } else {
        redirect_307(&target)
    }
}

/// Transparent reverse-proxy for browser clients: forwards method, body and
/// every header but `Host`, then mirrors the leader's response back with
/// CORS headers injected.
async fn proxy_to_leader(client: reqwest::Client, req: Request, target: &str) -> Response {
    let method = req.method().clone();
    let mut headers = req.headers().clone();
    headers.remove(header::HOST);
    let body = match to_bytes(req.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };

    let upstream = match client.request(method, target).headers(headers).body(body).send().await {
        Ok(resp) => resp,
        Err(_) => return StatusCode::BAD_GATEWAY.into_response(),
    };

    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    let body = upstream.bytes().await.unwrap_or_default();
    inject_cors_headers(&mut headers);

    (status, headers, Body::from(body)).into_response()
}

/// Verifies `X-Cluster-Signature` over the exact request body (spec §4.5).
/// `/raft/health` is mounted outside this layer and never reaches it.
async fn verify_signature(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(signature) = req.headers().get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()).map(str::to_string) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let (parts, body) = req.into_parts();
    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };

    if !verify(&state.secret, &bytes, &signature) {
        warn!("rejected cluster rpc with missing or invalid signature");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let req = Request::from_parts(parts, Body::from(bytes));
    next.run(req).await
}

async fn request_vote(State(state): State<AppState>, Json(req): Json<RequestVoteRequest>) -> Json<RequestVoteResponse> {
    Json(state.engine.request_vote(req))
}

async fn append_entries(State(state): State<AppState>, Json(req): Json<AppendEntriesRequest>) -> Json<AppendEntriesResponse> {
    Json(state.engine.append_entries(req))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        node_id: state.engine.id().to_string(),
        is_leader: state.engine.is_leader(),
        leader: state.engine.leader_hint(),
    })
}

async fn join(State(state): State<AppState>, Json(req): Json<JoinRequest>) -> Result<Json<JoinResponse>, StatusCode> {
    state
        .peers
        .upsert(&req.node_id, &req.address, NodeSource::Seed, true)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let nodes = state
        .peers
        .listing()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .into_iter()
        .filter(|n| n.node_id != req.node_id)
        .map(|n| GossipNode { node_id: n.node_id, address: n.address })
        .collect();
    Ok(Json(JoinResponse { nodes }))
}

async fn leave(State(state): State<AppState>, Json(req): Json<LeaveRequest>) -> StatusCode {
    match state.peers.forget(&req.node_id) {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn nodes(State(state): State<AppState>) -> Result<Json<Vec<crate::types::ClusterNode>>, StatusCode> {
    state.peers.listing().map(Json).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

#[derive(Deserialize)]
struct SinceQuery {
    since: Option<DateTime<Utc>>,
}

/// Maps the wire path segment (hyphenated, matching the other entities'
/// plural-with-dashes convention) to the internal family/table name used by
/// `DomainStore::local_events_since`.
fn resolve_family(path_segment: &str) -> Option<&'static str> {
    Some(match path_segment {
        "appointments" => "appointments",
        "groups" => "groups",
        "group-members" => "group_members",
        "invitations" => "participants",
        "notifications" => "notifications",
        _ => return None,
    })
}

async fn local_events(
    State(state): State<AppState>,
    Path(family_segment): Path<String>,
    Query(q): Query<HashMap<String, String>>,
) -> Result<Json<Vec<LocalEvent>>, StatusCode> {
    let Some(family) = resolve_family(&family_segment) else { return Err(StatusCode::NOT_FOUND) };
    let since = parse_since(&q)?;
    scan_family(&state, family, since)
}

async fn local_audit_users(State(state): State<AppState>, Query(q): Query<HashMap<String, String>>) -> Result<Json<Vec<LocalEvent>>, StatusCode> {
    let since = parse_since(&q)?;
    scan_family(&state, "users", since)
}

fn parse_since(q: &HashMap<String, String>) -> Result<DateTime<Utc>, StatusCode> {
    match q.get("since") {
        None => Ok(DateTime::<Utc>::from_timestamp(0, 0).unwrap()),
        Some(raw) => raw.parse().map_err(|_| StatusCode::BAD_REQUEST),
    }
}

fn scan_family(state: &AppState, family: &str, since: DateTime<Utc>) -> Result<Json<Vec<LocalEvent>>, StatusCode> {
    let rows = state
        .domain
        .local_events_since(family, since, LOCAL_EVENTS_PAGE_LIMIT)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(rows.into_iter().map(|r| LocalEvent { timestamp: r.created_at, payload: r.payload }).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_mapping_covers_hyphenated_segments() {
        assert_eq!(resolve_family("group-members"), Some("group_members"));
        assert_eq!(resolve_family("invitations"), Some("participants"));
        assert_eq!(resolve_family("nonsense"), None);
    }

    #[test]
    fn sign_used_by_client_matches_verify_used_by_server() {
        let sig = sign("s3cr3t", b"{}");
        assert!(verify("s3cr3t", b"{}", &sig));
    }
}
