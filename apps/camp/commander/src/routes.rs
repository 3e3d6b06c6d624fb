use std::net::SocketAddr;

use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, Path, Query, Request, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use camp_core::AgentIdentity;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::error::ApiError;
use crate::session::run_agent_session;
use crate::state::AppState;

const TOKEN_HEADER: &str = "token";
const UNKNOWN_CLIENT_IP: &str = "0.0.0.0";

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/connect", get(connect))
        .route("/instance/alive", get(list_alive))
        .route("/instruct", get(list_instructions).post(issue))
        .route("/instruct/:uuid", get(get_instruction))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .merge(protected)
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

async fn require_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let from_header = request
        .headers()
        .get(TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let presented = from_header.or_else(|| {
        Query::<TokenQuery>::try_from_uri(request.uri())
            .ok()
            .and_then(|Query(query)| query.token)
    });
    if !state.authorized(presented.as_deref()) {
        warn!(path = %request.uri().path(), "rejecting request with missing or invalid token");
        return Err(ApiError::Unauthorized);
    }
    Ok(next.run(request).await)
}

/// Identity fields as they arrive in query strings and request bodies.
#[derive(Debug, Default, Deserialize)]
struct TargetParams {
    #[serde(rename = "orgUuid", alias = "orgId", default)]
    org_id: Option<String>,
    #[serde(rename = "groupUuid", alias = "groupId", default)]
    group_id: Option<String>,
    #[serde(rename = "instanceName", default)]
    instance_name: Option<String>,
}

impl TargetParams {
    fn identity(self) -> Result<AgentIdentity, ApiError> {
        Ok(AgentIdentity::new(
            self.org_id.unwrap_or_default(),
            self.group_id.unwrap_or_default(),
            self.instance_name.unwrap_or_default(),
        )?)
    }
}

/// Picks the address a soldier connected from: `X-Real-IP`, then the socket
/// peer, then the first `X-Forwarded-For` hop.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };
    header_value("x-real-ip")
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .or_else(|| {
            header_value("x-forwarded-for")
                .and_then(|chain| chain.split(',').next().map(|hop| hop.trim().to_string()))
        })
        .unwrap_or_else(|| UNKNOWN_CLIENT_IP.to_string())
}

async fn connect(
    State(state): State<AppState>,
    Query(params): Query<TargetParams>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let identity = params.identity()?;
    let ip = client_ip(&headers, peer.map(|ConnectInfo(addr)| addr));
    let commander = state.commander();
    let sessions = state.sessions();
    let config = state.session_config();
    Ok(ws
        .on_upgrade(move |socket| {
            let tracker = sessions.clone();
            tracker.track(run_agent_session(
                socket, identity, ip, commander, sessions, config,
            ))
        })
        .into_response())
}

#[derive(Debug, Deserialize)]
struct AliveQuery {
    #[serde(rename = "orgUuid", alias = "orgId", default)]
    org_id: Option<String>,
    #[serde(rename = "groupUuid", alias = "groupId", default)]
    group_id: Option<String>,
}

async fn list_alive(
    State(state): State<AppState>,
    Query(query): Query<AliveQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let org = query.org_id.filter(|org| !org.is_empty());
    let group = query.group_id.filter(|group| !group.is_empty());
    let instances = state
        .commander()
        .list_alive(org.as_deref(), group.as_deref())
        .await?;
    Ok(Json(json!({
        "errCode": 0,
        "errMsg": "ok",
        "instances": instances,
    })))
}

#[derive(Debug, Deserialize)]
struct IssueBody {
    #[serde(flatten)]
    target: TargetParams,
    #[serde(rename = "type", default)]
    kind: i32,
    #[serde(default)]
    content: String,
}

async fn issue(
    State(state): State<AppState>,
    body: Result<Json<IssueBody>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(body) = body.map_err(|err| ApiError::BadRequest(err.body_text()))?;
    let target = body.target.identity()?;
    let uuid = state
        .commander()
        .issue(&target, body.kind, body.content)
        .await?;
    Ok(Json(json!({
        "errCode": 0,
        "errMsg": "ok",
        "uuid": uuid,
    })))
}

async fn list_instructions(
    State(state): State<AppState>,
    Query(params): Query<TargetParams>,
) -> Result<impl IntoResponse, ApiError> {
    let target = params.identity()?;
    let records = state.commander().list_instructions(&target).await?;
    Ok(Json(json!({
        "errCode": 0,
        "errMsg": "ok",
        "data": records,
    })))
}

async fn get_instruction(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    Query(params): Query<TargetParams>,
) -> Result<impl IntoResponse, ApiError> {
    let target = params.identity()?;
    let record = state
        .commander()
        .get_instruction(&target, &uuid)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("instruction {uuid} not found")))?;
    Ok(Json(json!({
        "errCode": 0,
        "errMsg": "ok",
        "data": record,
    })))
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.render_metrics(),
    )
}
