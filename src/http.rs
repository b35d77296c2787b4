// SPDX-FileCopyrightText: Copyright (c) 2024-2025 gpupool contributors
// SPDX-License-Identifier: Apache-2.0

//! HTTP surface: pipe endpoints, device administration, federation
//! handshake, login, and the websocket used by both admin consoles and
//! peer servers.
//!
//! Pipe endpoints are open (payment-gated), admin endpoints require a user
//! token, and `/pipeCallFromRemoteServer` requires a peer server token.
//! Localhost callers bypass user auth, and a server with no registered
//! users refuses everything except `/registerUser`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::{self, Claims, Keypair, UserRecord, USER_TOKEN_TTL};
use crate::dispatch::{DispatchError, DispatchOutcome, DispatchRequest, Dispatcher};
use crate::federation::Federation;
use crate::state::StateHub;
use crate::storage::KvStore;
use crate::worker::WorkerPool;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<StateHub>,
    pub pool: Arc<WorkerPool>,
    pub dispatcher: Arc<Dispatcher>,
    pub federation: Arc<Federation>,
    pub keypair: Arc<Keypair>,
    pub users: Arc<KvStore<UserRecord>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/pipe/checkme", get(checkme))
        .route("/pipe/:pipe_id", get(call_pipe_get).post(call_pipe_post))
        .route("/pipeCallFromRemoteServer/:pipe_id", post(call_pipe_remote))
        .route("/state", get(get_state))
        .route("/devices", get(get_devices))
        .route("/load/:device_id/:pipe_id", get(load_pipe))
        .route("/delete_pipe/:device_id/:pipe_id", get(delete_pipe))
        .route("/freeze/:device_id", get(freeze_device))
        .route("/unfreeze/:device_id", get(unfreeze_device))
        .route("/disable/:device_id", get(disable_device))
        .route("/enable/:device_id", get(enable_device))
        .route("/public", get(public_identity))
        .route("/login", post(login))
        .route("/registerUser", post(register_user))
        .route("/requestConnection", post(request_connection))
        .route("/requestConnectionHandler", post(request_connection_handler))
        .route("/grantConnection", post(grant_connection))
        .route("/rejectConnection", post(reject_connection))
        .route("/removeConnection", post(remove_connection))
        .route("/serverConnections", get(server_connections))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

/// Error shape shared by every handler; auth failures use the
/// `{auth: false, message}` body, the rest `{error}`.
pub struct ApiError {
    status: StatusCode,
    body: Value,
}

impl ApiError {
    fn auth(status: StatusCode, message: &str) -> Self {
        Self {
            status,
            body: json!({"auth": false, "message": message}),
        }
    }

    fn message(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({"error": message.into()}),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self::message(status, err.to_string())
    }
}

impl From<crate::Error> for ApiError {
    fn from(err: crate::Error) -> Self {
        Self::message(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    let raw = headers
        .get(header::AUTHORIZATION)
        .or_else(|| headers.get("token"))?
        .to_str()
        .ok()?;
    Some(raw.strip_prefix("Bearer ").unwrap_or(raw).to_string())
}

fn is_localhost(headers: &HeaderMap, addr: &SocketAddr) -> bool {
    match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(forwarded) => matches!(
            forwarded.split(',').next().map(str::trim),
            Some("127.0.0.1") | Some("::1") | Some("::ffff:127.0.0.1")
        ),
        None => addr.ip().is_loopback(),
    }
}

/// User auth for admin endpoints. `Ok(None)` means the caller was waved
/// through without a token (localhost, or the registerUser bootstrap).
fn authorize_user(
    state: &AppState,
    headers: &HeaderMap,
    addr: &SocketAddr,
    endpoint: &str,
) -> Result<Option<Claims>, ApiError> {
    if state.users.is_empty() {
        if endpoint.ends_with("registerUser") {
            return Ok(None);
        }
        return Err(ApiError::message(StatusCode::CONFLICT, "No registered users"));
    }

    if is_localhost(headers, addr) {
        return Ok(None);
    }

    let token = bearer(headers)
        .ok_or_else(|| ApiError::auth(StatusCode::UNAUTHORIZED, "No token provided."))?;
    let claims = auth::verify(&token, &state.keypair.public_base64())
        .map_err(|_| ApiError::auth(StatusCode::UNAUTHORIZED, "Invalid token provided."))?;
    if !claims.allows(endpoint) {
        return Err(ApiError::auth(
            StatusCode::FORBIDDEN,
            &format!("Access denied to {endpoint}"),
        ));
    }
    Ok(Some(claims))
}

/// Server-to-server auth for the remote dispatch endpoint.
fn authorize_server(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let server_url = headers
        .get("serverurl")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::auth(StatusCode::UNAUTHORIZED, "No serverURL provided"))?;

    // A server may call its own ingress while scheduling.
    if crate::federation::canonical_url(server_url) == state.hub.local_url() {
        return Ok(());
    }

    let token = bearer(headers)
        .ok_or_else(|| ApiError::auth(StatusCode::UNAUTHORIZED, "No token provided."))?;
    state
        .federation
        .verify_server_token(server_url, &token)
        .map_err(|err| match err {
            auth::AuthError::UnknownPeer => {
                ApiError::auth(StatusCode::UNAUTHORIZED, "Server not authorized to connect")
            }
            auth::AuthError::Forbidden => {
                ApiError::auth(StatusCode::FORBIDDEN, "Access denied")
            }
            _ => ApiError::auth(StatusCode::UNAUTHORIZED, "Invalid token provided."),
        })?;
    Ok(())
}

fn outcome_response(outcome: DispatchOutcome) -> Response {
    match outcome {
        DispatchOutcome::Json(value) => Json(value).into_response(),
        DispatchOutcome::Binary { data, filename } => (
            [
                (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("inline; filename=\"{filename}\""),
                ),
            ],
            data,
        )
            .into_response(),
        DispatchOutcome::Stream(rx) => {
            let stream = futures::stream::unfold(rx, |mut rx| async move {
                rx.recv()
                    .await
                    .map(|line| (Ok::<_, std::convert::Infallible>(bytes::Bytes::from(line)), rx))
            });
            (
                [
                    (header::CONTENT_TYPE, "text/event-stream"),
                    (header::CACHE_CONTROL, "no-cache"),
                ],
                Body::from_stream(stream),
            )
                .into_response()
        }
    }
}

async fn checkme() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

/// Pull the routing fields out of the payload; everything else goes to the
/// worker untouched.
fn split_payload(mut payload: Value) -> (Option<String>, Option<String>, Value) {
    let (device_id, token) = match payload.as_object_mut() {
        Some(map) => (
            map.remove("deviceId")
                .and_then(|v| v.as_str().map(str::to_string)),
            map.remove("transactionJWT")
                .and_then(|v| v.as_str().map(str::to_string)),
        ),
        None => (None, None),
    };
    (device_id, token, payload)
}

async fn run_pipe_call(
    state: AppState,
    pipe_id: String,
    headers: HeaderMap,
    payload: Value,
    local_only: bool,
    payment_required: bool,
) -> Result<Response, ApiError> {
    let (device_id, mut payment_token, payload) = split_payload(payload);
    if payment_token.is_none() {
        payment_token = headers
            .get("transaction-jwt")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
    }
    let stream = payload.get("stream").and_then(Value::as_bool).unwrap_or(false);

    let request = DispatchRequest {
        device_id,
        payment_token,
        payment_required,
        stream,
        local_only,
        ..DispatchRequest::new(&pipe_id, payload)
    };
    let outcome = state.dispatcher.dispatch(request).await?;
    Ok(outcome_response(outcome))
}

async fn call_pipe_get(
    State(state): State<AppState>,
    Path(pipe_id): Path<String>,
    Query(query): Query<BTreeMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let payload = Value::Object(
        query
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect(),
    );
    run_pipe_call(state, pipe_id, headers, payload, false, true).await
}

async fn call_pipe_post(
    State(state): State<AppState>,
    Path(pipe_id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<Response, ApiError> {
    run_pipe_call(state, pipe_id, headers, payload, false, true).await
}

async fn call_pipe_remote(
    State(state): State<AppState>,
    Path(pipe_id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<Response, ApiError> {
    authorize_server(&state, &headers)?;
    // Already paid for on the ingress server, and never forwarded again.
    run_pipe_call(state, pipe_id, headers, payload, true, false).await
}

async fn get_state(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    authorize_user(&state, &headers, &addr, "/state")?;
    Ok(Json(state.hub.store().snapshot()))
}

async fn get_devices(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    authorize_user(&state, &headers, &addr, "/devices")?;
    let devices = state
        .hub
        .store()
        .typed()
        .remove(state.hub.local_url())
        .map(|server| server.devices)
        .unwrap_or_default();
    Ok(Json(serde_json::to_value(devices).map_err(crate::Error::from)?))
}

async fn load_pipe(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path((device_id, pipe_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    authorize_user(&state, &headers, &addr, "/load")?;
    Ok(Json(state.dispatcher.load_pipe(&device_id, &pipe_id).await?))
}

async fn delete_pipe(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path((device_id, pipe_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    authorize_user(&state, &headers, &addr, "/delete_pipe")?;
    Ok(Json(
        state.dispatcher.delete_pipe(&device_id, &pipe_id).await?,
    ))
}

fn device_flag(
    state: &AppState,
    device_id: &str,
    apply: impl Fn(&WorkerPool, &str) -> bool,
) -> Result<Json<Value>, ApiError> {
    if !apply(&state.pool, device_id) {
        return Err(ApiError::message(
            StatusCode::NOT_FOUND,
            format!("Device {device_id} not found"),
        ));
    }
    Ok(Json(json!({"deviceId": device_id, "status": "ok"})))
}

async fn freeze_device(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    authorize_user(&state, &headers, &addr, "/freeze")?;
    device_flag(&state, &device_id, |pool, id| pool.set_frozen(id, true))
}

async fn unfreeze_device(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    authorize_user(&state, &headers, &addr, "/unfreeze")?;
    device_flag(&state, &device_id, |pool, id| pool.set_frozen(id, false))
}

async fn disable_device(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    authorize_user(&state, &headers, &addr, "/disable")?;
    device_flag(&state, &device_id, |pool, id| pool.set_disabled(id, true))
}

async fn enable_device(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    authorize_user(&state, &headers, &addr, "/enable")?;
    device_flag(&state, &device_id, |pool, id| pool.set_disabled(id, false))
}

async fn public_identity(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "publicKey": state.keypair.public_base64(),
        "accountId": state.keypair.account_id(),
    }))
}

#[derive(Deserialize)]
struct LoginBody {
    username: String,
    password: String,
}

/// Always 200; the body says whether it worked. Admin consoles key off the
/// presence of `token`.
async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginBody>,
) -> Result<Json<Value>, ApiError> {
    let Some(record) = state.users.get(&body.username) else {
        return Ok(Json(json!({"error": "invalid username or password"})));
    };
    if !record.check_password(&body.password) {
        return Ok(Json(json!({"error": "invalid username or password"})));
    }
    let token = state
        .keypair
        .sign_claims(record.claims(&body.username), USER_TOKEN_TTL)?;
    Ok(Json(json!({ "token": token })))
}

#[derive(Deserialize)]
struct RegisterBody {
    username: String,
    password: String,
    #[serde(rename = "fullPermissions", default)]
    full_permissions: bool,
    #[serde(default)]
    endpoints: Option<Vec<String>>,
}

async fn register_user(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<RegisterBody>,
) -> Result<Json<Value>, ApiError> {
    authorize_user(&state, &headers, &addr, "/registerUser")?;
    if !is_localhost(&headers, &addr) {
        return Err(ApiError::auth(
            StatusCode::FORBIDDEN,
            "registerUser is localhost-only",
        ));
    }
    let record = UserRecord {
        full_permissions: body.full_permissions,
        endpoints: body.endpoints,
        ..UserRecord::new(&body.password)
    };
    state.users.put(&body.username, record)?;
    Ok(Json(json!({"registered": true})))
}

#[derive(Deserialize)]
struct PeerUrlBody {
    #[serde(alias = "serverURL")]
    url: String,
}

async fn request_connection(
    State(state): State<AppState>,
    Json(body): Json<PeerUrlBody>,
) -> Result<Json<Value>, ApiError> {
    state.federation.request_connection(&body.url).await?;
    Ok(Json(json!({"requested": true})))
}

async fn request_connection_handler(
    State(state): State<AppState>,
    Json(body): Json<PeerUrlBody>,
) -> Result<Json<Value>, ApiError> {
    state.federation.handle_connection_request(&body.url).await?;
    Ok(Json(json!({"status": "REQUESTED"})))
}

async fn grant_connection(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<PeerUrlBody>,
) -> Result<Json<Value>, ApiError> {
    authorize_user(&state, &headers, &addr, "/grantConnection")?;
    state.federation.grant_connection(&body.url)?;
    Ok(Json(json!({"status": "GRANTED"})))
}

async fn reject_connection(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<PeerUrlBody>,
) -> Result<Json<Value>, ApiError> {
    authorize_user(&state, &headers, &addr, "/rejectConnection")?;
    state.federation.reject_connection(&body.url)?;
    Ok(Json(json!({"rejected": true})))
}

async fn remove_connection(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<PeerUrlBody>,
) -> Result<Json<Value>, ApiError> {
    authorize_user(&state, &headers, &addr, "/removeConnection")?;
    state.federation.remove_connection(&body.url)?;
    Ok(Json(json!({"removed": true})))
}

async fn server_connections(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    authorize_user(&state, &headers, &addr, "/serverConnections")?;
    let map: BTreeMap<String, Value> = state
        .federation
        .connections()
        .into_iter()
        .map(|(url, conn)| (url, serde_json::to_value(conn).unwrap_or(Value::Null)))
        .collect();
    Ok(Json(serde_json::to_value(map).map_err(crate::Error::from)?))
}

#[derive(Deserialize)]
struct WsQuery {
    token: Option<String>,
    #[serde(rename = "serverURL")]
    server_url: Option<String>,
}

enum WsRole {
    Admin,
    Peer(String),
}

async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let Some(token) = query.token else {
        return ApiError::auth(StatusCode::UNAUTHORIZED, "No token provided.").into_response();
    };

    // A known peer URL makes this a server session verified against the
    // peer's key; otherwise it is an admin console on our own key.
    let known_peer = query.server_url.as_deref().and_then(|url| {
        state
            .federation
            .peer(url)
            .map(|peer| (crate::federation::canonical_url(url), peer))
    });
    let role = match known_peer {
        Some((url, peer)) => match auth::verify(&token, &peer.public_key) {
            Ok(_) => WsRole::Peer(url),
            Err(_) => {
                return ApiError::auth(StatusCode::UNAUTHORIZED, "Invalid token provided.")
                    .into_response()
            }
        },
        None => match auth::verify(&token, &state.keypair.public_base64()) {
            Ok(claims) if claims.full_permissions => WsRole::Admin,
            Ok(_) => {
                return ApiError::auth(StatusCode::FORBIDDEN, "Access denied").into_response()
            }
            Err(_) => {
                return ApiError::auth(StatusCode::UNAUTHORIZED, "Invalid token provided.")
                    .into_response()
            }
        },
    };

    upgrade.on_upgrade(move |socket| serve_session(socket, state, role))
}

/// Pump state to one subscriber socket: INIT_STATE first, every delta as it
/// happens, and a heartbeat whenever the link has been quiet for 5 s.
async fn serve_session(mut socket: WebSocket, state: AppState, role: WsRole) {
    let mut subscription = match &role {
        WsRole::Admin => state.hub.subscribe_admin(),
        WsRole::Peer(_) => state.hub.subscribe_peer(),
    };

    let init = crate::protocols::SessionMessage::InitState {
        state: state.hub.store().snapshot(),
    };
    let init = match serde_json::to_string(&init) {
        Ok(text) => text,
        Err(err) => {
            tracing::error!(%err, "INIT_STATE serialization failed");
            state.hub.unsubscribe(subscription.id);
            return;
        }
    };
    if socket.send(WsMessage::Text(init)).await.is_err() {
        state.hub.unsubscribe(subscription.id);
        return;
    }

    let mut last_sent = tokio::time::Instant::now();
    loop {
        tokio::select! {
            outbound = subscription.rx.recv() => {
                let Some(message) = outbound else { break };
                let Ok(text) = serde_json::to_string(&message) else { continue };
                if socket.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
                last_sent = tokio::time::Instant::now();
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
            _ = tokio::time::sleep_until(last_sent + HEARTBEAT_INTERVAL) => {
                let heartbeat = crate::protocols::SessionMessage::Heartbeat {
                    ts: chrono::Utc::now().timestamp_millis(),
                };
                let Ok(text) = serde_json::to_string(&heartbeat) else { continue };
                if socket.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
                last_sent = tokio::time::Instant::now();
            }
        }
    }

    state.hub.unsubscribe(subscription.id);
    if let WsRole::Peer(url) = role {
        tracing::info!(peer = %url, "peer session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_payload_strips_routing_fields() {
        let payload = json!({
            "deviceId": "0",
            "transactionJWT": "jwt",
            "prompt": "a cat",
        });
        let (device_id, token, rest) = split_payload(payload);
        assert_eq!(device_id.as_deref(), Some("0"));
        assert_eq!(token.as_deref(), Some("jwt"));
        assert_eq!(rest, json!({"prompt": "a cat"}));
    }

    #[test]
    fn test_bearer_strips_prefix_and_falls_back_to_token_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert_eq!(bearer(&headers).as_deref(), Some("abc"));

        let mut headers = HeaderMap::new();
        headers.insert("token", "xyz".parse().unwrap());
        assert_eq!(bearer(&headers).as_deref(), Some("xyz"));

        assert_eq!(bearer(&HeaderMap::new()), None);
    }

    #[test]
    fn test_localhost_detection_prefers_forwarded_header() {
        let local: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let remote: SocketAddr = "10.0.0.1:9".parse().unwrap();

        assert!(is_localhost(&HeaderMap::new(), &local));
        assert!(!is_localhost(&HeaderMap::new(), &remote));

        // Proxy says the real client is remote, even on a local socket.
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.0.0.2".parse().unwrap());
        assert!(!is_localhost(&headers, &local));
    }
}
