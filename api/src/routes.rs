// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! Route table and handlers. Every handler is a thin translation onto the
//! supervisor RPC; auth and CSRF run first.

use crate::auth::AuthState;
use crate::{ApiState, ws};
use axum::extract::{ConnectInfo, Multipart, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use base64::Engine as _;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

pub const SESSION_COOKIE: &str = "flywall_session";

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/auth/login", post(login))
        .route("/api/auth/logout", post(logout))
        .route("/api/config", get(get_config))
        .route("/api/config/diff", get(get_diff))
        .route("/api/config/apply", post(apply_config))
        .route("/api/config/discard", post(discard_config))
        .route("/api/dhcp/leases", get(get_leases))
        .route("/api/dns/stats", get(dns_stats))
        .route("/api/dns/lookup", post(dns_lookup))
        .route("/api/uplinks/groups", get(uplink_groups))
        .route("/api/uplinks/toggle", post(uplink_toggle))
        .route("/api/uplinks/test", post(uplink_test))
        .route("/api/devices", get(get_devices))
        .route("/api/devices/identity", post(device_identity))
        .route("/api/devices/link", post(device_link))
        .route("/api/flows", get(get_flows))
        .route("/api/system/status", get(system_status))
        .route("/api/system/reboot", post(system_reboot))
        .route("/api/system/upgrade", post(system_upgrade))
        .route("/api/ws", get(ws::upgrade))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Session cookie or `X-Api-Key`; either satisfies read access.
pub(crate) fn authorize(auth: &AuthState, jar: &CookieJar, headers: &HeaderMap) -> Result<(), Response> {
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        if auth.session_user(cookie.value()).is_some() {
            return Ok(());
        }
    }
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        if auth.api_key_ok(key) {
            return Ok(());
        }
    }
    Err(error_response(StatusCode::UNAUTHORIZED, "auth", "not authenticated"))
}

/// Mutations additionally require the CSRF double-submit header unless the
/// caller authenticated with an API key.
fn authorize_mutation(
    auth: &AuthState,
    jar: &CookieJar,
    headers: &HeaderMap,
) -> Result<(), Response> {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        if auth.api_key_ok(key) {
            return Ok(());
        }
    }
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        if auth.session_user(cookie.value()).is_some() {
            let header = headers.get("x-csrf-token").and_then(|v| v.to_str().ok());
            if auth.csrf_ok(cookie.value(), header) {
                return Ok(());
            }
            return Err(error_response(StatusCode::FORBIDDEN, "auth", "csrf token missing"));
        }
    }
    Err(error_response(StatusCode::UNAUTHORIZED, "auth", "not authenticated"))
}

fn error_response(status: StatusCode, kind: &str, message: &str) -> Response {
    (status, Json(json!({ "error": { "kind": kind, "message": message } }))).into_response()
}

/// Map RPC outcomes (including their stable error kinds) onto HTTP.
fn rpc_result(result: Result<Value, mgmt::RpcError>) -> Response {
    match result {
        Ok(value) => Json(value).into_response(),
        Err(mgmt::RpcError::Remote { kind, message }) => {
            let status = match kind.as_str() {
                "validation" => StatusCode::UNPROCESSABLE_ENTITY,
                "auth" => StatusCode::FORBIDDEN,
                "conflict" => StatusCode::CONFLICT,
                _ => StatusCode::BAD_GATEWAY,
            };
            error_response(status, &kind, &message)
        }
        Err(error) => error_response(StatusCode::BAD_GATEWAY, "transient-io", &error.to_string()),
    }
}

async fn login(
    State(state): State<Arc<ApiState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    jar: CookieJar,
    Json(body): Json<Value>,
) -> Response {
    let user = body["user"].as_str().unwrap_or_default().to_string();
    let password = body["password"].as_str().unwrap_or_default().to_string();

    let verified = state
        .rpc("VerifyUser", json!({ "user": user, "password": password }))
        .await
        .map(|v| v["ok"] == true)
        .unwrap_or(false);

    if !verified {
        warn!(user, peer = %peer.ip(), "login failed");
        if state.auth.failures.record_failure(peer.ip(), Instant::now()) {
            // The fail2ban signal: the supervisor owns the kernel set.
            let _ = state
                .rpc(
                    "AddBlockedIP",
                    json!({ "ip": peer.ip().to_string(), "reason": "failed logins" }),
                )
                .await;
        }
        return error_response(StatusCode::UNAUTHORIZED, "auth", "bad credentials");
    }

    state.auth.failures.record_success(peer.ip());
    let (token, csrf) = state.auth.open_session(&user);
    info!(user, "login ok");
    let jar = jar.add(
        Cookie::build((SESSION_COOKIE, token))
            .path("/")
            .http_only(true)
            .build(),
    );
    (jar, Json(json!({ "user": user, "csrf": csrf }))).into_response()
}

async fn logout(State(state): State<Arc<ApiState>>, jar: CookieJar) -> Response {
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        state.auth.close_session(cookie.value());
    }
    let jar = jar.remove(Cookie::from(SESSION_COOKIE));
    (jar, Json(json!({ "ok": true }))).into_response()
}

macro_rules! read_endpoint {
    ($name:ident, $method:literal) => {
        async fn $name(
            State(state): State<Arc<ApiState>>,
            jar: CookieJar,
            headers: HeaderMap,
        ) -> Response {
            if let Err(denied) = authorize(&state.auth, &jar, &headers) {
                return denied;
            }
            rpc_result(state.rpc($method, Value::Null).await)
        }
    };
}

read_endpoint!(get_config, "GetConfig");
read_endpoint!(get_diff, "DiffConfig");
read_endpoint!(get_leases, "GetLeases");
read_endpoint!(dns_stats, "DnsStats");
read_endpoint!(uplink_groups, "GetUplinks");
read_endpoint!(get_devices, "GetDevices");
read_endpoint!(get_flows, "GetFlows");
read_endpoint!(system_status, "GetStatus");

macro_rules! mutation_endpoint {
    ($name:ident, $method:literal) => {
        async fn $name(
            State(state): State<Arc<ApiState>>,
            jar: CookieJar,
            headers: HeaderMap,
            body: Option<Json<Value>>,
        ) -> Response {
            if let Err(denied) = authorize_mutation(&state.auth, &jar, &headers) {
                return denied;
            }
            let params = body.map(|Json(v)| v).unwrap_or(Value::Null);
            rpc_result(state.rpc($method, params).await)
        }
    };
}

mutation_endpoint!(apply_config, "ApplyConfig");
mutation_endpoint!(discard_config, "DiscardStaged");
mutation_endpoint!(dns_lookup, "DnsLookup");
mutation_endpoint!(uplink_toggle, "ToggleUplink");
mutation_endpoint!(uplink_test, "TestUplinks");
mutation_endpoint!(device_identity, "SetDeviceIdentity");
mutation_endpoint!(device_link, "LinkDevice");
mutation_endpoint!(system_reboot, "SystemReboot");

/// Multipart upload: a `binary` part and a `sha256` part. Staged through
/// the supervisor, then finalized.
async fn system_upgrade(
    State(state): State<Arc<ApiState>>,
    jar: CookieJar,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    if let Err(denied) = authorize_mutation(&state.auth, &jar, &headers) {
        return denied;
    }

    let mut binary: Option<Vec<u8>> = None;
    let mut sha256: Option<String> = None;
    while let Ok(Some(field)) = multipart.next_field().await {
        match field.name() {
            Some("binary") => {
                if let Ok(bytes) = field.bytes().await {
                    binary = Some(bytes.to_vec());
                }
            }
            Some("sha256") => {
                if let Ok(text) = field.text().await {
                    sha256 = Some(text);
                }
            }
            _ => {}
        }
    }
    let (Some(binary), Some(sha256)) = (binary, sha256) else {
        return error_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            "validation",
            "binary and sha256 parts required",
        );
    };

    let encoded = base64::engine::general_purpose::STANDARD.encode(&binary);
    let staged = state
        .rpc("StageBinary", json!({ "bytes": encoded, "sha256": sha256 }))
        .await;
    if let Err(error) = staged {
        return rpc_result(Err(error));
    }
    rpc_result(state.rpc("Upgrade", json!({ "sha256": sha256 })).await)
}
