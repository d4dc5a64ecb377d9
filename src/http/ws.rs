//! The single node-session-bus WebSocket endpoint (§6 `/system-info`).
//! Grounded in `original_source/go-backend/pkg/ws.go`'s `HandleConnection`:
//! `type=1` connections are nodes authenticated by their stored `secret`;
//! anything else is an admin dashboard observer authenticated by a
//! panel-issued bearer token, carried via `Sec-WebSocket-Protocol`
//! (preferred — the selected subprotocol is echoed back to complete the
//! handshake, `pkg/ws.go:96-115`) or the `secret` query param (fallback).

use std::net::SocketAddr;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use tracing::{info, warn};

use crate::auth::jwt;
use crate::domain::Node;
use crate::http::AppState;
use crate::node_bus::wire::NodeQuery;

async fn node_secret_matches(state: &AppState, node_id: i64, secret: &str) -> bool {
    sqlx::query_as::<_, Node>("SELECT * FROM nodes WHERE id = ?")
        .bind(node_id)
        .fetch_optional(&state.pool)
        .await
        .ok()
        .flatten()
        .is_some_and(|n| n.secret == secret)
}

async fn mark_node_status(pool: &sqlx::MySqlPool, node_id: i64, status: i32, version: Option<&str>) {
    if let Some(version) = version.filter(|v| !v.is_empty()) {
        let _ = sqlx::query("UPDATE nodes SET status = ?, version = ?, updated_time = ? WHERE id = ?")
            .bind(status)
            .bind(version)
            .bind(Utc::now().timestamp_millis())
            .bind(node_id)
            .execute(pool)
            .await;
    } else {
        let _ = sqlx::query("UPDATE nodes SET status = ?, updated_time = ? WHERE id = ?")
            .bind(status)
            .bind(Utc::now().timestamp_millis())
            .bind(node_id)
            .execute(pool)
            .await;
    }
}

/// The first client-offered `Sec-WebSocket-Protocol` value, if any — the
/// admin dashboard carries its bearer token this way in preference to the
/// `secret` query param.
fn subprotocol_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// `GET /system-info` (public at the router level; each connection type
/// authenticates itself inside the upgrade callback instead).
pub async fn upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(q): Query<NodeQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    if q.type_ == 1 {
        let Some(node_id) = q.id else {
            return axum::http::StatusCode::BAD_REQUEST.into_response();
        };
        let secret = q.secret.clone().unwrap_or_default();
        if !node_secret_matches(&state, node_id, &secret).await {
            warn!(node_id, "node websocket: secret mismatch");
            return axum::http::StatusCode::UNAUTHORIZED.into_response();
        }

        let version = q.node_version.clone();
        return ws.on_upgrade(move |socket| async move {
            let bus = state.bus.clone();
            let pool = state.pool.clone();
            let reconcile = state.reconcile.clone();
            let version_for_online = version.clone();
            bus.clone()
                .run_node_session(
                    node_id,
                    secret,
                    socket,
                    move |id| {
                        let pool = pool.clone();
                        let reconcile = reconcile.clone();
                        let version = version_for_online.clone();
                        tokio::spawn(async move {
                            mark_node_status(&pool, id, 1, version.as_deref()).await;
                            let result = reconcile.reconcile_node(id).await;
                            info!(node_id = id, error_count = result.errors.len(), "post-connect reconcile finished");
                        });
                    },
                    move |id| {
                        let pool = state.pool.clone();
                        tokio::spawn(async move {
                            mark_node_status(&pool, id, 0, None).await;
                        });
                    },
                )
                .await;
        });
    }

    // Admin dashboard observer: the bearer session token travels via
    // `Sec-WebSocket-Protocol` (preferred) or the `secret` query param
    // (fallback) and doubles as the JWT.
    let subprotocol = subprotocol_token(&headers);
    let token = subprotocol.clone().unwrap_or_else(|| q.secret.clone().unwrap_or_default());
    if jwt::validate_session_token(&state.jwt_secret, &token, Utc::now()).is_err() {
        return axum::http::StatusCode::UNAUTHORIZED.into_response();
    }

    let ws = if let Some(protocol) = subprotocol.clone() {
        ws.protocols([protocol])
    } else {
        ws
    };

    ws.on_upgrade(move |socket| async move {
        let (sink, mut stream) = futures_util::StreamExt::split(socket);
        let rx = state.bus.register_admin(addr);
        let pump = tokio::spawn(crate::node_bus::pump_admin_outbox(sink, rx));
        while stream.next().await.transpose().ok().flatten().is_some() {
            // Admin observers are read-only; inbound frames are discarded.
        }
        state.bus.unregister_admin(addr);
        pump.abort();
    })
}
