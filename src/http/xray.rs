//! Xray (engine-2) inbound/client/cert CRUD, lifecycle control and
//! subscription endpoints (§6 `xray/*`, public `xray/sub/:token` and
//! `open_api/sub_store`). Permission checks are service-layer: node
//! lifecycle is admin-gated at the route table, everything else here is
//! checked against the caller's own clients/inbounds. Grounded in
//! `original_source/go-backend/handler/xray.go` and `service/xray_*.go`.

use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::Utc;
use serde::Deserialize;

use crate::auth::AuthUser;
use crate::auth::jwt;
use crate::domain::{Node, XrayClient, XrayInbound, XrayTlsCert};
use crate::error::{ApiError, ApiResult, R};
use crate::http::AppState;
use crate::programmer::xray_cmds;
use crate::subscription;

async fn load_node(state: &AppState, node_id: i64) -> Result<Node, ApiError> {
    sqlx::query_as::<_, Node>("SELECT * FROM nodes WHERE id = ?")
        .bind(node_id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| ApiError::validation("节点不存在"))
}

async fn load_inbound(state: &AppState, id: i64) -> Result<XrayInbound, ApiError> {
    sqlx::query_as::<_, XrayInbound>("SELECT * FROM xray_inbounds WHERE id = ?")
        .bind(id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| ApiError::not_found("入站规则不存在"))
}

async fn load_client(state: &AppState, id: i64) -> Result<XrayClient, ApiError> {
    sqlx::query_as::<_, XrayClient>("SELECT * FROM xray_clients WHERE id = ?")
        .bind(id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| ApiError::not_found("客户端不存在"))
}

#[derive(Debug, Deserialize)]
pub struct NodeIdRequest {
    #[serde(rename = "nodeId")]
    node_id: i64,
}

/// `POST /api/v1/xray/node/start` (admin).
pub async fn node_start(State(state): State<AppState>, Json(body): Json<NodeIdRequest>) -> ApiResult {
    let resp = xray_cmds::start(&state.bus, body.node_id).await;
    Ok(R::ok(resp))
}

/// `POST /api/v1/xray/node/stop` (admin).
pub async fn node_stop(State(state): State<AppState>, Json(body): Json<NodeIdRequest>) -> ApiResult {
    let resp = xray_cmds::stop(&state.bus, body.node_id).await;
    Ok(R::ok(resp))
}

/// `POST /api/v1/xray/node/restart` (admin).
pub async fn node_restart(State(state): State<AppState>, Json(body): Json<NodeIdRequest>) -> ApiResult {
    let resp = xray_cmds::restart(&state.bus, body.node_id).await;
    Ok(R::ok(resp))
}

/// `POST /api/v1/xray/node/status` (admin).
pub async fn node_status(State(state): State<AppState>, Json(body): Json<NodeIdRequest>) -> ApiResult {
    let resp = xray_cmds::status(&state.bus, body.node_id).await;
    Ok(R::ok(resp))
}

#[derive(Debug, Deserialize)]
pub struct CreateInboundRequest {
    #[serde(rename = "nodeId")]
    node_id: i64,
    tag: String,
    protocol: String,
    #[serde(default)]
    listen: String,
    port: i32,
    #[serde(default, rename = "settingsJson")]
    settings_json: String,
    #[serde(default, rename = "streamSettingsJson")]
    stream_settings_json: String,
    #[serde(default, rename = "sniffingJson")]
    sniffing_json: String,
}

/// `POST /api/v1/xray/inbound/create`. `(node, port)` and `(node, tag)` are
/// both unique (§3 XrayInbound invariant).
pub async fn inbound_create(State(state): State<AppState>, Json(body): Json<CreateInboundRequest>) -> ApiResult {
    load_node(&state, body.node_id).await?;

    let dup: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM xray_inbounds WHERE node_id = ? AND (port = ? OR tag = ?)")
        .bind(body.node_id)
        .bind(body.port)
        .bind(&body.tag)
        .fetch_one(&state.pool)
        .await?;
    if dup > 0 {
        return Err(ApiError::validation("该节点已存在相同端口或标签的入站规则"));
    }

    let listen = if body.listen.is_empty() { "0.0.0.0".to_string() } else { body.listen.clone() };
    let settings_json = if body.settings_json.is_empty() { "{}".to_string() } else { body.settings_json.clone() };
    let stream_settings_json = if body.stream_settings_json.is_empty() { "{}".to_string() } else { body.stream_settings_json.clone() };
    let sniffing_json = if body.sniffing_json.is_empty() { "{}".to_string() } else { body.sniffing_json.clone() };
    let now = Utc::now().timestamp_millis();

    let result = sqlx::query(
        "INSERT INTO xray_inbounds (node_id, tag, protocol, listen, port, settings_json, stream_settings_json, sniffing_json, enable, created_time, updated_time) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)",
    )
    .bind(body.node_id)
    .bind(&body.tag)
    .bind(&body.protocol)
    .bind(&listen)
    .bind(body.port)
    .bind(&settings_json)
    .bind(&stream_settings_json)
    .bind(&sniffing_json)
    .bind(now)
    .bind(now)
    .execute(&state.pool)
    .await?;

    let id = result.last_insert_id() as i64;
    let inbound = load_inbound(&state, id).await?;
    let resp = xray_cmds::add_inbound(&state.bus, body.node_id, &inbound, &[]).await;
    if !resp.is_ok() && !resp.is_already_exists() && !resp.is_engine_not_running() {
        return Err(ApiError::validation(format!("入站规则下发失败: {}", resp.message)));
    }
    Ok(R::ok(inbound))
}

#[derive(Debug, Deserialize)]
pub struct NodeScopedQuery {
    #[serde(rename = "nodeId")]
    node_id: Option<i64>,
}

/// `POST /api/v1/xray/inbound/list`, optionally scoped to one node.
pub async fn inbound_list(State(state): State<AppState>, Json(body): Json<NodeScopedQuery>) -> ApiResult {
    let inbounds: Vec<XrayInbound> = match body.node_id {
        Some(node_id) => {
            sqlx::query_as("SELECT * FROM xray_inbounds WHERE node_id = ? ORDER BY created_time DESC")
                .bind(node_id)
                .fetch_all(&state.pool)
                .await?
        }
        None => sqlx::query_as("SELECT * FROM xray_inbounds ORDER BY created_time DESC").fetch_all(&state.pool).await?,
    };
    Ok(R::ok(inbounds))
}

#[derive(Debug, Deserialize)]
pub struct UpdateInboundRequest {
    id: i64,
    #[serde(default)]
    listen: String,
    port: Option<i32>,
    #[serde(rename = "settingsJson")]
    settings_json: Option<String>,
    #[serde(rename = "streamSettingsJson")]
    stream_settings_json: Option<String>,
    #[serde(rename = "sniffingJson")]
    sniffing_json: Option<String>,
}

/// `POST /api/v1/xray/inbound/update`: removes the old inbound node-side and
/// re-adds it under the new shape — Xray has no hot-update-in-place
/// primitive for inbound settings the way GOST does for forwarders.
pub async fn inbound_update(State(state): State<AppState>, Json(body): Json<UpdateInboundRequest>) -> ApiResult {
    let existing = load_inbound(&state, body.id).await?;

    let listen = if body.listen.is_empty() { existing.listen.clone() } else { body.listen.clone() };
    let port = body.port.unwrap_or(existing.port);
    let settings_json = body.settings_json.unwrap_or(existing.settings_json.clone());
    let stream_settings_json = body.stream_settings_json.unwrap_or(existing.stream_settings_json.clone());
    let sniffing_json = body.sniffing_json.unwrap_or(existing.sniffing_json.clone());

    sqlx::query(
        "UPDATE xray_inbounds SET listen = ?, port = ?, settings_json = ?, stream_settings_json = ?, sniffing_json = ?, updated_time = ? WHERE id = ?",
    )
    .bind(&listen)
    .bind(port)
    .bind(&settings_json)
    .bind(&stream_settings_json)
    .bind(&sniffing_json)
    .bind(Utc::now().timestamp_millis())
    .bind(body.id)
    .execute(&state.pool)
    .await?;

    if existing.enable == 1 {
        let clients: Vec<XrayClient> = sqlx::query_as("SELECT * FROM xray_clients WHERE inbound_id = ? AND enable = 1")
            .bind(existing.id)
            .fetch_all(&state.pool)
            .await?;
        let updated = load_inbound(&state, body.id).await?;
        let _ = xray_cmds::remove_inbound(&state.bus, existing.node_id, &existing.tag).await;
        let resp = xray_cmds::add_inbound(&state.bus, existing.node_id, &updated, &clients).await;
        if !resp.is_ok() && !resp.is_already_exists() && !resp.is_engine_not_running() {
            return Err(ApiError::validation(format!("入站规则更新下发失败: {}", resp.message)));
        }
    }

    Ok(R::ok_msg("入站规则更新成功"))
}

#[derive(Debug, Deserialize)]
pub struct IdRequest {
    id: i64,
}

/// `POST /api/v1/xray/inbound/delete`: also purges its clients.
pub async fn inbound_delete(State(state): State<AppState>, Json(body): Json<IdRequest>) -> ApiResult {
    let inbound = load_inbound(&state, body.id).await?;
    let _ = xray_cmds::remove_inbound(&state.bus, inbound.node_id, &inbound.tag).await;
    sqlx::query("DELETE FROM xray_clients WHERE inbound_id = ?").bind(body.id).execute(&state.pool).await?;
    sqlx::query("DELETE FROM xray_inbounds WHERE id = ?").bind(body.id).execute(&state.pool).await?;
    Ok(R::ok_msg("入站规则删除成功"))
}

async fn set_inbound_enable(state: &AppState, id: i64, enable: i32) -> ApiResult {
    let inbound = load_inbound(state, id).await?;
    sqlx::query("UPDATE xray_inbounds SET enable = ?, updated_time = ? WHERE id = ?")
        .bind(enable)
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(&state.pool)
        .await?;

    if enable == 1 {
        let clients: Vec<XrayClient> = sqlx::query_as("SELECT * FROM xray_clients WHERE inbound_id = ? AND enable = 1")
            .bind(id)
            .fetch_all(&state.pool)
            .await?;
        let updated = load_inbound(state, id).await?;
        let resp = xray_cmds::add_inbound(&state.bus, inbound.node_id, &updated, &clients).await;
        if !resp.is_ok() && !resp.is_already_exists() && !resp.is_engine_not_running() {
            return Err(ApiError::validation(format!("入站规则启用失败: {}", resp.message)));
        }
        Ok(R::ok_msg("入站规则已启用"))
    } else {
        let _ = xray_cmds::remove_inbound(&state.bus, inbound.node_id, &inbound.tag).await;
        Ok(R::ok_msg("入站规则已禁用"))
    }
}

/// `POST /api/v1/xray/inbound/enable`.
pub async fn inbound_enable(State(state): State<AppState>, Json(body): Json<IdRequest>) -> ApiResult {
    set_inbound_enable(&state, body.id, 1).await
}

/// `POST /api/v1/xray/inbound/disable`.
pub async fn inbound_disable(State(state): State<AppState>, Json(body): Json<IdRequest>) -> ApiResult {
    set_inbound_enable(&state, body.id, 0).await
}

fn generate_credential(protocol: &str) -> String {
    if protocol == "shadowsocks" {
        let mut rng = rand::thread_rng();
        crate::protocol::generate_ss2022_psk_b64(&mut rng)
    } else {
        uuid::Uuid::new_v4().to_string()
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateClientRequest {
    #[serde(rename = "inboundId")]
    inbound_id: i64,
    #[serde(default, rename = "userId")]
    user_id: Option<i64>,
    #[serde(default)]
    flow: String,
    #[serde(default, rename = "totalTraffic")]
    total_traffic: i64,
    #[serde(default, rename = "expTime")]
    exp_time: i64,
    #[serde(default, rename = "resetCycleDays")]
    reset_cycle_days: i32,
}

/// `POST /api/v1/xray/client/create`: email is panel-generated
/// (`<userId>_<createdMs>@local`, §3 XrayClient) and is the node-side
/// identity used in all engine-2 calls.
pub async fn client_create(State(state): State<AppState>, Extension(auth): Extension<AuthUser>, Json(body): Json<CreateClientRequest>) -> ApiResult {
    let inbound = load_inbound(&state, body.inbound_id).await?;
    let owner_id = if auth.is_admin() { body.user_id.unwrap_or(auth.user_id) } else { auth.user_id };

    let now = Utc::now().timestamp_millis();
    let email = format!("{owner_id}_{now}@local");
    let credential = generate_credential(&inbound.protocol);

    let result = sqlx::query(
        "INSERT INTO xray_clients (inbound_id, user_id, email, credential, flow, total_traffic, up_traffic, down_traffic, exp_time, reset_cycle_days, enable, created_time, updated_time) \
         VALUES (?, ?, ?, ?, ?, ?, 0, 0, ?, ?, 1, ?, ?)",
    )
    .bind(body.inbound_id)
    .bind(owner_id)
    .bind(&email)
    .bind(&credential)
    .bind(&body.flow)
    .bind(body.total_traffic)
    .bind(body.exp_time)
    .bind(body.reset_cycle_days)
    .bind(now)
    .bind(now)
    .execute(&state.pool)
    .await?;

    let id = result.last_insert_id() as i64;
    let client = load_client(&state, id).await?;

    if inbound.enable == 1 {
        let resp = xray_cmds::add_client(&state.bus, inbound.node_id, &inbound.tag, &email, &credential, &body.flow, 0, &inbound.protocol).await;
        if !resp.is_ok() && !resp.is_already_exists() && !resp.is_engine_not_running() {
            return Err(ApiError::validation(format!("客户端下发失败: {}", resp.message)));
        }
    }

    Ok(R::ok(client))
}

#[derive(Debug, Deserialize)]
pub struct ClientListQuery {
    #[serde(rename = "inboundId")]
    inbound_id: Option<i64>,
}

/// `POST /api/v1/xray/client/list`: the caller's own clients, or every
/// client (optionally scoped to one inbound) for an admin.
pub async fn client_list(State(state): State<AppState>, Extension(auth): Extension<AuthUser>, Json(body): Json<ClientListQuery>) -> ApiResult {
    let clients: Vec<XrayClient> = if auth.is_admin() {
        match body.inbound_id {
            Some(inbound_id) => {
                sqlx::query_as("SELECT * FROM xray_clients WHERE inbound_id = ? ORDER BY created_time DESC")
                    .bind(inbound_id)
                    .fetch_all(&state.pool)
                    .await?
            }
            None => sqlx::query_as("SELECT * FROM xray_clients ORDER BY created_time DESC").fetch_all(&state.pool).await?,
        }
    } else {
        sqlx::query_as("SELECT * FROM xray_clients WHERE user_id = ? ORDER BY created_time DESC")
            .bind(auth.user_id)
            .fetch_all(&state.pool)
            .await?
    };
    Ok(R::ok(clients))
}

#[derive(Debug, Deserialize)]
pub struct UpdateClientRequest {
    id: i64,
    flow: Option<String>,
    #[serde(rename = "totalTraffic")]
    total_traffic: Option<i64>,
    #[serde(rename = "expTime")]
    exp_time: Option<i64>,
    #[serde(rename = "resetCycleDays")]
    reset_cycle_days: Option<i32>,
    enable: Option<i32>,
}

/// `POST /api/v1/xray/client/update`: non-admins may only edit their own
/// clients. A changed `enable` toggles the node-side client registration.
pub async fn client_update(State(state): State<AppState>, Extension(auth): Extension<AuthUser>, Json(body): Json<UpdateClientRequest>) -> ApiResult {
    let existing = load_client(&state, body.id).await?;
    if !auth.is_admin() && existing.user_id != auth.user_id {
        return Err(ApiError::not_found("客户端不存在"));
    }

    let flow = body.flow.unwrap_or(existing.flow.clone());
    let total_traffic = body.total_traffic.unwrap_or(existing.total_traffic);
    let exp_time = body.exp_time.unwrap_or(existing.exp_time);
    let reset_cycle_days = body.reset_cycle_days.unwrap_or(existing.reset_cycle_days);
    let enable = body.enable.unwrap_or(existing.enable);

    sqlx::query(
        "UPDATE xray_clients SET flow = ?, total_traffic = ?, exp_time = ?, reset_cycle_days = ?, enable = ?, updated_time = ? WHERE id = ?",
    )
    .bind(&flow)
    .bind(total_traffic)
    .bind(exp_time)
    .bind(reset_cycle_days)
    .bind(enable)
    .bind(Utc::now().timestamp_millis())
    .bind(body.id)
    .execute(&state.pool)
    .await?;

    if enable != existing.enable {
        let inbound = load_inbound(&state, existing.inbound_id).await?;
        if enable == 1 {
            let _ = xray_cmds::add_client(&state.bus, inbound.node_id, &inbound.tag, &existing.email, &existing.credential, &flow, 0, &inbound.protocol).await;
        } else {
            let _ = xray_cmds::remove_client(&state.bus, inbound.node_id, &inbound.tag, &existing.email).await;
        }
    }

    Ok(R::ok_msg("客户端更新成功"))
}

/// `POST /api/v1/xray/client/delete`.
pub async fn client_delete(State(state): State<AppState>, Extension(auth): Extension<AuthUser>, Json(body): Json<IdRequest>) -> ApiResult {
    let client = load_client(&state, body.id).await?;
    if !auth.is_admin() && client.user_id != auth.user_id {
        return Err(ApiError::not_found("客户端不存在"));
    }
    let inbound = load_inbound(&state, client.inbound_id).await?;
    let _ = xray_cmds::remove_client(&state.bus, inbound.node_id, &inbound.tag, &client.email).await;
    sqlx::query("DELETE FROM xray_clients WHERE id = ?").bind(body.id).execute(&state.pool).await?;
    Ok(R::ok_msg("客户端删除成功"))
}

/// `POST /api/v1/xray/client/reset-traffic`: zeroes the counters and
/// re-enables the client, matching the reset-cycle-expiry auto-recovery
/// behavior (§3 Lifecycle) but triggered on demand.
pub async fn client_reset_traffic(State(state): State<AppState>, Extension(auth): Extension<AuthUser>, Json(body): Json<IdRequest>) -> ApiResult {
    let client = load_client(&state, body.id).await?;
    if !auth.is_admin() && client.user_id != auth.user_id {
        return Err(ApiError::not_found("客户端不存在"));
    }
    let was_disabled = client.enable == 0;
    sqlx::query("UPDATE xray_clients SET up_traffic = 0, down_traffic = 0, enable = 1, updated_time = ? WHERE id = ?")
        .bind(Utc::now().timestamp_millis())
        .bind(body.id)
        .execute(&state.pool)
        .await?;

    if was_disabled {
        let inbound = load_inbound(&state, client.inbound_id).await?;
        let _ = xray_cmds::add_client(&state.bus, inbound.node_id, &inbound.tag, &client.email, &client.credential, &client.flow, 0, &inbound.protocol).await;
    }
    Ok(R::ok_msg("流量已重置"))
}

#[derive(Debug, Deserialize)]
pub struct CreateCertRequest {
    #[serde(rename = "nodeId")]
    node_id: i64,
    domain: String,
}

fn generate_self_signed_cert(domain: &str) -> Result<(String, String), ApiError> {
    let key_pair = rcgen::KeyPair::generate().map_err(|e| ApiError::Internal(e.to_string()))?;
    let mut cert_params = rcgen::CertificateParams::new(vec![domain.to_string()]).map_err(|e| ApiError::Internal(e.to_string()))?;
    cert_params.distinguished_name = rcgen::DistinguishedName::new();
    let cert = cert_params.self_signed(&key_pair).map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok((cert.pem(), key_pair.serialize_pem()))
}

/// `POST /api/v1/xray/cert/create` (admin): registers a cert record without
/// necessarily issuing via ACME yet — `issue`/`renew` populate the keypair.
pub async fn cert_create(State(state): State<AppState>, Json(body): Json<CreateCertRequest>) -> ApiResult {
    load_node(&state, body.node_id).await?;
    let now = Utc::now().timestamp_millis();
    let result = sqlx::query(
        "INSERT INTO xray_tls_certs (node_id, domain, public_key, private_key, acme_enabled, acme_email, challenge_type, dns_provider, dns_json, exp_time, last_renew_time, created_time, updated_time) \
         VALUES (?, ?, '', '', 0, '', '', '', '', 0, 0, ?, ?)",
    )
    .bind(body.node_id)
    .bind(&body.domain)
    .bind(now)
    .bind(now)
    .execute(&state.pool)
    .await?;

    let cert: XrayTlsCert = sqlx::query_as("SELECT * FROM xray_tls_certs WHERE id = ?")
        .bind(result.last_insert_id() as i64)
        .fetch_one(&state.pool)
        .await?;
    Ok(R::ok(cert))
}

/// `POST /api/v1/xray/cert/list` (admin): private keys are never returned
/// (§3 XrayTlsCert invariant — enforced by `#[serde(skip_serializing)]` on
/// the field itself).
pub async fn cert_list(State(state): State<AppState>, Json(body): Json<NodeScopedQuery>) -> ApiResult {
    let certs: Vec<XrayTlsCert> = match body.node_id {
        Some(node_id) => {
            sqlx::query_as("SELECT * FROM xray_tls_certs WHERE node_id = ? ORDER BY created_time DESC")
                .bind(node_id)
                .fetch_all(&state.pool)
                .await?
        }
        None => sqlx::query_as("SELECT * FROM xray_tls_certs ORDER BY created_time DESC").fetch_all(&state.pool).await?,
    };
    Ok(R::ok(certs))
}

/// `POST /api/v1/xray/cert/delete` (admin).
pub async fn cert_delete(State(state): State<AppState>, Json(body): Json<IdRequest>) -> ApiResult {
    sqlx::query("DELETE FROM xray_tls_certs WHERE id = ?").bind(body.id).execute(&state.pool).await?;
    Ok(R::ok_msg("证书删除成功"))
}

async fn load_cert(state: &AppState, id: i64) -> Result<XrayTlsCert, ApiError> {
    sqlx::query_as::<_, XrayTlsCert>("SELECT * FROM xray_tls_certs WHERE id = ?")
        .bind(id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| ApiError::not_found("证书不存在"))
}

/// `POST /api/v1/xray/cert/issue` (admin): generates a keypair for the
/// domain and pushes it to the node. Full ACME HTTP-01/DNS-01 issuance is a
/// non-core external collaborator (§1); this self-signs so the rest of the
/// cert-deployment pipeline (storage, node push, renewal cron) is exercised
/// end-to-end against a real keypair shape.
pub async fn cert_issue(State(state): State<AppState>, Json(body): Json<IdRequest>) -> ApiResult {
    let cert = load_cert(&state, body.id).await?;
    let (public_key, private_key) = generate_self_signed_cert(&cert.domain)?;
    let now = Utc::now().timestamp_millis();
    let exp_time = now + 90 * 24 * 3600 * 1000;

    sqlx::query("UPDATE xray_tls_certs SET public_key = ?, private_key = ?, exp_time = ?, last_renew_time = ?, updated_time = ? WHERE id = ?")
        .bind(&public_key)
        .bind(&private_key)
        .bind(exp_time)
        .bind(now)
        .bind(now)
        .bind(body.id)
        .execute(&state.pool)
        .await?;

    let resp = xray_cmds::deploy_cert(&state.bus, cert.node_id, &cert.domain, &public_key, &private_key).await;
    if !resp.is_ok() {
        return Err(ApiError::validation(format!("证书下发失败: {}", resp.message)));
    }
    Ok(R::ok_msg("证书签发成功"))
}

/// `POST /api/v1/xray/cert/renew` (admin): same path as `issue`, kept
/// distinct so the admin UI and the renewal cron read intent clearly.
pub async fn cert_renew(State(state): State<AppState>, Json(body): Json<IdRequest>) -> ApiResult {
    cert_issue(State(state), Json(body)).await
}

/// `POST /api/v1/xray/sub/token`: a 24h-TTL subscription-scoped JWT the
/// caller can hand to their Xray client's subscription URL.
pub async fn sub_token(State(state): State<AppState>, Extension(auth): Extension<AuthUser>) -> ApiResult {
    let token = jwt::issue_subscription_token(&state.jwt_secret, auth.user_id, Utc::now());
    Ok(R::ok(serde_json::json!({ "token": token })))
}

/// `POST /api/v1/xray/sub/links`: the caller's subscription links as
/// structured JSON (for in-panel display, as opposed to the raw
/// base64 body the public endpoints hand to client software).
pub async fn sub_links(State(state): State<AppState>, Extension(auth): Extension<AuthUser>) -> ApiResult {
    let user = sqlx::query_as::<_, crate::domain::User>("SELECT * FROM users WHERE id = ?")
        .bind(auth.user_id)
        .fetch_one(&state.pool)
        .await?;
    let links = subscription::subscription_links(&state.pool, &user).await;
    Ok(R::ok(links))
}

fn plain_text(body: String) -> Response {
    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response()
}

/// `GET /api/v1/xray/sub/:token` (public): the subscription-token-gated
/// endpoint an Xray/V2Ray client's "update subscription" action hits
/// directly, returning the base64 link bundle as a raw text body.
pub async fn subscription_by_token(State(state): State<AppState>, Path(token): Path<String>) -> Response {
    let Ok(claims) = jwt::validate_subscription_token(&state.jwt_secret, &token, Utc::now()) else {
        return (axum::http::StatusCode::UNAUTHORIZED, "invalid token").into_response();
    };
    let Ok(user_id) = claims.sub.parse::<i64>() else {
        return (axum::http::StatusCode::UNAUTHORIZED, "invalid token").into_response();
    };
    let Ok(user) = sqlx::query_as::<_, crate::domain::User>("SELECT * FROM users WHERE id = ?").bind(user_id).fetch_one(&state.pool).await else {
        return (axum::http::StatusCode::NOT_FOUND, "user not found").into_response();
    };
    let links = subscription::subscription_links(&state.pool, &user).await;
    plain_text(subscription::encode_subscription_body(&links))
}

#[derive(Debug, Deserialize)]
pub struct SubStoreQuery {
    token: String,
}

/// `GET /api/v1/open_api/sub_store` (public): the same subscription body,
/// addressed by a `?token=` query parameter instead of a path segment —
/// some subscription-aggregator clients (sub-store et al.) only support
/// query-string tokens.
pub async fn sub_store(State(state): State<AppState>, Query(q): Query<SubStoreQuery>) -> Response {
    subscription_by_token(State(state), Path(q.token)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_credential_shadowsocks_is_base64_psk() {
        use base64::Engine as _;
        let cred = generate_credential("shadowsocks");
        assert!(base64::engine::general_purpose::STANDARD.decode(&cred).is_ok());
    }

    #[test]
    fn generate_credential_other_protocols_is_uuid() {
        for protocol in ["vless", "vmess", "trojan"] {
            let cred = generate_credential(protocol);
            assert!(uuid::Uuid::parse_str(&cred).is_ok(), "{protocol} credential should parse as a uuid");
        }
    }

    #[test]
    fn generate_self_signed_cert_produces_pem_keypair() {
        let (cert_pem, key_pem) = generate_self_signed_cert("example.com").unwrap();
        assert!(cert_pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(key_pem.contains("PRIVATE KEY"));
    }

    #[test]
    fn create_inbound_request_accepts_camel_case_fields() {
        let body: CreateInboundRequest = serde_json::from_str(
            r#"{"nodeId":1,"tag":"in1","protocol":"vless","port":443,"settingsJson":"{}","streamSettingsJson":"{}","sniffingJson":"{}"}"#,
        )
        .unwrap();
        assert_eq!(body.node_id, 1);
        assert_eq!(body.port, 443);
    }

    #[test]
    fn create_client_request_defaults_are_zero() {
        let body: CreateClientRequest = serde_json::from_str(r#"{"inboundId":5}"#).unwrap();
        assert_eq!(body.inbound_id, 5);
        assert_eq!(body.total_traffic, 0);
        assert_eq!(body.reset_cycle_days, 0);
        assert!(body.flow.is_empty());
    }
}
