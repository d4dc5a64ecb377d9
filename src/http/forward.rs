//! Forward CRUD, pause/resume, ordering and diagnostics (§6 `forward/*`).
//! Permission checks are service-layer, not route-gated — every handler
//! loads the row, then checks `support::owns_forward` for non-admins.
//! Grounded in `original_source/go-backend/handler/forward.go` and
//! `service/forward.go`.

use axum::extract::State;
use axum::{Extension, Json};
use chrono::Utc;
use serde::Deserialize;

use crate::auth::AuthUser;
use crate::domain::{FORWARD_STATUS_ACTIVE, FORWARD_STATUS_PAUSED, Forward, Node, Tunnel, User, UserTunnel, naming};
use crate::error::{ApiError, ApiResult, R};
use crate::http::AppState;
use crate::http::support;
use crate::programmer::{self, UpdatePlan, gost};

async fn load_tunnel(state: &AppState, tunnel_id: i64) -> Result<Tunnel, ApiError> {
    sqlx::query_as::<_, Tunnel>("SELECT * FROM tunnels WHERE id = ?")
        .bind(tunnel_id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| ApiError::validation("隧道不存在"))
}

async fn load_node(state: &AppState, node_id: i64) -> Result<Node, ApiError> {
    sqlx::query_as::<_, Node>("SELECT * FROM nodes WHERE id = ?")
        .bind(node_id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| ApiError::validation("节点不存在"))
}

async fn load_forward(state: &AppState, id: i64) -> Result<Forward, ApiError> {
    sqlx::query_as::<_, Forward>("SELECT * FROM forwards WHERE id = ?")
        .bind(id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| ApiError::not_found("转发不存在"))
}

/// The user-tunnel row for `(user_id, tunnel_id)`, or `None` for an
/// admin-owned forward (`user_tunnel_id = 0`, §3 Service naming).
async fn load_user_tunnel(state: &AppState, user_id: i64, tunnel_id: i64) -> Result<Option<UserTunnel>, ApiError> {
    Ok(sqlx::query_as::<_, UserTunnel>("SELECT * FROM user_tunnels WHERE user_id = ? AND tunnel_id = ?")
        .bind(user_id)
        .bind(tunnel_id)
        .fetch_optional(&state.pool)
        .await?)
}

#[derive(Debug, Deserialize)]
pub struct CreateForwardRequest {
    name: String,
    #[serde(rename = "tunnelId")]
    tunnel_id: i64,
    #[serde(rename = "inPort")]
    in_port: Option<i32>,
    #[serde(rename = "remoteAddr")]
    remote_addr: String,
    #[serde(default)]
    strategy: String,
    #[serde(default, rename = "listenIp")]
    listen_ip: String,
    #[serde(default, rename = "interfaceName")]
    interface_name: String,
}

/// `POST /api/v1/forward/create`. Allocates (or validates) the in-port (and,
/// for relay tunnels, the out-port) on the tunnel's node pair, runs the
/// quota/SSRF checks for non-admins, inserts the row, then pushes the
/// node-side service set (§4.5, §4.2 creation path).
pub async fn create(State(state): State<AppState>, Extension(auth): Extension<AuthUser>, Json(body): Json<CreateForwardRequest>) -> ApiResult {
    let tunnel = load_tunnel(&state, body.tunnel_id).await?;
    let in_node = load_node(&state, tunnel.in_node_id).await?;

    let user_tunnel = load_user_tunnel(&state, auth.user_id, tunnel.id).await?;
    let user_tunnel_id = user_tunnel.as_ref().map(|ut| ut.id).unwrap_or(0);

    if !auth.is_admin() {
        let user_tunnel = user_tunnel.as_ref().ok_or_else(|| ApiError::validation("你没有该隧道权限"))?;
        let user: User = sqlx::query_as("SELECT * FROM users WHERE id = ?").bind(auth.user_id).fetch_one(&state.pool).await?;
        support::check_forward_quota(&state.pool, &user, user_tunnel, Utc::now().timestamp_millis(), None).await?;
        support::validate_remote_addr(&body.remote_addr, false).await?;
    }

    let in_port = match body.in_port {
        Some(port) => {
            support::validate_port_range(port, in_node.port_sta, in_node.port_end)?;
            if support::port_in_use(&state.pool, in_node.id, port, true, None).await {
                return Err(ApiError::validation("该端口已被占用"));
            }
            port
        }
        None => support::allocate_port(&state.pool, in_node.id, in_node.port_sta, in_node.port_end, true, None).await?,
    };

    let (out_node, out_port) = if tunnel.is_relay() {
        let out_node = load_node(&state, tunnel.out_node_id).await?;
        let out_port = support::allocate_port(&state.pool, out_node.id, out_node.port_sta, out_node.port_end, false, None).await?;
        (Some(out_node), out_port)
    } else {
        (None, 0)
    };

    let now = Utc::now().timestamp_millis();
    let max_order: Option<i32> = sqlx::query_scalar("SELECT MAX(order_index) FROM forwards WHERE user_id = ?")
        .bind(auth.user_id)
        .fetch_one(&state.pool)
        .await
        .unwrap_or(None);

    let result = sqlx::query(
        "INSERT INTO forwards (user_id, tunnel_id, user_tunnel_id, name, in_port, out_port, remote_addr, strategy, listen_ip, interface_name, in_flow, out_flow, order_index, status, created_time, updated_time) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0, ?, ?, ?, ?)",
    )
    .bind(auth.user_id)
    .bind(body.tunnel_id)
    .bind(user_tunnel_id)
    .bind(&body.name)
    .bind(in_port)
    .bind(out_port)
    .bind(&body.remote_addr)
    .bind(&body.strategy)
    .bind(&body.listen_ip)
    .bind(&body.interface_name)
    .bind(max_order.unwrap_or(0) + 1)
    .bind(FORWARD_STATUS_ACTIVE)
    .bind(now)
    .bind(now)
    .execute(&state.pool)
    .await?;

    let id = result.last_insert_id() as i64;
    let forward = load_forward(&state, id).await?;

    let limiter = user_tunnel.as_ref().and_then(|ut| ut.speed_id);
    match programmer::create_forward(&state.bus, &forward, &tunnel, &in_node, out_node.as_ref(), limiter).await {
        Ok(already_existed) => {
            if already_existed {
                let _ = programmer::reassert_forward_target(&state.bus, &forward, &tunnel, &in_node, out_node.as_ref()).await;
            }
        }
        Err(msg) => {
            sqlx::query("UPDATE forwards SET status = ? WHERE id = ?")
                .bind(crate::domain::FORWARD_STATUS_ERROR)
                .bind(id)
                .execute(&state.pool)
                .await
                .ok();
            return Err(ApiError::validation(format!("转发创建失败: {msg}")));
        }
    }

    Ok(R::ok(forward))
}

/// `POST /api/v1/forward/list`: the caller's own forwards, or every forward
/// for an admin.
pub async fn list(State(state): State<AppState>, Extension(auth): Extension<AuthUser>) -> ApiResult {
    let forwards: Vec<Forward> = if auth.is_admin() {
        sqlx::query_as("SELECT * FROM forwards ORDER BY order_index ASC, created_time DESC").fetch_all(&state.pool).await?
    } else {
        sqlx::query_as("SELECT * FROM forwards WHERE user_id = ? ORDER BY order_index ASC, created_time DESC")
            .bind(auth.user_id)
            .fetch_all(&state.pool)
            .await?
    };
    Ok(R::ok(forwards))
}

#[derive(Debug, Deserialize)]
pub struct UpdateForwardRequest {
    id: i64,
    #[serde(default)]
    name: String,
    #[serde(rename = "inPort")]
    in_port: Option<i32>,
    #[serde(rename = "remoteAddr")]
    remote_addr: Option<String>,
    strategy: Option<String>,
    #[serde(rename = "listenIp")]
    listen_ip: Option<String>,
    #[serde(rename = "interfaceName")]
    interface_name: Option<String>,
}

/// `POST /api/v1/forward/update`. Classifies the diff via
/// [`programmer::classify_update`] and applies the cheapest safe node-side
/// path (§4.2).
pub async fn update(State(state): State<AppState>, Extension(auth): Extension<AuthUser>, Json(body): Json<UpdateForwardRequest>) -> ApiResult {
    let existing = load_forward(&state, body.id).await?;
    if !auth.is_admin() && !support::owns_forward(&existing, auth.user_id) {
        return Err(ApiError::not_found("转发不存在"));
    }

    let tunnel = load_tunnel(&state, existing.tunnel_id).await?;
    let in_node = load_node(&state, tunnel.in_node_id).await?;
    let out_node = if tunnel.is_relay() { Some(load_node(&state, tunnel.out_node_id).await?) } else { None };

    let mut updated = existing.clone();
    if !body.name.is_empty() {
        updated.name = body.name.clone();
    }
    if let Some(remote_addr) = &body.remote_addr {
        if !auth.is_admin() {
            support::validate_remote_addr(remote_addr, false).await?;
        }
        updated.remote_addr = remote_addr.clone();
    }
    if let Some(strategy) = &body.strategy {
        updated.strategy = strategy.clone();
    }
    if let Some(listen_ip) = &body.listen_ip {
        updated.listen_ip = listen_ip.clone();
    }
    if let Some(interface_name) = &body.interface_name {
        updated.interface_name = interface_name.clone();
    }
    if let Some(port) = body.in_port {
        support::validate_port_range(port, in_node.port_sta, in_node.port_end)?;
        if port != existing.in_port && support::port_in_use(&state.pool, in_node.id, port, true, Some(existing.id)).await {
            return Err(ApiError::validation("该端口已被占用"));
        }
        updated.in_port = port;
    }
    updated.updated_time = Utc::now().timestamp_millis();

    let user_tunnel = if existing.user_tunnel_id != 0 {
        sqlx::query_as::<_, UserTunnel>("SELECT * FROM user_tunnels WHERE id = ?")
            .bind(existing.user_tunnel_id)
            .fetch_optional(&state.pool)
            .await?
    } else {
        None
    };
    let limiter = user_tunnel.as_ref().and_then(|ut| ut.speed_id);

    let plan = programmer::classify_update(&existing, &updated, false);
    if plan != UpdatePlan::Noop {
        programmer::apply_update(&state.bus, plan, &existing, &updated, &tunnel, &in_node, out_node.as_ref(), limiter)
            .await
            .map_err(|msg| ApiError::validation(format!("转发更新失败: {msg}")))?;
    }

    sqlx::query(
        "UPDATE forwards SET name = ?, in_port = ?, remote_addr = ?, strategy = ?, listen_ip = ?, interface_name = ?, updated_time = ? WHERE id = ?",
    )
    .bind(&updated.name)
    .bind(updated.in_port)
    .bind(&updated.remote_addr)
    .bind(&updated.strategy)
    .bind(&updated.listen_ip)
    .bind(&updated.interface_name)
    .bind(updated.updated_time)
    .bind(existing.id)
    .execute(&state.pool)
    .await?;

    Ok(R::ok_msg("转发更新成功"))
}

async fn teardown(state: &AppState, forward: &Forward) -> Result<(), ApiError> {
    let tunnel = load_tunnel(state, forward.tunnel_id).await?;
    let in_node = load_node(state, tunnel.in_node_id).await?;
    let out_node = if tunnel.is_relay() { Some(load_node(state, tunnel.out_node_id).await?) } else { None };
    programmer::delete_forward(&state.bus, forward, &tunnel, &in_node, out_node.as_ref())
        .await
        .map_err(|msg| ApiError::validation(format!("转发删除失败: {msg}")))
}

#[derive(Debug, Deserialize)]
pub struct IdRequest {
    id: i64,
}

/// `POST /api/v1/forward/delete`: non-admin owner or admin only.
pub async fn delete(State(state): State<AppState>, Extension(auth): Extension<AuthUser>, Json(body): Json<IdRequest>) -> ApiResult {
    let forward = load_forward(&state, body.id).await?;
    if !auth.is_admin() && !support::owns_forward(&forward, auth.user_id) {
        return Err(ApiError::not_found("转发不存在"));
    }
    teardown(&state, &forward).await?;
    sqlx::query("DELETE FROM forwards WHERE id = ?").bind(body.id).execute(&state.pool).await?;
    Ok(R::ok_msg("转发删除成功"))
}

/// `POST /api/v1/forward/force-delete` (admin): removes the DB row even if
/// the node-side teardown fails, matching §9's "deletes after successful
/// node mutation are best-effort" transaction discipline.
pub async fn force_delete(State(state): State<AppState>, Json(body): Json<IdRequest>) -> ApiResult {
    let forward = load_forward(&state, body.id).await?;
    let _ = teardown(&state, &forward).await;
    sqlx::query("DELETE FROM forwards WHERE id = ?").bind(body.id).execute(&state.pool).await?;
    Ok(R::ok_msg("转发已强制删除"))
}

/// `POST /api/v1/forward/pause`.
pub async fn pause(State(state): State<AppState>, Extension(auth): Extension<AuthUser>, Json(body): Json<IdRequest>) -> ApiResult {
    let forward = load_forward(&state, body.id).await?;
    if !auth.is_admin() && !support::owns_forward(&forward, auth.user_id) {
        return Err(ApiError::not_found("转发不存在"));
    }
    let tunnel = load_tunnel(&state, forward.tunnel_id).await?;
    let name = naming::service_base_name(forward.id, forward.user_id, forward.user_tunnel_id);

    for svc_base in programmer::forward_service_base_names(&forward, &tunnel) {
        let _ = gost::pause_service(&state.bus, tunnel.in_node_id, &svc_base).await;
    }
    if tunnel.is_relay() {
        let _ = gost::pause_remote_service(&state.bus, tunnel.out_node_id, &name).await;
    }

    sqlx::query("UPDATE forwards SET status = ?, updated_time = ? WHERE id = ?")
        .bind(FORWARD_STATUS_PAUSED)
        .bind(Utc::now().timestamp_millis())
        .bind(body.id)
        .execute(&state.pool)
        .await?;
    Ok(R::ok_msg("转发已暂停"))
}

/// `POST /api/v1/forward/resume`.
pub async fn resume(State(state): State<AppState>, Extension(auth): Extension<AuthUser>, Json(body): Json<IdRequest>) -> ApiResult {
    let forward = load_forward(&state, body.id).await?;
    if !auth.is_admin() && !support::owns_forward(&forward, auth.user_id) {
        return Err(ApiError::not_found("转发不存在"));
    }
    let tunnel = load_tunnel(&state, forward.tunnel_id).await?;
    let name = naming::service_base_name(forward.id, forward.user_id, forward.user_tunnel_id);

    for svc_base in programmer::forward_service_base_names(&forward, &tunnel) {
        let _ = gost::resume_service(&state.bus, tunnel.in_node_id, &svc_base).await;
    }
    if tunnel.is_relay() {
        let _ = gost::resume_remote_service(&state.bus, tunnel.out_node_id, &name).await;
    }

    sqlx::query("UPDATE forwards SET status = ?, updated_time = ? WHERE id = ?")
        .bind(FORWARD_STATUS_ACTIVE)
        .bind(Utc::now().timestamp_millis())
        .bind(body.id)
        .execute(&state.pool)
        .await?;
    Ok(R::ok_msg("转发已恢复"))
}

/// `POST /api/v1/forward/diagnose`: TCP-pings every remote target from the
/// in-node.
pub async fn diagnose(State(state): State<AppState>, Extension(auth): Extension<AuthUser>, Json(body): Json<IdRequest>) -> ApiResult {
    let forward = load_forward(&state, body.id).await?;
    if !auth.is_admin() && !support::owns_forward(&forward, auth.user_id) {
        return Err(ApiError::not_found("转发不存在"));
    }
    let tunnel = load_tunnel(&state, forward.tunnel_id).await?;

    let mut results = Vec::new();
    for target in forward.remote_targets() {
        let Some((host, port)) = target.rsplit_once(':') else { continue };
        let resp = state
            .bus
            .send_msg(tunnel.in_node_id, "TcpPing", serde_json::json!({"ip": host, "port": port.parse::<i32>().unwrap_or(0), "count": 2, "timeout": 3000}))
            .await;
        results.push(serde_json::json!({"target": target, "message": resp.message, "data": resp.data}));
    }
    Ok(R::ok(results))
}

#[derive(Debug, Deserialize)]
pub struct UpdateOrderRequest {
    #[serde(rename = "orderedIds")]
    ordered_ids: Vec<i64>,
}

/// `POST /api/v1/forward/update-order`: persists the caller's preferred
/// display order; purely a panel-side concern, no node-side effect.
pub async fn update_order(State(state): State<AppState>, Extension(auth): Extension<AuthUser>, Json(body): Json<UpdateOrderRequest>) -> ApiResult {
    for (index, id) in body.ordered_ids.iter().enumerate() {
        if auth.is_admin() {
            sqlx::query("UPDATE forwards SET order_index = ? WHERE id = ?")
                .bind(index as i32)
                .bind(id)
                .execute(&state.pool)
                .await?;
        } else {
            sqlx::query("UPDATE forwards SET order_index = ? WHERE id = ? AND user_id = ?")
                .bind(index as i32)
                .bind(id)
                .bind(auth.user_id)
                .execute(&state.pool)
                .await?;
        }
    }
    Ok(R::ok_msg("排序已更新"))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The frontend sends camelCase bodies; a rename typo here is invisible
    /// to the compiler and only shows up as a silently-defaulted field.
    #[test]
    fn create_request_accepts_camel_case_fields() {
        let body: CreateForwardRequest = serde_json::from_str(
            r#"{"name":"web","tunnelId":7,"inPort":8080,"remoteAddr":"10.0.0.1:80","listenIp":"0.0.0.0","interfaceName":"eth0"}"#,
        )
        .unwrap();
        assert_eq!(body.tunnel_id, 7);
        assert_eq!(body.in_port, Some(8080));
        assert_eq!(body.remote_addr, "10.0.0.1:80");
        assert_eq!(body.listen_ip, "0.0.0.0");
        assert_eq!(body.interface_name, "eth0");
    }

    #[test]
    fn update_request_leaves_unset_fields_none() {
        let body: UpdateForwardRequest = serde_json::from_str(r#"{"id":3}"#).unwrap();
        assert_eq!(body.id, 3);
        assert!(body.name.is_empty());
        assert!(body.in_port.is_none());
        assert!(body.remote_addr.is_none());
    }

    #[test]
    fn update_order_request_maps_ordered_ids() {
        let body: UpdateOrderRequest = serde_json::from_str(r#"{"orderedIds":[3,1,2]}"#).unwrap();
        assert_eq!(body.ordered_ids, vec![3, 1, 2]);
    }
}
