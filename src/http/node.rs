//! Node CRUD and install-command generation (§6 `node/*`). Grounded in
//! `original_source/go-backend/handler/node.go` and `service/node.go`.

use axum::extract::State;
use axum::{Extension, Json};
use chrono::Utc;
use serde::Deserialize;

use crate::auth::AuthUser;
use crate::crypto::generate_node_secret;
use crate::domain::Node;
use crate::error::{ApiError, ApiResult, R};
use crate::http::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateNodeRequest {
    name: String,
    #[serde(default)]
    ip: String,
    #[serde(rename = "portSta")]
    port_sta: i32,
    #[serde(rename = "portEnd")]
    port_end: i32,
}

/// `POST /api/v1/node/create` (admin).
pub async fn create(State(state): State<AppState>, Json(body): Json<CreateNodeRequest>) -> ApiResult {
    if body.port_sta >= body.port_end {
        return Err(ApiError::validation("起始端口必须小于结束端口"));
    }
    let now = Utc::now().timestamp_millis();
    let secret = generate_node_secret();

    let result = sqlx::query(
        "INSERT INTO nodes (name, ip, secret, port_sta, port_end, version, engine_version, engine_status, status, created_time, updated_time) \
         VALUES (?, ?, ?, ?, ?, '', '', 0, 0, ?, ?)",
    )
    .bind(&body.name)
    .bind(&body.ip)
    .bind(&secret)
    .bind(body.port_sta)
    .bind(body.port_end)
    .bind(now)
    .bind(now)
    .execute(&state.pool)
    .await?;

    let node: Node = sqlx::query_as("SELECT * FROM nodes WHERE id = ?")
        .bind(result.last_insert_id() as i64)
        .fetch_one(&state.pool)
        .await?;
    Ok(R::ok(node))
}

/// `POST /api/v1/node/list` (admin). Online status is overlaid from the
/// node session bus rather than trusted from the stored `status` column.
pub async fn list(State(state): State<AppState>) -> ApiResult {
    let nodes: Vec<Node> = sqlx::query_as("SELECT * FROM nodes ORDER BY created_time DESC")
        .fetch_all(&state.pool)
        .await?;
    let out: Vec<serde_json::Value> = nodes
        .into_iter()
        .map(|n| {
            let status = if state.bus.is_online(n.id) { 1 } else { n.status };
            serde_json::json!({
                "id": n.id, "name": n.name, "ip": n.ip, "portSta": n.port_sta, "portEnd": n.port_end,
                "secret": n.secret, "version": n.version, "engineVersion": n.engine_version,
                "engineStatus": n.engine_status, "status": status,
                "createdTime": n.created_time, "updatedTime": n.updated_time,
            })
        })
        .collect();
    Ok(R::ok(out))
}

/// `POST /api/v1/node/accessible`: node list scoped to the caller's
/// `user_nodes` grants; an empty grant set for a user means legacy
/// access-all (§3 UserNode invariant).
pub async fn accessible(State(state): State<AppState>, Extension(auth): Extension<AuthUser>) -> ApiResult {
    let nodes: Vec<Node> = if auth.is_admin() {
        sqlx::query_as("SELECT * FROM nodes ORDER BY created_time DESC").fetch_all(&state.pool).await?
    } else {
        let grant_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM user_nodes WHERE user_id = ?")
            .bind(auth.user_id)
            .fetch_one(&state.pool)
            .await?;
        if grant_count == 0 {
            sqlx::query_as("SELECT * FROM nodes ORDER BY created_time DESC").fetch_all(&state.pool).await?
        } else {
            sqlx::query_as(
                "SELECT * FROM nodes WHERE id IN (SELECT node_id FROM user_nodes WHERE user_id = ?) ORDER BY created_time DESC",
            )
            .bind(auth.user_id)
            .fetch_all(&state.pool)
            .await?
        }
    };
    let out: Vec<serde_json::Value> = nodes
        .into_iter()
        .map(|n| {
            let status = if state.bus.is_online(n.id) { 1 } else { n.status };
            serde_json::json!({"id": n.id, "name": n.name, "status": status})
        })
        .collect();
    Ok(R::ok(out))
}

#[derive(Debug, Deserialize)]
pub struct UpdateNodeRequest {
    id: i64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    ip: String,
    #[serde(rename = "portSta")]
    port_sta: Option<i32>,
    #[serde(rename = "portEnd")]
    port_end: Option<i32>,
}

/// `POST /api/v1/node/update` (admin). Changing `ip` re-syncs every
/// tunnel's `in_ip`/`out_ip` that references this node (§3 Tunnel invariant).
pub async fn update(State(state): State<AppState>, Json(body): Json<UpdateNodeRequest>) -> ApiResult {
    let Some(node) = sqlx::query_as::<_, Node>("SELECT * FROM nodes WHERE id = ?")
        .bind(body.id)
        .fetch_optional(&state.pool)
        .await?
    else {
        return Err(ApiError::not_found("节点不存在"));
    };

    let name = if body.name.is_empty() { node.name.clone() } else { body.name.clone() };
    let ip = if body.ip.is_empty() { node.ip.clone() } else { body.ip.clone() };
    let port_sta = body.port_sta.unwrap_or(node.port_sta);
    let port_end = body.port_end.unwrap_or(node.port_end);

    sqlx::query("UPDATE nodes SET name = ?, ip = ?, port_sta = ?, port_end = ?, updated_time = ? WHERE id = ?")
        .bind(&name)
        .bind(&ip)
        .bind(port_sta)
        .bind(port_end)
        .bind(Utc::now().timestamp_millis())
        .bind(body.id)
        .execute(&state.pool)
        .await?;

    if ip != node.ip {
        sqlx::query("UPDATE tunnels SET in_ip = ? WHERE in_node_id = ?").bind(&ip).bind(body.id).execute(&state.pool).await?;
        sqlx::query("UPDATE tunnels SET out_ip = ? WHERE out_node_id = ?").bind(&ip).bind(body.id).execute(&state.pool).await?;
    }

    Ok(R::ok_msg("节点更新成功"))
}

#[derive(Debug, Deserialize)]
pub struct IdRequest {
    id: i64,
}

/// `POST /api/v1/node/delete` (admin). Refused while any tunnel references
/// the node as either endpoint.
pub async fn delete(State(state): State<AppState>, Json(body): Json<IdRequest>) -> ApiResult {
    sqlx::query_as::<_, Node>("SELECT * FROM nodes WHERE id = ?")
        .bind(body.id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| ApiError::not_found("节点不存在"))?;

    let in_use: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tunnels WHERE in_node_id = ? OR out_node_id = ?")
        .bind(body.id)
        .bind(body.id)
        .fetch_one(&state.pool)
        .await?;
    if in_use > 0 {
        return Err(ApiError::validation("该节点正在被隧道使用，无法删除"));
    }

    sqlx::query("DELETE FROM nodes WHERE id = ?").bind(body.id).execute(&state.pool).await?;
    Ok(R::ok_msg("节点删除成功"))
}

fn panel_address(config: &crate::config::Config, client_addr: Option<&str>) -> String {
    if let Some(addr) = client_addr.filter(|s| !s.is_empty()) {
        return addr.to_string();
    }
    format!("http://127.0.0.1:{}", config.server_port)
}

#[derive(Debug, Deserialize)]
pub struct InstallRequest {
    id: i64,
    #[serde(default, rename = "panelAddr")]
    panel_addr: String,
}

/// `POST /api/v1/node/install` (admin): a one-line curl|bash command for a
/// systemd-managed native install.
pub async fn install(State(state): State<AppState>, Json(body): Json<InstallRequest>) -> ApiResult {
    let node = sqlx::query_as::<_, Node>("SELECT * FROM nodes WHERE id = ?")
        .bind(body.id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| ApiError::not_found("节点不存在"))?;
    let addr = panel_address(&state.config, Some(&body.panel_addr));
    let cmd = format!("curl -fsSL {addr}/node-install/script | bash -s -- {} {} {addr}", node.id, node.secret);
    Ok(R::ok(cmd))
}

/// `POST /api/v1/node/install/docker` (admin): an equivalent docker-run
/// one-liner for containerised deployments.
pub async fn install_docker(State(state): State<AppState>, Json(body): Json<InstallRequest>) -> ApiResult {
    let node = sqlx::query_as::<_, Node>("SELECT * FROM nodes WHERE id = ?")
        .bind(body.id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| ApiError::not_found("节点不存在"))?;
    let addr = panel_address(&state.config, Some(&body.panel_addr));
    let cmd = format!(
        "mkdir -p ~/.flux && docker run -d --name gost-node --restart unless-stopped --network host -v ~/.flux:/etc/gost -e PANEL_ADDR={addr} -e SECRET={} 0xnetuser/gost-node:latest",
        node.secret
    );
    Ok(R::ok(cmd))
}

/// `POST /api/v1/node/reconcile` (admin): on-demand re-sync, same path the
/// on-connect hook triggers automatically.
pub async fn reconcile(State(state): State<AppState>, Json(body): Json<IdRequest>) -> ApiResult {
    let result = state.reconcile.reconcile_node(body.id).await;
    Ok(R::ok(result))
}
