//! Tunnel CRUD and user-tunnel (quota/permission) management (§6
//! `tunnel/*`). Grounded in `original_source/go-backend/handler/tunnel.go`,
//! `service/tunnel.go` and `service/user_tunnel.go`.

use axum::extract::State;
use axum::{Extension, Json};
use chrono::Utc;
use serde::Deserialize;

use crate::auth::AuthUser;
use crate::domain::{TUNNEL_TYPE_RELAY, Tunnel};
use crate::error::{ApiError, ApiResult, R};
use crate::http::AppState;
use crate::programmer::gost;

#[derive(Debug, Deserialize)]
pub struct CreateTunnelRequest {
    name: String,
    #[serde(rename = "inNodeId")]
    in_node_id: i64,
    #[serde(rename = "outNodeId")]
    out_node_id: Option<i64>,
    #[serde(rename = "type")]
    type_: i32,
    #[serde(default)]
    flow: i32,
    #[serde(rename = "trafficRatio")]
    traffic_ratio: Option<f64>,
    #[serde(default)]
    protocol: String,
    #[serde(default, rename = "tcpListenAddr")]
    tcp_listen_addr: String,
    #[serde(default, rename = "udpListenAddr")]
    udp_listen_addr: String,
}

/// `POST /api/v1/tunnel/create` (admin).
pub async fn create(State(state): State<AppState>, Json(body): Json<CreateTunnelRequest>) -> ApiResult {
    let dup: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tunnels WHERE name = ?")
        .bind(&body.name)
        .fetch_one(&state.pool)
        .await?;
    if dup > 0 {
        return Err(ApiError::validation("隧道名称已存在"));
    }

    let in_node = sqlx::query_as::<_, crate::domain::Node>("SELECT * FROM nodes WHERE id = ?")
        .bind(body.in_node_id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| ApiError::validation("入口节点不存在"))?;

    let (out_node_id, out_ip) = if body.type_ == TUNNEL_TYPE_RELAY {
        let out_node_id = body.out_node_id.ok_or_else(|| ApiError::validation("中转隧道必须指定出口节点"))?;
        let out_node = sqlx::query_as::<_, crate::domain::Node>("SELECT * FROM nodes WHERE id = ?")
            .bind(out_node_id)
            .fetch_optional(&state.pool)
            .await?
            .ok_or_else(|| ApiError::validation("出口节点不存在"))?;
        (out_node_id, out_node.ip)
    } else {
        (body.in_node_id, in_node.ip.clone())
    };

    let traffic_ratio = body.traffic_ratio.unwrap_or(1.0);
    let protocol = if body.protocol.is_empty() { "tls".to_string() } else { body.protocol };
    let tcp_listen_addr = if body.tcp_listen_addr.is_empty() { "0.0.0.0".to_string() } else { body.tcp_listen_addr };
    let udp_listen_addr = if body.udp_listen_addr.is_empty() { "0.0.0.0".to_string() } else { body.udp_listen_addr };
    let now = Utc::now().timestamp_millis();

    let result = sqlx::query(
        "INSERT INTO tunnels (name, type, in_node_id, out_node_id, in_ip, out_ip, protocol, tcp_listen_addr, udp_listen_addr, traffic_ratio, flow, status, created_time, updated_time) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)",
    )
    .bind(&body.name)
    .bind(body.type_)
    .bind(body.in_node_id)
    .bind(out_node_id)
    .bind(&in_node.ip)
    .bind(&out_ip)
    .bind(&protocol)
    .bind(&tcp_listen_addr)
    .bind(&udp_listen_addr)
    .bind(traffic_ratio)
    .bind(body.flow)
    .bind(now)
    .bind(now)
    .execute(&state.pool)
    .await?;

    let tunnel: Tunnel = sqlx::query_as("SELECT * FROM tunnels WHERE id = ?")
        .bind(result.last_insert_id() as i64)
        .fetch_one(&state.pool)
        .await?;
    Ok(R::ok(tunnel))
}

/// `POST /api/v1/tunnel/list` (admin).
pub async fn list(State(state): State<AppState>) -> ApiResult {
    let tunnels: Vec<Tunnel> = sqlx::query_as("SELECT * FROM tunnels ORDER BY created_time DESC").fetch_all(&state.pool).await?;
    Ok(R::ok(tunnels))
}

#[derive(Debug, Deserialize)]
pub struct UpdateTunnelRequest {
    id: i64,
    name: String,
    #[serde(default)]
    flow: i32,
    #[serde(rename = "trafficRatio")]
    traffic_ratio: Option<f64>,
    #[serde(default)]
    protocol: String,
    #[serde(default, rename = "tcpListenAddr")]
    tcp_listen_addr: String,
    #[serde(default, rename = "udpListenAddr")]
    udp_listen_addr: String,
}

/// `POST /api/v1/tunnel/update` (admin).
pub async fn update(State(state): State<AppState>, Json(body): Json<UpdateTunnelRequest>) -> ApiResult {
    let existing = sqlx::query_as::<_, Tunnel>("SELECT * FROM tunnels WHERE id = ?")
        .bind(body.id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| ApiError::not_found("隧道不存在"))?;

    let dup: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tunnels WHERE name = ? AND id != ?")
        .bind(&body.name)
        .bind(body.id)
        .fetch_one(&state.pool)
        .await?;
    if dup > 0 {
        return Err(ApiError::validation("隧道名称已存在"));
    }

    let traffic_ratio = body.traffic_ratio.unwrap_or(existing.traffic_ratio);

    sqlx::query(
        "UPDATE tunnels SET name = ?, flow = ?, protocol = ?, tcp_listen_addr = ?, udp_listen_addr = ?, traffic_ratio = ?, updated_time = ? WHERE id = ?",
    )
    .bind(&body.name)
    .bind(body.flow)
    .bind(&body.protocol)
    .bind(&body.tcp_listen_addr)
    .bind(&body.udp_listen_addr)
    .bind(traffic_ratio)
    .bind(Utc::now().timestamp_millis())
    .bind(body.id)
    .execute(&state.pool)
    .await?;

    Ok(R::ok_msg("隧道更新成功"))
}

#[derive(Debug, Deserialize)]
pub struct IdRequest {
    id: i64,
}

/// `POST /api/v1/tunnel/delete` (admin). Refused while any forward
/// references the tunnel; user-tunnel rows cascade.
pub async fn delete(State(state): State<AppState>, Json(body): Json<IdRequest>) -> ApiResult {
    sqlx::query_as::<_, Tunnel>("SELECT * FROM tunnels WHERE id = ?")
        .bind(body.id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| ApiError::not_found("隧道不存在"))?;

    let fwd_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM forwards WHERE tunnel_id = ?")
        .bind(body.id)
        .fetch_one(&state.pool)
        .await?;
    if fwd_count > 0 {
        return Err(ApiError::validation("该隧道下还有转发规则，请先删除转发"));
    }

    sqlx::query("DELETE FROM user_tunnels WHERE tunnel_id = ?").bind(body.id).execute(&state.pool).await?;
    sqlx::query("DELETE FROM tunnels WHERE id = ?").bind(body.id).execute(&state.pool).await?;
    Ok(R::ok_msg("隧道删除成功"))
}

#[derive(Debug, Deserialize)]
pub struct AssignUserTunnelRequest {
    #[serde(rename = "userId")]
    user_id: i64,
    #[serde(rename = "tunnelId")]
    tunnel_id: i64,
    #[serde(default)]
    num: i64,
    #[serde(default)]
    flow: i64,
    #[serde(default, rename = "expTime")]
    exp_time: i64,
    #[serde(rename = "speedId")]
    speed_id: Option<i64>,
}

/// `POST /api/v1/tunnel/user/assign` (admin): grants a user permission
/// (and quota) on a tunnel, seeding any configured speed limiter on the
/// in-node up front (§4.3 phase 1 relies on this row existing).
pub async fn user_assign(State(state): State<AppState>, Json(body): Json<AssignUserTunnelRequest>) -> ApiResult {
    sqlx::query_as::<_, crate::domain::User>("SELECT * FROM users WHERE id = ?")
        .bind(body.user_id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| ApiError::validation("用户不存在"))?;
    let tunnel = sqlx::query_as::<_, Tunnel>("SELECT * FROM tunnels WHERE id = ?")
        .bind(body.tunnel_id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| ApiError::validation("隧道不存在"))?;

    let dup: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM user_tunnels WHERE user_id = ? AND tunnel_id = ?")
        .bind(body.user_id)
        .bind(body.tunnel_id)
        .fetch_one(&state.pool)
        .await?;
    if dup > 0 {
        return Err(ApiError::validation("该用户已有此隧道权限"));
    }

    let result = sqlx::query(
        "INSERT INTO user_tunnels (user_id, tunnel_id, flow, in_flow, out_flow, num, exp_time, speed_id, status, created_time, updated_time) \
         VALUES (?, ?, ?, 0, 0, ?, ?, ?, 1, ?, ?)",
    )
    .bind(body.user_id)
    .bind(body.tunnel_id)
    .bind(body.flow)
    .bind(body.num)
    .bind(body.exp_time)
    .bind(body.speed_id)
    .bind(Utc::now().timestamp_millis())
    .bind(Utc::now().timestamp_millis())
    .execute(&state.pool)
    .await?;

    if let Some(speed_id) = body.speed_id.filter(|id| *id > 0) {
        if let Some(speed_limit) = sqlx::query_as::<_, crate::domain::SpeedLimit>("SELECT * FROM speed_limits WHERE id = ?")
            .bind(speed_id)
            .fetch_optional(&state.pool)
            .await?
        {
            gost::add_limiter(&state.bus, tunnel.in_node_id, speed_id, speed_limit.speed).await;
        }
    }

    let ut: crate::domain::UserTunnel = sqlx::query_as("SELECT * FROM user_tunnels WHERE id = ?")
        .bind(result.last_insert_id() as i64)
        .fetch_one(&state.pool)
        .await?;
    Ok(R::ok(ut))
}

#[derive(Debug, Deserialize)]
pub struct UserTunnelListQuery {
    #[serde(rename = "tunnelId")]
    tunnel_id: Option<i64>,
    #[serde(rename = "userId")]
    user_id: Option<i64>,
}

/// `POST /api/v1/tunnel/user/list` (admin), optionally filtered.
pub async fn user_list(State(state): State<AppState>, Json(body): Json<UserTunnelListQuery>) -> ApiResult {
    let mut sql = "SELECT ut.*, t.name as tunnel_name, u.user as user_name, sl.name as speed_name \
         FROM user_tunnels ut LEFT JOIN tunnels t ON ut.tunnel_id = t.id \
         LEFT JOIN users u ON ut.user_id = u.id LEFT JOIN speed_limits sl ON ut.speed_id = sl.id WHERE 1=1"
        .to_string();
    if body.tunnel_id.is_some() {
        sql.push_str(" AND ut.tunnel_id = ?");
    }
    if body.user_id.is_some() {
        sql.push_str(" AND ut.user_id = ?");
    }
    let mut query = sqlx::query(&sql);
    if let Some(id) = body.tunnel_id {
        query = query.bind(id);
    }
    if let Some(id) = body.user_id {
        query = query.bind(id);
    }
    let rows = query.fetch_all(&state.pool).await?;
    use sqlx::Row;
    let out: Vec<serde_json::Value> = rows
        .iter()
        .map(|row| {
            serde_json::json!({
                "id": row.get::<i64, _>("id"),
                "userId": row.get::<i64, _>("user_id"),
                "tunnelId": row.get::<i64, _>("tunnel_id"),
                "tunnelName": row.try_get::<String, _>("tunnel_name").unwrap_or_default(),
                "userName": row.try_get::<String, _>("user_name").unwrap_or_default(),
                "speedName": row.try_get::<String, _>("speed_name").unwrap_or_default(),
                "flow": row.get::<i64, _>("flow"),
                "inFlow": row.get::<i64, _>("in_flow"),
                "outFlow": row.get::<i64, _>("out_flow"),
                "num": row.get::<i64, _>("num"),
                "expTime": row.get::<i64, _>("exp_time"),
                "status": row.get::<i32, _>("status"),
            })
        })
        .collect();
    Ok(R::ok(out))
}

async fn teardown_forward(state: &AppState, forward: &crate::domain::Forward, tunnel: &Tunnel) {
    let Ok(Some(in_node)) = sqlx::query_as::<_, crate::domain::Node>("SELECT * FROM nodes WHERE id = ?")
        .bind(tunnel.in_node_id)
        .fetch_optional(&state.pool)
        .await
    else {
        return;
    };
    let out_node: Option<crate::domain::Node> = if tunnel.is_relay() {
        sqlx::query_as("SELECT * FROM nodes WHERE id = ?").bind(tunnel.out_node_id).fetch_optional(&state.pool).await.ok().flatten()
    } else {
        None
    };
    let _ = crate::programmer::delete_forward(&state.bus, forward, tunnel, &in_node, out_node.as_ref()).await;
}

/// `POST /api/v1/tunnel/user/remove` (admin): revokes a user's permission
/// on a tunnel and tears down every forward they had on it.
pub async fn user_remove(State(state): State<AppState>, Json(body): Json<IdRequest>) -> ApiResult {
    let ut = sqlx::query_as::<_, crate::domain::UserTunnel>("SELECT * FROM user_tunnels WHERE id = ?")
        .bind(body.id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| ApiError::not_found("隧道权限不存在"))?;

    let forwards: Vec<crate::domain::Forward> = sqlx::query_as("SELECT * FROM forwards WHERE user_id = ? AND tunnel_id = ?")
        .bind(ut.user_id)
        .bind(ut.tunnel_id)
        .fetch_all(&state.pool)
        .await?;
    if let Some(tunnel) = sqlx::query_as::<_, Tunnel>("SELECT * FROM tunnels WHERE id = ?").bind(ut.tunnel_id).fetch_optional(&state.pool).await? {
        for forward in &forwards {
            teardown_forward(&state, forward, &tunnel).await;
            sqlx::query("DELETE FROM forwards WHERE id = ?").bind(forward.id).execute(&state.pool).await.ok();
        }
    }

    sqlx::query("DELETE FROM user_tunnels WHERE id = ?").bind(body.id).execute(&state.pool).await?;
    Ok(R::ok_msg("隧道权限删除成功"))
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserTunnelRequest {
    id: i64,
    num: Option<i64>,
    flow: Option<i64>,
    #[serde(rename = "expTime")]
    exp_time: Option<i64>,
    #[serde(rename = "speedId")]
    speed_id: Option<i64>,
    status: Option<i32>,
}

/// `POST /api/v1/tunnel/user/update` (admin). A changed `speedId`
/// re-programs the limiter and rebuilds every affected forward's service
/// so the new rate takes effect (limiter changes require a rebuild — the
/// running service holds the old limiter object by reference).
pub async fn user_update(State(state): State<AppState>, Json(body): Json<UpdateUserTunnelRequest>) -> ApiResult {
    let mut ut = sqlx::query_as::<_, crate::domain::UserTunnel>("SELECT * FROM user_tunnels WHERE id = ?")
        .bind(body.id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| ApiError::not_found("隧道权限不存在"))?;

    let num = body.num.unwrap_or(ut.num);
    let flow = body.flow.unwrap_or(ut.flow);
    let exp_time = body.exp_time.unwrap_or(ut.exp_time);
    let status = body.status.unwrap_or(ut.status);
    let speed_id = body.speed_id.or(ut.speed_id);

    sqlx::query("UPDATE user_tunnels SET num = ?, flow = ?, exp_time = ?, status = ?, speed_id = ?, updated_time = ? WHERE id = ?")
        .bind(num)
        .bind(flow)
        .bind(exp_time)
        .bind(status)
        .bind(speed_id)
        .bind(Utc::now().timestamp_millis())
        .bind(body.id)
        .execute(&state.pool)
        .await?;

    let speed_changed = body.speed_id.is_some() && body.speed_id != ut.speed_id;
    if speed_changed {
        ut.speed_id = body.speed_id;
        if let Some(tunnel) = sqlx::query_as::<_, Tunnel>("SELECT * FROM tunnels WHERE id = ?").bind(ut.tunnel_id).fetch_optional(&state.pool).await? {
            if let Some(speed_id) = body.speed_id.filter(|id| *id > 0) {
                if let Some(speed_limit) = sqlx::query_as::<_, crate::domain::SpeedLimit>("SELECT * FROM speed_limits WHERE id = ?")
                    .bind(speed_id)
                    .fetch_optional(&state.pool)
                    .await?
                {
                    gost::add_limiter(&state.bus, tunnel.in_node_id, speed_id, speed_limit.speed).await;
                }
            }
            let forwards: Vec<crate::domain::Forward> = sqlx::query_as("SELECT * FROM forwards WHERE user_id = ? AND tunnel_id = ?")
                .bind(ut.user_id)
                .bind(ut.tunnel_id)
                .fetch_all(&state.pool)
                .await?;
            for forward in &forwards {
                if let Some(in_node) = sqlx::query_as::<_, crate::domain::Node>("SELECT * FROM nodes WHERE id = ?").bind(tunnel.in_node_id).fetch_optional(&state.pool).await? {
                    let params = crate::programmer::gost::ServiceParams {
                        base_name: crate::domain::naming::service_base_name(forward.id, forward.user_id, ut.id),
                        in_port: forward.in_port,
                        limiter: ut.speed_id,
                        remote_addr: &forward.remote_addr,
                        is_relay: tunnel.is_relay(),
                        tcp_listen_addr: &tunnel.tcp_listen_addr,
                        udp_listen_addr: &tunnel.udp_listen_addr,
                        strategy: &forward.strategy,
                        interface_name: &forward.interface_name,
                    };
                    gost::update_service(&state.bus, in_node.id, &params).await;
                }
            }
        }
    }

    Ok(R::ok_msg("更新成功"))
}

/// `POST /api/v1/tunnel/user/tunnel`: a user's own accessible-tunnel list.
pub async fn user_tunnel(State(state): State<AppState>, Extension(auth): Extension<AuthUser>) -> ApiResult {
    if auth.is_admin() {
        let tunnels: Vec<Tunnel> = sqlx::query_as("SELECT * FROM tunnels ORDER BY created_time DESC").fetch_all(&state.pool).await?;
        return Ok(R::ok(tunnels));
    }

    let rows = sqlx::query(
        "SELECT t.*, ut.id as user_tunnel_id FROM tunnels t \
         INNER JOIN user_tunnels ut ON t.id = ut.tunnel_id WHERE ut.user_id = ? AND ut.status = 1",
    )
    .bind(auth.user_id)
    .fetch_all(&state.pool)
    .await?;
    use sqlx::Row;
    let out: Vec<serde_json::Value> = rows
        .iter()
        .map(|row| {
            serde_json::json!({
                "id": row.get::<i64, _>("id"),
                "name": row.get::<String, _>("name"),
                "type": row.get::<i32, _>("type"),
                "userTunnelId": row.get::<i64, _>("user_tunnel_id"),
            })
        })
        .collect();
    Ok(R::ok(out))
}

/// `POST /api/v1/tunnel/diagnose` (admin): TCP-pings the out-node from the
/// in-node for relay tunnels; direct tunnels need no cross-node check.
pub async fn diagnose(State(state): State<AppState>, Json(body): Json<IdRequest>) -> ApiResult {
    let tunnel = sqlx::query_as::<_, Tunnel>("SELECT * FROM tunnels WHERE id = ?")
        .bind(body.id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| ApiError::not_found("隧道不存在"))?;

    if !tunnel.is_relay() {
        return Ok(R::ok("端口转发隧道无需诊断"));
    }

    let out_node = sqlx::query_as::<_, crate::domain::Node>("SELECT * FROM nodes WHERE id = ?")
        .bind(tunnel.out_node_id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| ApiError::validation("出口节点不存在"))?;

    let resp = state
        .bus
        .send_msg(tunnel.in_node_id, "TcpPing", serde_json::json!({"ip": out_node.ip, "port": 0, "count": 2, "timeout": 3000}))
        .await;
    Ok(R::ok(resp))
}
