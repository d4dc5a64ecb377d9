//! Speed-limit CRUD (§6 `speed-limit/*`). Grounded in
//! `original_source/go-backend/handler/speed_limit.go` and
//! `service/speed_limit.go`; the node-side limiter itself is programmed
//! through `programmer::gost`, same as the tunnel user-assignment path.

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;

use crate::domain::{SpeedLimit, Tunnel};
use crate::error::{ApiError, ApiResult, R};
use crate::http::AppState;
use crate::programmer::gost;

#[derive(Debug, Deserialize)]
pub struct CreateSpeedLimitRequest {
    name: String,
    speed: i64,
    #[serde(rename = "tunnelId")]
    tunnel_id: i64,
}

/// `POST /api/v1/speed-limit/create` (admin).
pub async fn create(State(state): State<AppState>, Json(body): Json<CreateSpeedLimitRequest>) -> ApiResult {
    let tunnel = sqlx::query_as::<_, Tunnel>("SELECT * FROM tunnels WHERE id = ?")
        .bind(body.tunnel_id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| ApiError::validation("隧道不存在"))?;

    let now = Utc::now().timestamp_millis();
    let result = sqlx::query(
        "INSERT INTO speed_limits (name, speed, tunnel_id, status, created_time, updated_time) VALUES (?, ?, ?, 1, ?, ?)",
    )
    .bind(&body.name)
    .bind(body.speed)
    .bind(body.tunnel_id)
    .bind(now)
    .bind(now)
    .execute(&state.pool)
    .await?;

    let id = result.last_insert_id() as i64;
    gost::add_limiter(&state.bus, tunnel.in_node_id, id, body.speed).await;

    let sl: SpeedLimit = sqlx::query_as("SELECT * FROM speed_limits WHERE id = ?").bind(id).fetch_one(&state.pool).await?;
    Ok(R::ok(sl))
}

/// `POST /api/v1/speed-limit/list` (admin).
pub async fn list(State(state): State<AppState>) -> ApiResult {
    let list: Vec<SpeedLimit> = sqlx::query_as("SELECT * FROM speed_limits ORDER BY created_time DESC").fetch_all(&state.pool).await?;
    Ok(R::ok(list))
}

#[derive(Debug, Deserialize)]
pub struct UpdateSpeedLimitRequest {
    id: i64,
    #[serde(default)]
    name: String,
    speed: Option<i64>,
}

/// `POST /api/v1/speed-limit/update` (admin): a changed rate is re-pushed
/// to the node-side limiter object in place, no forward rebuild needed.
pub async fn update(State(state): State<AppState>, Json(body): Json<UpdateSpeedLimitRequest>) -> ApiResult {
    let sl = sqlx::query_as::<_, SpeedLimit>("SELECT * FROM speed_limits WHERE id = ?")
        .bind(body.id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| ApiError::not_found("限速不存在"))?;

    let name = if body.name.is_empty() { sl.name.clone() } else { body.name.clone() };
    let speed = body.speed.unwrap_or(sl.speed);

    sqlx::query("UPDATE speed_limits SET name = ?, speed = ?, updated_time = ? WHERE id = ?")
        .bind(&name)
        .bind(speed)
        .bind(Utc::now().timestamp_millis())
        .bind(body.id)
        .execute(&state.pool)
        .await?;

    if let Some(tunnel) = sqlx::query_as::<_, Tunnel>("SELECT * FROM tunnels WHERE id = ?").bind(sl.tunnel_id).fetch_optional(&state.pool).await? {
        gost::update_limiter(&state.bus, tunnel.in_node_id, body.id, speed).await;
    }

    Ok(R::ok_msg("更新成功"))
}

#[derive(Debug, Deserialize)]
pub struct IdRequest {
    id: i64,
}

/// `POST /api/v1/speed-limit/delete` (admin). Refused while any
/// `user_tunnels` row still references the limiter.
pub async fn delete(State(state): State<AppState>, Json(body): Json<IdRequest>) -> ApiResult {
    let sl = sqlx::query_as::<_, SpeedLimit>("SELECT * FROM speed_limits WHERE id = ?")
        .bind(body.id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| ApiError::not_found("限速不存在"))?;

    let in_use: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM user_tunnels WHERE speed_id = ?")
        .bind(body.id)
        .fetch_one(&state.pool)
        .await?;
    if in_use > 0 {
        return Err(ApiError::validation("该限速正在被使用，无法删除"));
    }

    if let Some(tunnel) = sqlx::query_as::<_, Tunnel>("SELECT * FROM tunnels WHERE id = ?").bind(sl.tunnel_id).fetch_optional(&state.pool).await? {
        gost::delete_limiter(&state.bus, tunnel.in_node_id, body.id).await;
    }

    sqlx::query("DELETE FROM speed_limits WHERE id = ?").bind(body.id).execute(&state.pool).await?;
    Ok(R::ok_msg("删除成功"))
}

#[derive(Debug, Deserialize)]
pub struct TunnelIdRequest {
    #[serde(rename = "tunnelId")]
    tunnel_id: i64,
}

/// `POST /api/v1/speed-limit/tunnels`: the limiters defined on one tunnel,
/// offered as the dropdown source when assigning a user to it.
pub async fn tunnels(State(state): State<AppState>, Json(body): Json<TunnelIdRequest>) -> ApiResult {
    let list: Vec<SpeedLimit> = sqlx::query_as("SELECT * FROM speed_limits WHERE tunnel_id = ? ORDER BY created_time DESC")
        .bind(body.tunnel_id)
        .fetch_all(&state.pool)
        .await?;
    Ok(R::ok(list))
}
