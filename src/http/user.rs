//! User account handlers (§6 `user/*`). Login/create/list/update/delete are
//! admin-facing except `login` (public) and `package`/`updatePassword`
//! (any authenticated user acting on themselves). Grounded in
//! `original_source/go-backend/handler/user.go` and `service/user.go`.

use axum::extract::State;
use axum::{Extension, Json};
use chrono::Utc;
use serde::Deserialize;

use crate::auth::{AuthUser, jwt, password};
use crate::domain::User;
use crate::error::{ApiError, ApiResult, R};
use crate::http::AppState;
use crate::http::captcha;

const ROLE_ADMIN: i32 = 0;
const STATUS_ACTIVE: i32 = 1;
const DEFAULT_USERNAME: &str = "admin";

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    username: String,
    password: String,
    #[serde(default, rename = "captchaId")]
    captcha_id: String,
    #[serde(default, rename = "captchaAnswer")]
    captcha_answer: String,
}

/// `POST /api/v1/user/login`. CAPTCHA is only enforced when a
/// `captcha_enabled` system config row is set to `"true"`.
pub async fn login(State(state): State<AppState>, Json(body): Json<LoginRequest>) -> ApiResult {
    let captcha_enabled: Option<String> =
        sqlx::query_scalar("SELECT value FROM system_configs WHERE `key` = 'captcha_enabled'")
            .fetch_optional(&state.pool)
            .await?;
    if captcha_enabled.as_deref() == Some("true") {
        if body.captcha_id.is_empty() || body.captcha_answer.is_empty() {
            return Ok(R::err("请完成验证码"));
        }
        if !captcha::verify_consuming(&body.captcha_id, &body.captcha_answer) {
            return Ok(R::err("验证码错误"));
        }
    }

    let Some(user) = sqlx::query_as::<_, User>("SELECT * FROM users WHERE user = ?")
        .bind(&body.username)
        .fetch_optional(&state.pool)
        .await?
    else {
        return Ok(R::err("账号或密码错误"));
    };

    let outcome = password::verify_password(&body.password, &user.password);
    if !outcome.matches {
        return Ok(R::err("账号或密码错误"));
    }
    if !password::is_bcrypt_hash(&user.password) {
        if let Ok(rehashed) = password::hash_password(&body.password) {
            let _ = sqlx::query("UPDATE users SET password = ? WHERE id = ?")
                .bind(rehashed)
                .bind(user.id)
                .execute(&state.pool)
                .await;
            tracing::info!(user = %user.user, "password migrated from legacy hash to bcrypt");
        }
    }

    if user.status == 0 {
        return Ok(R::err("账户停用"));
    }

    let token = jwt::issue_session_token(&state.jwt_secret, user.id, &user.user, user.role_id, Utc::now());
    let require_password_change = body.username == DEFAULT_USERNAME;

    Ok(R::ok(serde_json::json!({
        "token": token,
        "name": user.user,
        "role_id": user.role_id,
        "requirePasswordChange": require_password_change,
    })))
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    user: String,
    pwd: String,
    flow: i64,
    num: i64,
    #[serde(rename = "expTime")]
    exp_time: i64,
    #[serde(rename = "flowResetTime")]
    flow_reset_time: i32,
    status: Option<i32>,
}

/// `POST /api/v1/user/create` (admin).
pub async fn create(State(state): State<AppState>, Json(body): Json<CreateUserRequest>) -> ApiResult {
    if body.pwd.len() < 8 {
        return Err(ApiError::validation("密码长度至少8位"));
    }
    let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE user = ?")
        .bind(&body.user)
        .fetch_one(&state.pool)
        .await?;
    if existing > 0 {
        return Err(ApiError::validation("用户名已存在"));
    }

    let hashed = password::hash_password(&body.pwd).map_err(|e| ApiError::Internal(e.to_string()))?;
    let now = Utc::now().timestamp_millis();
    let status = body.status.unwrap_or(STATUS_ACTIVE);

    sqlx::query(
        "INSERT INTO users (user, password, role_id, flow, in_flow, out_flow, num, exp_time, status, flow_reset_time, created_time, updated_time) \
         VALUES (?, ?, 1, ?, 0, 0, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&body.user)
    .bind(hashed)
    .bind(body.flow)
    .bind(body.num)
    .bind(body.exp_time)
    .bind(status)
    .bind(body.flow_reset_time)
    .bind(now)
    .bind(now)
    .execute(&state.pool)
    .await?;

    Ok(R::ok_msg("用户创建成功"))
}

/// `POST /api/v1/user/list` (admin). Non-admin users only.
pub async fn list(State(state): State<AppState>) -> ApiResult {
    let mut users: Vec<User> = sqlx::query_as("SELECT * FROM users WHERE role_id != 0 ORDER BY created_time DESC")
        .fetch_all(&state.pool)
        .await?;
    for u in &mut users {
        u.password.clear();
    }
    Ok(R::ok(users))
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    id: i64,
    user: String,
    #[serde(default)]
    pwd: String,
    flow: i64,
    num: i64,
    #[serde(rename = "expTime")]
    exp_time: i64,
    #[serde(rename = "flowResetTime")]
    flow_reset_time: i32,
    status: Option<i32>,
}

/// `POST /api/v1/user/update` (admin).
pub async fn update(State(state): State<AppState>, Json(body): Json<UpdateUserRequest>) -> ApiResult {
    let Some(existing) = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(body.id)
        .fetch_optional(&state.pool)
        .await?
    else {
        return Err(ApiError::not_found("用户不存在"));
    };
    if existing.role_id == ROLE_ADMIN {
        return Err(ApiError::validation("不能修改管理员用户信息"));
    }

    let dup: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE user = ? AND id != ?")
        .bind(&body.user)
        .bind(body.id)
        .fetch_one(&state.pool)
        .await?;
    if dup > 0 {
        return Err(ApiError::validation("用户名已被其他用户使用"));
    }

    let status = body.status.unwrap_or(existing.status);
    let password_hash = if body.pwd.is_empty() {
        existing.password
    } else {
        if body.pwd.len() < 8 {
            return Err(ApiError::validation("密码长度至少8位"));
        }
        password::hash_password(&body.pwd).map_err(|e| ApiError::Internal(e.to_string()))?
    };

    sqlx::query(
        "UPDATE users SET user = ?, password = ?, flow = ?, num = ?, exp_time = ?, flow_reset_time = ?, status = ?, updated_time = ? WHERE id = ?",
    )
    .bind(&body.user)
    .bind(password_hash)
    .bind(body.flow)
    .bind(body.num)
    .bind(body.exp_time)
    .bind(body.flow_reset_time)
    .bind(status)
    .bind(Utc::now().timestamp_millis())
    .bind(body.id)
    .execute(&state.pool)
    .await?;

    Ok(R::ok_msg("用户更新成功"))
}

#[derive(Debug, Deserialize)]
pub struct IdRequest {
    id: i64,
}

async fn delete_gost_services_for_forward(state: &AppState, forward: &crate::domain::Forward) {
    let Ok(Some(tunnel)) = sqlx::query_as::<_, crate::domain::Tunnel>("SELECT * FROM tunnels WHERE id = ?")
        .bind(forward.tunnel_id)
        .fetch_optional(&state.pool)
        .await
    else {
        return;
    };
    let Ok(Some(in_node)) = sqlx::query_as::<_, crate::domain::Node>("SELECT * FROM nodes WHERE id = ?")
        .bind(tunnel.in_node_id)
        .fetch_optional(&state.pool)
        .await
    else {
        return;
    };
    let out_node: Option<crate::domain::Node> = if tunnel.is_relay() {
        sqlx::query_as("SELECT * FROM nodes WHERE id = ?")
            .bind(tunnel.out_node_id)
            .fetch_optional(&state.pool)
            .await
            .ok()
            .flatten()
    } else {
        None
    };
    if let Err(e) = crate::programmer::delete_forward(&state.bus, forward, &tunnel, &in_node, out_node.as_ref()).await {
        tracing::warn!(forward_id = forward.id, error = %e, "failed to tear down gost services for deleted user's forward");
    }
}

/// `POST /api/v1/user/delete` (admin). Cascades: pause/teardown forwards,
/// purge user_tunnel and statistics rows, then the user row itself.
pub async fn delete(State(state): State<AppState>, Json(body): Json<IdRequest>) -> ApiResult {
    let Some(user) = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(body.id)
        .fetch_optional(&state.pool)
        .await?
    else {
        return Err(ApiError::not_found("用户不存在"));
    };
    if user.role_id == ROLE_ADMIN {
        return Err(ApiError::validation("不能删除管理员用户"));
    }

    let forwards: Vec<crate::domain::Forward> = sqlx::query_as("SELECT * FROM forwards WHERE user_id = ?")
        .bind(body.id)
        .fetch_all(&state.pool)
        .await?;
    for forward in &forwards {
        delete_gost_services_for_forward(&state, forward).await;
        sqlx::query("DELETE FROM forwards WHERE id = ?").bind(forward.id).execute(&state.pool).await.ok();
    }

    sqlx::query("DELETE FROM user_tunnels WHERE user_id = ?").bind(body.id).execute(&state.pool).await?;
    sqlx::query("DELETE FROM statistics_flows WHERE user_id = ?").bind(body.id).execute(&state.pool).await?;
    sqlx::query("DELETE FROM users WHERE id = ?").bind(body.id).execute(&state.pool).await?;

    Ok(R::ok_msg("用户及关联数据删除成功"))
}

/// `POST /api/v1/user/package`: a user's self-service dashboard payload.
pub async fn package(State(state): State<AppState>, Extension(auth): Extension<AuthUser>) -> ApiResult {
    let Some(user) = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(auth.user_id)
        .fetch_optional(&state.pool)
        .await?
    else {
        return Err(ApiError::not_found("用户不存在"));
    };

    let tunnel_permissions: Vec<(i64, i64, String, i32, i64, i64, i64, i64, i64, Option<i64>, Option<i64>)> = if auth.is_admin() {
        sqlx::query_as(
            "SELECT t.id, t.id, t.name, t.flow, 99999, 0, 0, 99999, 0, NULL, NULL FROM tunnels t WHERE t.status = 1 ORDER BY t.id",
        )
        .fetch_all(&state.pool)
        .await
        .unwrap_or_default()
    } else {
        sqlx::query_as(
            "SELECT ut.id, ut.tunnel_id, t.name, t.flow, ut.flow, ut.in_flow, ut.out_flow, ut.num, ut.exp_time, ut.flow_reset_time, ut.speed_id \
             FROM user_tunnels ut LEFT JOIN tunnels t ON ut.tunnel_id = t.id WHERE ut.user_id = ?",
        )
        .bind(auth.user_id)
        .fetch_all(&state.pool)
        .await
        .unwrap_or_default()
    };

    let forwards: Vec<crate::domain::Forward> = sqlx::query_as("SELECT * FROM forwards WHERE user_id = ?")
        .bind(auth.user_id)
        .fetch_all(&state.pool)
        .await
        .unwrap_or_default();

    let flows: Vec<crate::domain::StatisticsFlow> = sqlx::query_as(
        "SELECT * FROM statistics_flows WHERE user_id = ? ORDER BY id DESC LIMIT 48",
    )
    .bind(auth.user_id)
    .fetch_all(&state.pool)
    .await
    .unwrap_or_default();

    Ok(R::ok(serde_json::json!({
        "userInfo": {
            "id": user.id, "user": user.user, "status": user.status, "flow": user.flow,
            "inFlow": user.in_flow, "outFlow": user.out_flow, "num": user.num,
            "expTime": user.exp_time, "flowResetTime": user.flow_reset_time,
            "createdTime": user.created_time, "updatedTime": user.updated_time,
        },
        "tunnelPermissions": tunnel_permissions,
        "forwards": forwards,
        "statisticsFlows": flows,
    })))
}

#[derive(Debug, Deserialize)]
pub struct UpdatePasswordRequest {
    #[serde(rename = "oldPassword")]
    old_password: String,
    #[serde(rename = "newPassword")]
    new_password: String,
    #[serde(default, rename = "newUsername")]
    new_username: String,
}

/// `POST /api/v1/user/updatePassword`: a user changes their own password
/// (and, optionally, username), re-proving identity with the old password.
pub async fn update_password(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Json(body): Json<UpdatePasswordRequest>,
) -> ApiResult {
    let Some(user) = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(auth.user_id)
        .fetch_optional(&state.pool)
        .await?
    else {
        return Err(ApiError::not_found("用户不存在"));
    };
    if !password::verify_password(&body.old_password, &user.password).matches {
        return Err(ApiError::validation("原密码错误"));
    }
    if body.new_password.len() < 8 {
        return Err(ApiError::validation("密码长度至少8位"));
    }
    let new_hash = password::hash_password(&body.new_password).map_err(|e| ApiError::Internal(e.to_string()))?;
    let new_username = if body.new_username.is_empty() { user.user.clone() } else { body.new_username.clone() };

    sqlx::query("UPDATE users SET password = ?, user = ?, updated_time = ? WHERE id = ?")
        .bind(new_hash)
        .bind(new_username)
        .bind(Utc::now().timestamp_millis())
        .bind(auth.user_id)
        .execute(&state.pool)
        .await?;

    Ok(R::ok_msg("密码修改成功"))
}

#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    id: i64,
    #[serde(rename = "type")]
    kind: i32,
}

/// `POST /api/v1/user/reset` (admin): zero a user's traffic counters
/// (`type=1`) or clear its expiry (`type=2`).
pub async fn reset(State(state): State<AppState>, Json(body): Json<ResetRequest>) -> ApiResult {
    match body.kind {
        1 => {
            sqlx::query("UPDATE users SET in_flow = 0, out_flow = 0, updated_time = ? WHERE id = ?")
                .bind(Utc::now().timestamp_millis())
                .bind(body.id)
                .execute(&state.pool)
                .await?;
        }
        2 => {
            sqlx::query("UPDATE users SET exp_time = 0, status = 1, updated_time = ? WHERE id = ?")
                .bind(Utc::now().timestamp_millis())
                .bind(body.id)
                .execute(&state.pool)
                .await?;
        }
        _ => return Err(ApiError::validation("未知的重置类型")),
    }
    Ok(R::ok_msg("重置成功"))
}
