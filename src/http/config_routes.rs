//! Key/value system configuration (§6 `config/*`). Grounded in
//! `original_source/go-backend/handler/config.go` and
//! `service/vite_config.go`; `system_configs` replaces the Go original's
//! `vite_configs` table one-for-one, keyed by `key` instead of `name`.

use std::collections::HashMap;

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use sqlx::Row;

use crate::domain::SystemConfig;
use crate::error::{ApiError, ApiResult, R};
use crate::http::AppState;

/// `POST /api/v1/config/list` (public): the whole table as a flat map, the
/// shape the frontend's config store expects on boot.
pub async fn list(State(state): State<AppState>) -> ApiResult {
    let rows = sqlx::query("SELECT `key`, value FROM system_configs").fetch_all(&state.pool).await?;
    let map: HashMap<String, String> = rows
        .iter()
        .map(|r| (r.get::<String, _>("key"), r.get::<String, _>("value")))
        .collect();
    Ok(R::ok(map))
}

#[derive(Debug, Deserialize)]
pub struct GetConfigRequest {
    #[serde(default)]
    key: String,
}

/// `POST /api/v1/config/get` (public).
pub async fn get(State(state): State<AppState>, Json(body): Json<GetConfigRequest>) -> ApiResult {
    if body.key.is_empty() {
        return Err(ApiError::validation("配置名称不能为空"));
    }
    let cfg = sqlx::query_as::<_, SystemConfig>("SELECT * FROM system_configs WHERE `key` = ?")
        .bind(&body.key)
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| ApiError::not_found("配置不存在"))?;
    Ok(R::ok(cfg))
}

async fn update_or_create(pool: &sqlx::MySqlPool, key: &str, value: &str) {
    let exists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM system_configs WHERE `key` = ?")
        .bind(key)
        .fetch_one(pool)
        .await
        .unwrap_or(0);
    if exists > 0 {
        sqlx::query("UPDATE system_configs SET value = ? WHERE `key` = ?").bind(value).bind(key).execute(pool).await.ok();
    } else {
        sqlx::query("INSERT INTO system_configs (`key`, value, description) VALUES (?, ?, '')")
            .bind(key)
            .bind(value)
            .execute(pool)
            .await
            .ok();
    }
}

/// `POST /api/v1/config/update` (admin): bulk upsert from a flat map.
pub async fn update(State(state): State<AppState>, Json(body): Json<HashMap<String, String>>) -> ApiResult {
    if body.is_empty() {
        return Err(ApiError::validation("配置数据不能为空"));
    }
    for (key, value) in body.iter().filter(|(k, _)| !k.is_empty()) {
        update_or_create(&state.pool, key, value).await;
    }
    Ok(R::ok_msg("配置更新成功"))
}

#[derive(Debug, Deserialize)]
pub struct UpdateSingleConfigRequest {
    key: String,
    value: String,
}

/// `POST /api/v1/config/update-single` (admin).
pub async fn update_single(State(state): State<AppState>, Json(body): Json<UpdateSingleConfigRequest>) -> ApiResult {
    if body.key.is_empty() {
        return Err(ApiError::validation("配置名称不能为空"));
    }
    if body.value.is_empty() {
        return Err(ApiError::validation("配置值不能为空"));
    }
    update_or_create(&state.pool, &body.key, &body.value).await;
    Ok(R::ok_msg("配置更新成功"))
}
