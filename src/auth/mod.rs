pub mod jwt;
pub mod password;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use rand::Rng;
use sqlx::MySqlPool;

use crate::{domain::Role, error::ApiError, http::AppState};

/// The legacy sentinel username/password pair (`original_source/go-backend/service/user.go`'s
/// `InitAdmin`): a freshly-created admin row, or one still carrying this
/// password, gets a fresh random password on every startup.
const SENTINEL_USERNAME: &str = "admin";
const SENTINEL_PASSWORD: &str = "admin_user";

/// §4.5 admin bootstrap: create the singleton admin row if none exists, or
/// regenerate its password if it's still on the sentinel value, logging the
/// plaintext once to stderr so an operator can log in.
pub async fn ensure_admin_bootstrap(pool: &MySqlPool) -> Result<(), sqlx::Error> {
    let existing: Option<(i64, String)> =
        sqlx::query_as("SELECT id, password FROM users WHERE role_id = ? ORDER BY id ASC LIMIT 1")
            .bind(Role::Admin as i32)
            .fetch_optional(pool)
            .await?;

    let now = Utc::now().timestamp_millis();

    match existing {
        None => {
            let generated = generate_random_password();
            let hash = password::hash_password(&generated)
                .unwrap_or_else(|_| generated.clone());
            sqlx::query(
                "INSERT INTO users (user, password, role_id, flow, in_flow, out_flow, num, exp_time, status, flow_reset_time, created_time, updated_time) \
                 VALUES (?, ?, ?, 0, 0, 0, 0, 0, 1, 0, ?, ?)",
            )
            .bind(SENTINEL_USERNAME)
            .bind(hash)
            .bind(Role::Admin as i32)
            .bind(now)
            .bind(now)
            .execute(pool)
            .await?;
            eprintln!("created admin account `{SENTINEL_USERNAME}` with password: {generated}");
        }
        Some((id, stored_hash)) => {
            let is_sentinel = stored_hash == SENTINEL_PASSWORD
                || password::verify_password(SENTINEL_PASSWORD, &stored_hash).matches;
            if is_sentinel {
                let generated = generate_random_password();
                let hash = password::hash_password(&generated)
                    .unwrap_or_else(|_| generated.clone());
                sqlx::query("UPDATE users SET password = ?, updated_time = ? WHERE id = ?")
                    .bind(hash)
                    .bind(now)
                    .bind(id)
                    .execute(pool)
                    .await?;
                eprintln!("admin account still had the default password; regenerated: {generated}");
            }
        }
    }

    Ok(())
}

fn generate_random_password() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz23456789";
    let mut rng = rand::thread_rng();
    (0..12).map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char).collect()
}

/// Request-scoped identity populated by [`require_auth`] and read by
/// downstream handlers via `request.extensions()`.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: i64,
    pub role_id: i32,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role_id == 0
    }
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Axum middleware equivalent of `original_source/go-backend/middleware/jwt.go`:
/// validates the bearer token, rejects with 401 and a terse Chinese message
/// on any failure, and attaches [`AuthUser`] to the request for handlers.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = extract_bearer_token(request.headers())
        .ok_or_else(|| ApiError::Unauthorized("未登录".to_string()))?;

    let claims = jwt::validate_session_token(&state.jwt_secret, token, Utc::now())
        .map_err(|e| ApiError::Unauthorized(e.to_string()))?;

    let user_id: i64 = claims
        .sub
        .parse()
        .map_err(|_| ApiError::Unauthorized("token无效或已过期".to_string()))?;

    request.extensions_mut().insert(AuthUser {
        user_id,
        role_id: claims.role_id,
    });

    Ok(next.run(request).await)
}

/// Equivalent of `middleware/role.go`'s `Admin()`. Must run after
/// [`require_auth`] has populated the request extensions.
pub async fn require_admin(request: Request, next: Next) -> Result<Response, ApiError> {
    let auth = request
        .extensions()
        .get::<AuthUser>()
        .cloned()
        .ok_or_else(|| ApiError::Unauthorized("未登录".to_string()))?;
    if !auth.is_admin() {
        return Err(ApiError::Unauthorized("需要管理员权限".to_string()));
    }
    Ok(next.run(request).await)
}

pub fn status_for(error: &ApiError) -> StatusCode {
    match error {
        ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        _ => StatusCode::OK,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_password_is_twelve_printable_chars() {
        let pw = generate_random_password();
        assert_eq!(pw.chars().count(), 12);
        assert!(pw.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn generated_passwords_are_not_all_identical() {
        let a = generate_random_password();
        let b = generate_random_password();
        assert_ne!(a, b, "two independently generated passwords collided");
    }
}
