//! Per-IP rate limiting for the login and captcha endpoints (§6 public
//! routes: "rate-limited", "rate-limited, separate bucket"). Grounded in
//! `original_source/go-backend/middleware/rate_limit.go`'s fixed-window
//! counter-per-IP design; translated from a mutex+map into a `DashMap`,
//! matching the `node_bus`/`crypto` modules' concurrent-map idiom.

use std::sync::LazyLock;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request};
use axum::middleware::Next;
use axum::response::Response;
use dashmap::DashMap;

use crate::error::ApiError;

const LOGIN_LIMIT: u32 = 10;
const CAPTCHA_LIMIT: u32 = 20;
const WINDOW: Duration = Duration::from_secs(60);

struct IpRecord {
    count: u32,
    reset_at: Instant,
}

static RECORDS: LazyLock<DashMap<(&'static str, String), IpRecord>> = LazyLock::new(DashMap::new);

fn bucket_for(path: &str) -> &'static str {
    if path == "/api/v1/user/login" { "login" } else { "captcha" }
}

fn limit_for(bucket: &str) -> u32 {
    if bucket == "login" { LOGIN_LIMIT } else { CAPTCHA_LIMIT }
}

fn allow(bucket: &'static str, ip: String) -> bool {
    let now = Instant::now();
    let limit = limit_for(bucket);
    let mut entry = RECORDS.entry((bucket, ip)).or_insert_with(|| IpRecord {
        count: 0,
        reset_at: now + WINDOW,
    });
    if now > entry.reset_at {
        entry.count = 0;
        entry.reset_at = now + WINDOW;
    }
    entry.count += 1;
    entry.count <= limit
}

/// Applied once over `/api/v1/user/login` and the three `/api/v1/captcha/*`
/// routes; the bucket key is derived from the request path so login traffic
/// never eats into the captcha quota or vice versa.
pub async fn login_bucket(request: Request, next: Next) -> Result<Response, ApiError> {
    let bucket = bucket_for(request.uri().path());
    let ip = request
        .extensions()
        .get::<ConnectInfo<std::net::SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    if !allow(bucket, ip) {
        return Err(ApiError::validation("请求过于频繁，请稍后再试"));
    }
    Ok(next.run(request).await)
}
