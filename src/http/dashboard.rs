//! Fleet overview endpoint (§4.6 monitoring): entity counts, node health
//! and aggregated traffic in one response for the panel's landing page.
//! Grounded in `original_source/go-backend/handler/dashboard.go` and
//! `service/monitor.go`; the underlying queries live in `crate::cron`.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use crate::cron;
use crate::error::{ApiResult, R};
use crate::http::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct StatsRequest {
    /// Bucket granularity in seconds; anything other than the two
    /// spec-allowed values (3600, 86400) falls back to hourly.
    #[serde(default, rename = "bucketSize")]
    bucket_size: i64,
    #[serde(default)]
    since: i64,
}

#[derive(Debug, serde::Serialize)]
struct Counts {
    users: i64,
    nodes: i64,
    forwards: i64,
    xray_clients: i64,
}

async fn entity_counts(state: &AppState) -> Counts {
    let users: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users").fetch_one(&state.pool).await.unwrap_or(0);
    let nodes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM nodes").fetch_one(&state.pool).await.unwrap_or(0);
    let forwards: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM forwards").fetch_one(&state.pool).await.unwrap_or(0);
    let xray_clients: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM xray_clients").fetch_one(&state.pool).await.unwrap_or(0);
    Counts { users, nodes, forwards, xray_clients }
}

/// `POST /api/v1/dashboard/stats`: open to any authenticated member, but the
/// node-health and entity-count sections are fleet-wide regardless of
/// caller role — this panel page has no per-user scoping in the original.
pub async fn stats(State(state): State<AppState>, Json(body): Json<StatsRequest>) -> ApiResult {
    let bucket_size = match body.bucket_size {
        86400 => 86400,
        _ => 3600,
    };
    let since = if body.since > 0 { body.since } else { chrono::Utc::now().timestamp() - 24 * 3600 };

    let counts = entity_counts(&state).await;
    let nodes = cron::node_health_list(&state.pool, &state.bus).await;
    let traffic = cron::aggregated_traffic(&state.pool, bucket_size, since).await;

    Ok(R::ok(serde_json::json!({
        "counts": counts,
        "nodes": nodes,
        "traffic": traffic,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clamp(bucket_size: i64) -> i64 {
        match bucket_size {
            86400 => 86400,
            _ => 3600,
        }
    }

    #[test]
    fn bucket_size_accepts_only_the_two_spec_values() {
        assert_eq!(clamp(86400), 86400);
        assert_eq!(clamp(3600), 3600);
        assert_eq!(clamp(0), 3600);
        assert_eq!(clamp(60), 3600);
        assert_eq!(clamp(-1), 3600);
    }

    #[test]
    fn stats_request_defaults_bucket_size_and_since_to_zero() {
        let body: StatsRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(body.bucket_size, 0);
        assert_eq!(body.since, 0);
    }
}
