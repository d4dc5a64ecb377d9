//! Background periodic tasks (§4.4 rollups/reset, §4.6 latency probing),
//! each a single long-lived `tokio::spawn`ed loop sleeping until its next
//! fire, per §5's scheduling model. Grounded in
//! `original_source/go-backend/service/statistics.go` and
//! `original_source/go-backend/service/monitor.go`.

use std::time::Duration;

use chrono::{Datelike, Local, Timelike};
use futures_util::future::join_all;
use sqlx::MySqlPool;

use crate::domain::{Forward, Node, Tunnel, User, UserTunnel};
use crate::node_bus::NodeBus;
use crate::programmer::gost;

const MONITOR_RETENTION_DAYS: i64 = 7;
const STATS_RETENTION_HOURS: i64 = 48;
const MAX_CONCURRENT_PROBES: usize = 10;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Runs the hourly statistics rollup forever; callers `tokio::spawn` this.
pub async fn run_hourly_rollup(pool: MySqlPool) {
    loop {
        let now = Local::now();
        let next = (now.date_naive().and_hms_opt(now.hour(), 0, 0).unwrap() + chrono::Duration::hours(1)) - now.naive_local();
        let sleep_for = next.to_std().unwrap_or(Duration::from_secs(3600));
        tokio::time::sleep(sleep_for).await;
        hourly_rollup_once(&pool).await;
    }
}

async fn hourly_rollup_once(pool: &MySqlPool) {
    let label = Local::now().format("%H:00").to_string();
    let users: Vec<User> = sqlx::query_as("SELECT * FROM users WHERE role_id != 0")
        .fetch_all(pool)
        .await
        .unwrap_or_default();

    for user in &users {
        let total_flow = user.in_flow + user.out_flow;
        let previous: Option<i64> = sqlx::query_scalar("SELECT total_flow FROM statistics_flows WHERE user_id = ? ORDER BY id DESC LIMIT 1")
            .bind(user.id)
            .fetch_optional(pool)
            .await
            .unwrap_or(None);
        let delta = (total_flow - previous.unwrap_or(total_flow)).max(0);

        let _ = sqlx::query("INSERT INTO statistics_flows (user_id, flow, total_flow, time, created_time) VALUES (?, ?, ?, ?, ?)")
            .bind(user.id)
            .bind(delta)
            .bind(total_flow)
            .bind(&label)
            .bind(now_ms())
            .execute(pool)
            .await;
    }

    let cutoff = now_ms() - STATS_RETENTION_HOURS * 3600 * 1000;
    let _ = sqlx::query("DELETE FROM statistics_flows WHERE created_time < ?").bind(cutoff).execute(pool).await;

    let forwards: Vec<Forward> = sqlx::query_as("SELECT * FROM forwards").fetch_all(pool).await.unwrap_or_default();
    let record_time = chrono::Utc::now().timestamp();
    for forward in &forwards {
        let _ = sqlx::query("INSERT INTO statistics_forward_flows (forward_id, in_flow, out_flow, record_time) VALUES (?, ?, ?, ?)")
            .bind(forward.id)
            .bind(forward.in_flow)
            .bind(forward.out_flow)
            .bind(record_time)
            .execute(pool)
            .await;
    }

    let retention_cutoff = record_time - MONITOR_RETENTION_DAYS * 86400;
    let _ = sqlx::query("DELETE FROM statistics_forward_flows WHERE record_time < ?")
        .bind(retention_cutoff)
        .execute(pool)
        .await;
    let _ = sqlx::query("DELETE FROM monitor_latencies WHERE record_time < ?")
        .bind(retention_cutoff)
        .execute(pool)
        .await;

    tracing::info!(users = users.len(), forwards = forwards.len(), "hourly statistics rollup complete");
}

/// Runs the daily reset cron forever (00:00:05 local).
pub async fn run_daily_reset(pool: MySqlPool, bus: NodeBus) {
    loop {
        let now = Local::now();
        let target_today = now.date_naive().and_hms_opt(0, 0, 5).unwrap();
        let next_naive = if now.naive_local() < target_today {
            target_today
        } else {
            target_today + chrono::Duration::days(1)
        };
        let sleep_for = (next_naive - now.naive_local()).to_std().unwrap_or(Duration::from_secs(86400));
        tokio::time::sleep(sleep_for).await;
        daily_reset_once(&pool, &bus).await;
    }
}

async fn daily_reset_once(pool: &MySqlPool, bus: &NodeBus) {
    let today = Local::now().day() as i32;
    let now = now_ms();

    let reset_users: Vec<User> = sqlx::query_as("SELECT * FROM users WHERE flow_reset_time = ?")
        .bind(today)
        .fetch_all(pool)
        .await
        .unwrap_or_default();
    for user in &reset_users {
        let _ = sqlx::query("UPDATE users SET in_flow = 0, out_flow = 0 WHERE id = ?").bind(user.id).execute(pool).await;
        // The schema has no per-user-tunnel flowResetTime column; a
        // user-tunnel's reset rides on its owning user's reset day.
        let _ = sqlx::query("UPDATE user_tunnels SET in_flow = 0, out_flow = 0 WHERE user_id = ?")
            .bind(user.id)
            .execute(pool)
            .await;
    }

    let expired_users: Vec<User> = sqlx::query_as("SELECT * FROM users WHERE exp_time > 0 AND exp_time <= ? AND status = 1")
        .bind(now)
        .fetch_all(pool)
        .await
        .unwrap_or_default();
    for user in &expired_users {
        pause_all_forwards_for_user(pool, bus, user.id).await;
        let _ = sqlx::query("UPDATE users SET status = 0 WHERE id = ?").bind(user.id).execute(pool).await;
        tracing::info!(user_id = user.id, "user disabled: expired");
    }

    let expired_tunnels: Vec<UserTunnel> = sqlx::query_as("SELECT * FROM user_tunnels WHERE exp_time > 0 AND exp_time <= ? AND status = 1")
        .bind(now)
        .fetch_all(pool)
        .await
        .unwrap_or_default();
    for ut in &expired_tunnels {
        pause_forwards_for_user_tunnel(pool, bus, ut.user_id, ut.tunnel_id).await;
        let _ = sqlx::query("UPDATE user_tunnels SET status = 0 WHERE id = ?").bind(ut.id).execute(pool).await;
        tracing::info!(user_tunnel_id = ut.id, "user-tunnel disabled: expired");
    }

    tracing::info!(
        reset = reset_users.len(),
        expired_users = expired_users.len(),
        expired_tunnels = expired_tunnels.len(),
        "daily reset complete"
    );
}

async fn pause_all_forwards_for_user(pool: &MySqlPool, bus: &NodeBus, user_id: i64) {
    let forwards: Vec<Forward> = sqlx::query_as("SELECT * FROM forwards WHERE user_id = ?")
        .bind(user_id)
        .fetch_all(pool)
        .await
        .unwrap_or_default();
    pause_forwards(pool, bus, &forwards).await;
}

async fn pause_forwards_for_user_tunnel(pool: &MySqlPool, bus: &NodeBus, user_id: i64, tunnel_id: i64) {
    let forwards: Vec<Forward> = sqlx::query_as("SELECT * FROM forwards WHERE user_id = ? AND tunnel_id = ?")
        .bind(user_id)
        .bind(tunnel_id)
        .fetch_all(pool)
        .await
        .unwrap_or_default();
    pause_forwards(pool, bus, &forwards).await;
}

async fn pause_forwards(pool: &MySqlPool, bus: &NodeBus, forwards: &[Forward]) {
    for forward in forwards {
        let Ok(Some(tunnel)) = sqlx::query_as::<_, Tunnel>("SELECT * FROM tunnels WHERE id = ?")
            .bind(forward.tunnel_id)
            .fetch_optional(pool)
            .await
        else {
            continue;
        };
        for svc_base in crate::programmer::forward_service_base_names(forward, &tunnel) {
            let _ = gost::pause_service(bus, tunnel.in_node_id, &svc_base).await;
        }
        if tunnel.is_relay() {
            let name = crate::domain::naming::service_base_name(forward.id, forward.user_id, forward.user_tunnel_id);
            let _ = gost::pause_remote_service(bus, tunnel.out_node_id, &name).await;
        }
        let _ = sqlx::query("UPDATE forwards SET status = 0 WHERE id = ?").bind(forward.id).execute(pool).await;
    }
}

/// Runs the latency probe cron forever, at `period`.
pub async fn run_latency_probe(pool: MySqlPool, bus: NodeBus, period: Duration) {
    loop {
        tokio::time::sleep(period).await;
        latency_probe_once(&pool, &bus).await;
    }
}

async fn latency_probe_once(pool: &MySqlPool, bus: &NodeBus) {
    let forwards: Vec<Forward> = sqlx::query_as("SELECT * FROM forwards WHERE status = 1").fetch_all(pool).await.unwrap_or_default();

    let mut jobs = Vec::new();
    for forward in &forwards {
        let Ok(Some(tunnel)) = sqlx::query_as::<_, Tunnel>("SELECT * FROM tunnels WHERE id = ?")
            .bind(forward.tunnel_id)
            .fetch_optional(pool)
            .await
        else {
            continue;
        };
        if !bus.is_online(tunnel.in_node_id) {
            continue;
        }
        let Some((host, port)) = forward.remote_addr.rsplit_once(':') else { continue };
        let Ok(port) = port.parse::<u16>() else { continue };
        jobs.push((forward.id, tunnel.in_node_id, host.to_string(), port));
    }

    let record_time = chrono::Utc::now().timestamp();
    for batch in jobs.chunks(MAX_CONCURRENT_PROBES) {
        let futures = batch.iter().map(|(forward_id, node_id, host, port)| {
            let bus = bus.clone();
            let forward_id = *forward_id;
            let node_id = *node_id;
            let host = host.clone();
            let port = *port;
            async move {
                let data = serde_json::json!({ "ip": host, "port": port, "count": 2, "timeout": 3000 });
                let r = bus.send_msg(node_id, "TcpPing", data).await;
                let success = r.is_ok();
                let latency_ms = r.data.get("latencyMs").and_then(|v| v.as_i64()).unwrap_or(-1) as i32;
                (forward_id, node_id, format!("{host}:{port}"), latency_ms, success)
            }
        });
        let results = join_all(futures).await;
        for (forward_id, node_id, target, latency_ms, success) in results {
            let _ = sqlx::query(
                "INSERT INTO monitor_latencies (forward_id, node_id, target, latency_ms, success, record_time) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(forward_id)
            .bind(node_id)
            .bind(&target)
            .bind(latency_ms)
            .bind(success)
            .bind(record_time)
            .execute(pool)
            .await;
        }
    }
}

/// Fleet health snapshot: online state plus the most recent latency-probe
/// success ratio per node (§4.6 `GetNodeHealthList`).
#[derive(Debug, serde::Serialize)]
pub struct NodeHealth {
    pub node_id: i64,
    pub name: String,
    pub online: bool,
    pub version: String,
    pub engine_status: i32,
    pub recent_success_ratio: f64,
}

pub async fn node_health_list(pool: &MySqlPool, bus: &NodeBus) -> Vec<NodeHealth> {
    let nodes: Vec<Node> = sqlx::query_as("SELECT * FROM nodes").fetch_all(pool).await.unwrap_or_default();
    let mut out = Vec::with_capacity(nodes.len());
    for node in nodes {
        let rows: Vec<(bool,)> = sqlx::query_as("SELECT success FROM monitor_latencies WHERE node_id = ? ORDER BY id DESC LIMIT 50")
            .bind(node.id)
            .fetch_all(pool)
            .await
            .unwrap_or_default();
        let ratio = if rows.is_empty() {
            0.0
        } else {
            rows.iter().filter(|(s,)| *s).count() as f64 / rows.len() as f64
        };
        out.push(NodeHealth {
            node_id: node.id,
            name: node.name,
            online: bus.is_online(node.id),
            version: node.version,
            engine_status: node.engine_status,
            recent_success_ratio: ratio,
        });
    }
    out
}

/// `bucketSize` is validated to one of the two spec-allowed granularities
/// by callers; the HTTP layer maps an unrecognised value to 3600.
#[derive(Debug, serde::Serialize)]
pub struct TrafficBucket {
    pub bucket_start: i64,
    pub in_flow: i64,
    pub out_flow: i64,
}

/// Aggregated traffic endpoint (§4.6): per-bucket deltas of
/// `StatisticsForwardFlow` snapshots, clamped to non-negative and summed
/// across all forwards.
pub async fn aggregated_traffic(pool: &MySqlPool, bucket_size: i64, since: i64) -> Vec<TrafficBucket> {
    #[derive(sqlx::FromRow)]
    struct Row {
        forward_id: i64,
        in_flow: i64,
        out_flow: i64,
        record_time: i64,
    }

    let rows: Vec<Row> = sqlx::query_as(
        "SELECT forward_id, in_flow, out_flow, record_time FROM statistics_forward_flows WHERE record_time >= ? ORDER BY forward_id, record_time ASC",
    )
    .bind(since)
    .fetch_all(pool)
    .await
    .unwrap_or_default();

    use std::collections::HashMap;
    let mut last_per_forward: HashMap<i64, (i64, i64)> = HashMap::new();
    let mut buckets: HashMap<i64, (i64, i64)> = HashMap::new();

    for row in rows {
        let bucket_start = (row.record_time / bucket_size) * bucket_size;
        let entry = buckets.entry(bucket_start).or_insert((0, 0));
        if let Some((prev_in, prev_out)) = last_per_forward.get(&row.forward_id) {
            entry.0 += (row.in_flow - prev_in).max(0);
            entry.1 += (row.out_flow - prev_out).max(0);
        }
        last_per_forward.insert(row.forward_id, (row.in_flow, row.out_flow));
    }

    let mut out: Vec<TrafficBucket> = buckets
        .into_iter()
        .map(|(bucket_start, (in_flow, out_flow))| TrafficBucket {
            bucket_start,
            in_flow,
            out_flow,
        })
        .collect();
    out.sort_by_key(|b| b.bucket_start);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_start_floors_to_bucket_size() {
        assert_eq!((3700_i64 / 3600) * 3600, 3600);
        assert_eq!((86401_i64 / 86400) * 86400, 86400);
    }

    #[tokio::test]
    async fn aggregated_traffic_clamps_negative_deltas_from_counter_resets() {
        // Pure function behavior is exercised indirectly: a forward whose
        // second snapshot shows a smaller counter than the first (a node
        // restart) must never contribute a negative delta. We validate the
        // clamp arithmetic directly since this helper needs a live pool.
        let prev = 1000_i64;
        let current = 200_i64;
        assert_eq!((current - prev).max(0), 0);
    }
}
