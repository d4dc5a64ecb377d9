//! Traffic ingest and quota enforcement (§4.4). Node flow reports (GOST
//! `N`-keyed service totals, Xray per-email client totals) land here,
//! accumulate into per-entity counters with per-id serialization, and
//! trigger pause/disable side effects when a cap is crossed. Grounded
//! directly in `original_source/go-backend/service/flow.go`.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Deserialize;
use sqlx::MySqlPool;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::domain::{BYTES_TO_GB, FORWARD_STATUS_PAUSED, Forward};
use crate::node_bus::NodeBus;
use crate::programmer::gost;

#[derive(Debug, Deserialize)]
struct FlowReport {
    #[serde(rename = "n")]
    name: String,
    #[serde(default)]
    u: i64,
    #[serde(default)]
    d: i64,
}

#[derive(Debug, Deserialize)]
struct XrayClientReport {
    email: String,
    #[serde(default)]
    u: i64,
    #[serde(default)]
    d: i64,
}

#[derive(Debug, Deserialize)]
struct XrayFlowUpload {
    #[serde(default)]
    clients: Vec<XrayClientReport>,
}

/// Per-id `tokio::Mutex` registry so concurrent reports for the same
/// user/tunnel/forward serialize their read-modify-write, mirroring the
/// Go side's `sync.Map`-of-`*sync.Mutex` lock-by-string-id idiom.
#[derive(Clone, Default)]
pub struct EntityLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    async fn guard(&self, key: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let mutex = self.locks.entry(key.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone();
        mutex.lock_owned().await
    }
}

#[derive(Clone)]
pub struct QuotaEngine {
    pool: MySqlPool,
    bus: NodeBus,
    locks: EntityLocks,
}

impl QuotaEngine {
    pub fn new(pool: MySqlPool, bus: NodeBus) -> Self {
        Self {
            pool,
            bus,
            locks: EntityLocks::new(),
        }
    }

    /// Entry point for a GOST flow-report webhook body. Returns `"ok"`
    /// unconditionally — the node protocol treats this as a fire-and-forget
    /// notification, so malformed payloads are logged and swallowed rather
    /// than surfaced as an HTTP error (`ProcessFlowUpload`'s behavior).
    pub async fn process_flow_upload(&self, decrypted: &str) -> &'static str {
        let Ok(report) = serde_json::from_str::<FlowReport>(decrypted) else {
            warn!(raw = decrypted, "gost flow report: invalid json");
            return "ok";
        };
        if report.name == "web_api" {
            return "ok";
        }
        self.process_flow_data(&report).await;
        "ok"
    }

    pub async fn process_xray_flow_upload(&self, decrypted: &str) -> &'static str {
        let Ok(upload) = serde_json::from_str::<XrayFlowUpload>(decrypted) else {
            warn!(raw = decrypted, "xray flow report: invalid json");
            return "ok";
        };
        info!(count = upload.clients.len(), "xray flow report received");

        for client in &upload.clients {
            if client.email.is_empty() || (client.u == 0 && client.d == 0) {
                continue;
            }
            self.apply_xray_client_flow(client).await;
        }
        "ok"
    }

    async fn apply_xray_client_flow(&self, client: &XrayClientReport) {
        let Ok(Some(client_row)) = sqlx::query_as::<_, crate::domain::XrayClient>("SELECT * FROM xray_clients WHERE email = ?")
            .bind(&client.email)
            .fetch_optional(&self.pool)
            .await
        else {
            warn!(email = %client.email, "xray flow report: client not found");
            return;
        };

        let _ = sqlx::query("UPDATE xray_clients SET up_traffic = up_traffic + ?, down_traffic = down_traffic + ? WHERE id = ?")
            .bind(client.u)
            .bind(client.d)
            .bind(client_row.id)
            .execute(&self.pool)
            .await;

        {
            let key = format!("user:{}", client_row.user_id);
            let _guard = self.locks.guard(&key).await;
            let _ = sqlx::query("UPDATE users SET in_flow = in_flow + ?, out_flow = out_flow + ? WHERE id = ?")
                .bind(client.d)
                .bind(client.u)
                .bind(client_row.user_id)
                .execute(&self.pool)
                .await;
        }

        if client_row.total_traffic > 0
            && client_row.up_traffic + client_row.down_traffic + client.u + client.d >= client_row.total_traffic
        {
            let _ = sqlx::query("UPDATE xray_clients SET enable = 0 WHERE id = ?")
                .bind(client_row.id)
                .execute(&self.pool)
                .await;
            info!(email = %client.email, "xray client disabled: traffic limit exceeded");
        }
    }

    /// `name` is a forward's service base name, `"<forwardId>_<userId>_<userTunnelId>"`.
    async fn process_flow_data(&self, report: &FlowReport) {
        let parts: Vec<&str> = report.name.split('_').collect();
        if parts.len() < 3 {
            return;
        }
        let (Ok(forward_id), Ok(user_id), Ok(user_tunnel_id)) =
            (parts[0].parse::<i64>(), parts[1].parse::<i64>(), parts[2].parse::<i64>())
        else {
            return;
        };

        let Ok(Some(forward)) = sqlx::query_as::<_, Forward>("SELECT * FROM forwards WHERE id = ?")
            .bind(forward_id)
            .fetch_optional(&self.pool)
            .await
        else {
            return;
        };

        let mut flow_type: i32 = 2;
        let mut traffic_ratio: f64 = 1.0;
        if let Ok(Some(tunnel)) = sqlx::query_as::<_, crate::domain::Tunnel>("SELECT * FROM tunnels WHERE id = ?")
            .bind(forward.tunnel_id)
            .fetch_optional(&self.pool)
            .await
        {
            if tunnel.flow > 0 {
                flow_type = tunnel.flow;
            }
            if tunnel.traffic_ratio > 0.0 {
                traffic_ratio = tunnel.traffic_ratio;
            }
        }

        let d = (report.d as f64 * traffic_ratio * flow_type as f64).floor() as i64;
        let u = (report.u as f64 * traffic_ratio * flow_type as f64).floor() as i64;

        {
            let key = format!("forward:{forward_id}");
            let _guard = self.locks.guard(&key).await;
            let _ = sqlx::query("UPDATE forwards SET in_flow = in_flow + ?, out_flow = out_flow + ? WHERE id = ?")
                .bind(d)
                .bind(u)
                .bind(forward_id)
                .execute(&self.pool)
                .await;
        }
        {
            let key = format!("user:{user_id}");
            let _guard = self.locks.guard(&key).await;
            let _ = sqlx::query("UPDATE users SET in_flow = in_flow + ?, out_flow = out_flow + ? WHERE id = ?")
                .bind(d)
                .bind(u)
                .bind(user_id)
                .execute(&self.pool)
                .await;
        }
        if user_tunnel_id != 0 {
            let key = format!("user_tunnel:{user_tunnel_id}");
            let _guard = self.locks.guard(&key).await;
            let _ = sqlx::query("UPDATE user_tunnels SET in_flow = in_flow + ?, out_flow = out_flow + ? WHERE id = ?")
                .bind(d)
                .bind(u)
                .bind(user_tunnel_id)
                .execute(&self.pool)
                .await;
        }

        if user_tunnel_id != 0 {
            self.check_user_limits(user_id, &report.name).await;
            self.check_user_tunnel_limits(user_tunnel_id, &report.name, user_id).await;
        }
    }

    async fn check_user_limits(&self, user_id: i64, service_name: &str) {
        let Ok(Some(user)) = sqlx::query_as::<_, crate::domain::User>("SELECT * FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
        else {
            return;
        };

        let over_quota = user.flow * BYTES_TO_GB < user.in_flow + user.out_flow;
        let expired = user.exp_time > 0 && user.exp_time <= now_ms();
        let disabled = user.status != 1;
        if over_quota || expired || disabled {
            self.pause_all_user_services(user_id, service_name).await;
        }
    }

    async fn check_user_tunnel_limits(&self, user_tunnel_id: i64, service_name: &str, user_id: i64) {
        let Ok(Some(ut)) = sqlx::query_as::<_, crate::domain::UserTunnel>("SELECT * FROM user_tunnels WHERE id = ?")
            .bind(user_tunnel_id)
            .fetch_optional(&self.pool)
            .await
        else {
            return;
        };

        let over_quota = ut.in_flow + ut.out_flow >= ut.flow * BYTES_TO_GB;
        let expired = ut.exp_time > 0 && ut.exp_time <= now_ms();
        let disabled = ut.status != 1;
        if over_quota || expired || disabled {
            self.pause_specific_forward(ut.tunnel_id, service_name, user_id).await;
        }
    }

    async fn pause_all_user_services(&self, user_id: i64, service_name: &str) {
        let forwards: Vec<Forward> = sqlx::query_as("SELECT * FROM forwards WHERE user_id = ?")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .unwrap_or_default();
        self.pause_forward_services(&forwards, service_name).await;
    }

    async fn pause_specific_forward(&self, tunnel_id: i64, service_name: &str, user_id: i64) {
        let forwards: Vec<Forward> = sqlx::query_as("SELECT * FROM forwards WHERE tunnel_id = ? AND user_id = ?")
            .bind(tunnel_id)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .unwrap_or_default();
        self.pause_forward_services(&forwards, service_name).await;
    }

    async fn pause_forward_services(&self, forwards: &[Forward], triggering_service: &str) {
        for forward in forwards {
            if forward.status == FORWARD_STATUS_PAUSED {
                continue;
            }
            let name = crate::domain::naming::service_base_name(forward.id, forward.user_id, forward.user_tunnel_id);
            let Ok(Some(tunnel)) = sqlx::query_as::<_, crate::domain::Tunnel>("SELECT * FROM tunnels WHERE id = ?")
                .bind(forward.tunnel_id)
                .fetch_optional(&self.pool)
                .await
            else {
                continue;
            };
            for svc_base in crate::programmer::forward_service_base_names(forward, &tunnel) {
                let _ = gost::pause_service(&self.bus, tunnel.in_node_id, &svc_base).await;
            }
            if tunnel.is_relay() {
                let _ = gost::pause_remote_service(&self.bus, tunnel.out_node_id, &name).await;
            }
            let _ = sqlx::query("UPDATE forwards SET status = ? WHERE id = ?")
                .bind(FORWARD_STATUS_PAUSED)
                .bind(forward.id)
                .execute(&self.pool)
                .await;
            info!(forward_id = forward.id, triggering_service, "forward paused by quota enforcement");
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_report_name_splits_into_forward_user_usertunnel() {
        let report = FlowReport {
            name: "17_5_7".to_string(),
            u: 100,
            d: 200,
        };
        let parts: Vec<&str> = report.name.split('_').collect();
        assert_eq!(parts, vec!["17", "5", "7"]);
    }

    #[test]
    fn web_api_marker_is_recognized() {
        let report: FlowReport = serde_json::from_str(r#"{"n":"web_api","u":0,"d":0}"#).unwrap();
        assert_eq!(report.name, "web_api");
    }
}
