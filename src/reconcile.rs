//! Per-node desired-state reconciler (§4.3), run whenever a node connects
//! or re-connects. Four phases, each best-effort (a failure in one phase
//! does not abort the rest): limiters, GOST forwards, Xray inbounds,
//! Xray certificates. Phase order and per-phase queries are grounded in
//! `original_source/go-backend/service/reconcile.go`.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;
use sqlx::MySqlPool;
use tokio::sync::Mutex;

use crate::domain::{FORWARD_STATUS_PAUSED, Forward, Node, SpeedLimit, Tunnel, UserTunnel, XrayInbound, XrayTlsCert};
use crate::node_bus::NodeBus;
use crate::programmer::{gost, xray_cmds};

#[derive(Debug, Default, Serialize)]
pub struct ReconcileResult {
    pub node_id: i64,
    pub limiters: u32,
    pub forwards: u32,
    pub inbounds: u32,
    pub certs: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    pub duration_ms: i64,
}

/// Per-node mutual exclusion so overlapping reconcile triggers (connect +
/// manual re-sync) don't race each other; mirrors the Go side's
/// `sync.Map`-of-`*sync.Mutex` idiom with `TryLock`.
#[derive(Clone)]
pub struct ReconcileHandle {
    locks: Arc<DashMap<i64, Arc<Mutex<()>>>>,
    pool: MySqlPool,
    bus: NodeBus,
}

impl ReconcileHandle {
    pub fn new(pool: MySqlPool, bus: NodeBus) -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
            pool,
            bus,
        }
    }

    fn lock_for(&self, node_id: i64) -> Arc<Mutex<()>> {
        self.locks.entry(node_id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    pub async fn reconcile_node(&self, node_id: i64) -> ReconcileResult {
        let lock = self.lock_for(node_id);
        let Ok(_guard) = lock.try_lock() else {
            return ReconcileResult {
                node_id,
                errors: vec!["另一个同步任务正在执行".to_string()],
                ..Default::default()
            };
        };

        let start = Instant::now();
        let mut result = ReconcileResult {
            node_id,
            ..Default::default()
        };

        reconcile_limiters(&self.pool, &self.bus, node_id, &mut result).await;
        reconcile_forwards(&self.pool, &self.bus, node_id, &mut result).await;
        reconcile_xray_inbounds(&self.pool, &self.bus, node_id, &mut result).await;
        reconcile_xray_certs(&self.pool, &self.bus, node_id, &mut result).await;

        result.duration_ms = start.elapsed().as_millis() as i64;
        tracing::info!(
            node_id,
            limiters = result.limiters,
            forwards = result.forwards,
            inbounds = result.inbounds,
            certs = result.certs,
            duration_ms = result.duration_ms,
            error_count = result.errors.len(),
            "reconcile complete"
        );
        result
    }
}

async fn reconcile_limiters(pool: &MySqlPool, bus: &NodeBus, node_id: i64, result: &mut ReconcileResult) {
    let tunnels: Vec<Tunnel> = match sqlx::query_as("SELECT * FROM tunnels WHERE in_node_id = ?")
        .bind(node_id)
        .fetch_all(pool)
        .await
    {
        Ok(rows) => rows,
        Err(e) => {
            result.errors.push(format!("隧道查询失败: {e}"));
            return;
        }
    };

    let mut seen = std::collections::HashSet::new();
    for tunnel in &tunnels {
        let user_tunnels: Vec<UserTunnel> =
            sqlx::query_as("SELECT * FROM user_tunnels WHERE tunnel_id = ? AND speed_id IS NOT NULL AND speed_id > 0")
                .bind(tunnel.id)
                .fetch_all(pool)
                .await
                .unwrap_or_default();

        for ut in &user_tunnels {
            let Some(speed_id) = ut.speed_id else { continue };
            if speed_id <= 0 || !seen.insert(speed_id) {
                continue;
            }
            let Ok(Some(speed_limit)) = sqlx::query_as::<_, SpeedLimit>("SELECT * FROM speed_limits WHERE id = ?")
                .bind(speed_id)
                .fetch_optional(pool)
                .await
            else {
                continue;
            };
            let r = gost::add_limiter(bus, node_id, speed_id, speed_limit.speed).await;
            if !r.is_ok() {
                result.errors.push(format!("限速器 {speed_id}: {}", r.message));
            }
            result.limiters += 1;
        }
    }
}

async fn reconcile_forwards(pool: &MySqlPool, bus: &NodeBus, node_id: i64, result: &mut ReconcileResult) {
    let tunnels: Vec<Tunnel> = sqlx::query_as("SELECT * FROM tunnels WHERE in_node_id = ? OR out_node_id = ?")
        .bind(node_id)
        .bind(node_id)
        .fetch_all(pool)
        .await
        .unwrap_or_default();

    for tunnel in &tunnels {
        let forwards: Vec<Forward> = sqlx::query_as("SELECT * FROM forwards WHERE tunnel_id = ?")
            .bind(tunnel.id)
            .fetch_all(pool)
            .await
            .unwrap_or_default();

        let in_node: Option<Node> = sqlx::query_as("SELECT * FROM nodes WHERE id = ?")
            .bind(tunnel.in_node_id)
            .fetch_optional(pool)
            .await
            .unwrap_or(None);
        let out_node: Option<Node> = if tunnel.is_relay() {
            sqlx::query_as("SELECT * FROM nodes WHERE id = ?")
                .bind(tunnel.out_node_id)
                .fetch_optional(pool)
                .await
                .unwrap_or(None)
        } else {
            None
        };
        let Some(in_node) = in_node else {
            result.errors.push(format!("隧道 {} 节点错误: 入口节点不存在", tunnel.id));
            continue;
        };
        if tunnel.is_relay() && out_node.is_none() {
            result.errors.push(format!("隧道 {} 节点错误: 出口节点不存在", tunnel.id));
            continue;
        }

        for forward in &forwards {
            let user_tunnel: Option<UserTunnel> =
                sqlx::query_as("SELECT * FROM user_tunnels WHERE user_id = ? AND tunnel_id = ?")
                    .bind(forward.user_id)
                    .bind(forward.tunnel_id)
                    .fetch_optional(pool)
                    .await
                    .unwrap_or(None);
            let limiter = user_tunnel.as_ref().and_then(|ut| ut.speed_id).filter(|id| *id > 0);

            match crate::programmer::create_forward(bus, forward, tunnel, &in_node, out_node.as_ref(), limiter).await {
                Ok(true) => {
                    // Listener survived on the node; reassert the current
                    // target non-disruptively instead of leaving it stale.
                    let reassert = crate::programmer::reassert_forward_target(bus, forward, tunnel, &in_node, out_node.as_ref()).await;
                    if !reassert.is_ok() {
                        result.errors.push(format!("转发 {} 目标同步失败: {}", forward.id, reassert.message));
                    }
                }
                Ok(false) => {}
                Err(e) => result.errors.push(format!("转发 {}: {e}", forward.id)),
            }
            result.forwards += 1;

            if forward.status == FORWARD_STATUS_PAUSED {
                let name = crate::domain::naming::service_base_name(forward.id, forward.user_id, forward.user_tunnel_id);
                if tunnel.in_node_id == node_id {
                    for svc_base in crate::programmer::forward_service_base_names(forward, tunnel) {
                        let _ = gost::pause_service(bus, node_id, &svc_base).await;
                    }
                }
                if tunnel.is_relay() && tunnel.out_node_id == node_id {
                    let _ = gost::pause_remote_service(bus, node_id, &name).await;
                }
            }
        }
    }
}

/// Reconciles Xray inbounds by trying the cheap path first — hot-add each
/// enabled inbound individually, tolerating "already exists" — and only
/// falling back to a full `XrayApplyConfig` when a hot-add fails for a
/// reason other than "already exists" (most commonly because the engine
/// isn't running yet and has no state to hot-add into). Stops the engine
/// outright when there is nothing to serve (§4.3 phase 3).
async fn reconcile_xray_inbounds(pool: &MySqlPool, bus: &NodeBus, node_id: i64, result: &mut ReconcileResult) {
    let inbounds: Vec<XrayInbound> = sqlx::query_as("SELECT * FROM xray_inbounds WHERE node_id = ? AND enable = 1")
        .bind(node_id)
        .fetch_all(pool)
        .await
        .unwrap_or_default();

    if inbounds.is_empty() {
        let r = xray_cmds::stop(bus, node_id).await;
        if !r.is_ok() && !r.is_engine_not_running() {
            result.errors.push(format!("Xray 停止: {}", r.message));
        }
        result.inbounds = 0;
        return;
    }

    let mut items: Vec<(XrayInbound, Vec<crate::domain::XrayClient>)> = Vec::with_capacity(inbounds.len());
    for inbound in inbounds {
        let clients: Vec<crate::domain::XrayClient> =
            sqlx::query_as("SELECT * FROM xray_clients WHERE inbound_id = ? AND enable = 1")
                .bind(inbound.id)
                .fetch_all(pool)
                .await
                .unwrap_or_default();
        items.push((inbound, clients));
    }

    let mut needs_full_apply = false;
    for (inbound, clients) in &items {
        let r = xray_cmds::add_inbound(bus, node_id, inbound, clients).await;
        if !r.is_ok() && !r.is_already_exists() {
            if r.is_engine_not_running() {
                needs_full_apply = true;
                break;
            }
            result.errors.push(format!("Xray 入站 {}: {}", inbound.tag, r.message));
        }
    }

    if needs_full_apply {
        let r = xray_cmds::apply_config(bus, node_id, &items).await;
        if !r.is_ok() {
            result.errors.push(format!("Xray 入站: {}", r.message));
        }
    }

    result.inbounds = items.len() as u32;
}

async fn reconcile_xray_certs(pool: &MySqlPool, bus: &NodeBus, node_id: i64, result: &mut ReconcileResult) {
    let certs: Vec<XrayTlsCert> = sqlx::query_as("SELECT * FROM xray_tls_certs WHERE node_id = ?")
        .bind(node_id)
        .fetch_all(pool)
        .await
        .unwrap_or_default();

    for cert in &certs {
        if cert.public_key.is_empty() || cert.private_key.is_empty() {
            continue;
        }
        let r = xray_cmds::deploy_cert(bus, node_id, &cert.domain, &cert.public_key, &cert.private_key).await;
        if !r.is_ok() {
            result.errors.push(format!("证书 {}: {}", cert.domain, r.message));
        }
        result.certs += 1;
    }
}
