//! Node-facing flow/config ingest endpoints (outside `/api/v1`, authenticated
//! by a node `secret` query parameter rather than a session JWT). Grounded
//! in `original_source/go-backend/handler/flow.go` and `service/flow.go`;
//! the heavy lifting lives in `crate::quota` (traffic accounting) and
//! `crate::orphan` (config-driven cleanup), this module only does the
//! secret lookup, decrypt, and JSON shape adaptation.

use axum::extract::{Query, State};
use serde::Deserialize;
use tracing::warn;

use crate::crypto::decrypt_if_needed;
use crate::http::AppState;
use crate::orphan::NodeInventory;

#[derive(Debug, Deserialize)]
pub struct SecretQuery {
    #[serde(default)]
    secret: String,
}

async fn node_id_for_secret(state: &AppState, secret: &str) -> Option<i64> {
    if secret.is_empty() {
        return None;
    }
    sqlx::query_scalar("SELECT id FROM nodes WHERE secret = ?").bind(secret).fetch_optional(&state.pool).await.ok().flatten()
}

/// `POST /flow/upload`: GOST per-service traffic webhook.
pub async fn gost_upload(State(state): State<AppState>, Query(q): Query<SecretQuery>, body: String) -> &'static str {
    let Some(_node_id) = node_id_for_secret(&state, &q.secret).await else {
        warn!(secret = %q.secret, "gost flow upload: unknown node secret");
        return "ok";
    };
    let decrypted = decrypt_if_needed(&body, &q.secret);
    state.quota.process_flow_upload(&decrypted).await
}

/// `POST /flow/xray-upload`: Xray per-client traffic webhook.
pub async fn xray_upload(State(state): State<AppState>, Query(q): Query<SecretQuery>, body: String) -> &'static str {
    let Some(_node_id) = node_id_for_secret(&state, &q.secret).await else {
        warn!(secret = %q.secret, "xray flow upload: unknown node secret");
        return "ok";
    };
    let decrypted = decrypt_if_needed(&body, &q.secret);
    state.quota.process_xray_flow_upload(&decrypted).await
}

#[derive(Debug, Deserialize)]
struct NamedObject {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct GostConfigReport {
    #[serde(default)]
    services: Vec<NamedObject>,
    #[serde(default)]
    chains: Vec<NamedObject>,
    #[serde(default)]
    limiters: Vec<NamedObject>,
}

impl From<GostConfigReport> for NodeInventory {
    fn from(report: GostConfigReport) -> Self {
        NodeInventory {
            services: report.services.into_iter().map(|o| o.name).collect(),
            chains: report.chains.into_iter().map(|o| o.name).collect(),
            limiters: report.limiters.into_iter().map(|o| o.name).collect(),
        }
    }
}

/// `POST /flow/config`: a node's full GOST object inventory, used to sweep
/// orphans left behind by forwards/tunnels deleted while the node was
/// offline (§4.3 phase 4).
pub async fn flow_config(State(state): State<AppState>, Query(q): Query<SecretQuery>, body: String) -> &'static str {
    let Some(node_id) = node_id_for_secret(&state, &q.secret).await else {
        return "ok";
    };
    let decrypted = decrypt_if_needed(&body, &q.secret);
    let Ok(report) = serde_json::from_str::<GostConfigReport>(&decrypted) else {
        warn!(node_id, "gost config upload: invalid json");
        return "ok";
    };

    let pool = state.pool.clone();
    let bus = state.bus.clone();
    let inventory: NodeInventory = report.into();
    tokio::spawn(async move {
        let result = crate::orphan::cleanup_node(&pool, &bus, node_id, &inventory).await;
        if result.deleted_services > 0 || result.deleted_chains > 0 || result.deleted_limiters > 0 {
            tracing::info!(node_id, ?result, "cleaned up orphaned node objects");
        }
    });

    "ok"
}

/// `GET|POST /flow/test`: a liveness probe the node binary pings at boot.
pub async fn flow_test() -> &'static str {
    "test"
}
