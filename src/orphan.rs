//! Orphan cleanup (§4.3 phase 4, implicit): a node periodically pushes its
//! own GOST service/chain/limiter inventory; anything in that inventory
//! that no longer corresponds to DB state gets deleted. This is the
//! counterpart to the reconcile phases in `reconcile.rs`, which only ever
//! add or update — without this pass, a deleted forward's listener would
//! linger on the node forever. Grounded in
//! `original_source/go-backend/service/reconcile.go`'s inventory diff.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sqlx::MySqlPool;

use crate::domain::naming::{self, InventoryNameKind};
use crate::domain::{Forward, TUNNEL_TYPE_RELAY, Tunnel};
use crate::node_bus::NodeBus;
use crate::programmer::gost;

/// The node's self-reported inventory of live GOST objects, keyed the same
/// way the node names them: `services` holds `_tcp`/`_udp`/`_tls`-suffixed
/// names, `chains` holds `_chains`-suffixed names, `limiters` holds bare
/// numeric ids as strings.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct NodeInventory {
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub chains: Vec<String>,
    #[serde(default)]
    pub limiters: Vec<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct CleanupResult {
    pub deleted_services: u32,
    pub deleted_chains: u32,
    pub deleted_limiters: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Base names (indexed, for multi-IP listens) of every TCP/UDP service pair
/// this node should be hosting as a listener.
async fn valid_in_node_bases(pool: &MySqlPool, node_id: i64) -> HashSet<String> {
    let tunnels: Vec<Tunnel> = sqlx::query_as("SELECT * FROM tunnels WHERE in_node_id = ?")
        .bind(node_id)
        .fetch_all(pool)
        .await
        .unwrap_or_default();

    let mut bases = HashSet::new();
    for tunnel in &tunnels {
        let forwards: Vec<Forward> = sqlx::query_as("SELECT * FROM forwards WHERE tunnel_id = ?")
            .bind(tunnel.id)
            .fetch_all(pool)
            .await
            .unwrap_or_default();
        for forward in &forwards {
            bases.extend(crate::programmer::forward_service_base_names(forward, tunnel));
        }
    }
    bases
}

/// Un-indexed base names of chains this node (as the relay entry) should
/// still have — chains are never indexed even for a multi-IP forward.
async fn valid_chain_bases(pool: &MySqlPool, node_id: i64) -> HashSet<String> {
    let tunnels: Vec<Tunnel> = sqlx::query_as("SELECT * FROM tunnels WHERE in_node_id = ? AND type = ?")
        .bind(node_id)
        .bind(TUNNEL_TYPE_RELAY)
        .fetch_all(pool)
        .await
        .unwrap_or_default();

    let mut bases = HashSet::new();
    for tunnel in &tunnels {
        let forward_ids: Vec<(i64, i64, i64)> = sqlx::query_as("SELECT id, user_id, user_tunnel_id FROM forwards WHERE tunnel_id = ?")
            .bind(tunnel.id)
            .fetch_all(pool)
            .await
            .unwrap_or_default();
        for (id, user_id, user_tunnel_id) in forward_ids {
            bases.insert(naming::service_base_name(id, user_id, user_tunnel_id));
        }
    }
    bases
}

/// Un-indexed base names of remote (`_tls`) services this node, as a
/// relay's out-node, should still be hosting.
async fn valid_out_node_bases(pool: &MySqlPool, node_id: i64) -> HashSet<String> {
    let tunnels: Vec<Tunnel> = sqlx::query_as("SELECT * FROM tunnels WHERE out_node_id = ? AND type = ?")
        .bind(node_id)
        .bind(TUNNEL_TYPE_RELAY)
        .fetch_all(pool)
        .await
        .unwrap_or_default();

    let mut bases = HashSet::new();
    for tunnel in &tunnels {
        let forward_ids: Vec<(i64, i64, i64)> = sqlx::query_as("SELECT id, user_id, user_tunnel_id FROM forwards WHERE tunnel_id = ?")
            .bind(tunnel.id)
            .fetch_all(pool)
            .await
            .unwrap_or_default();
        for (id, user_id, user_tunnel_id) in forward_ids {
            bases.insert(naming::service_base_name(id, user_id, user_tunnel_id));
        }
    }
    bases
}

/// Speed-limit ids still referenced by a user-tunnel whose tunnel touches
/// this node, on either side.
async fn valid_limiter_ids(pool: &MySqlPool, node_id: i64) -> HashSet<String> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        "SELECT DISTINCT ut.speed_id FROM user_tunnels ut JOIN tunnels t ON t.id = ut.tunnel_id \
         WHERE (t.in_node_id = ? OR t.out_node_id = ?) AND ut.speed_id IS NOT NULL AND ut.speed_id > 0",
    )
    .bind(node_id)
    .bind(node_id)
    .fetch_all(pool)
    .await
    .unwrap_or_default();
    rows.into_iter().map(|(id,)| id.to_string()).collect()
}

/// Diffs a node's self-reported inventory against DB-derived desired state
/// and deletes whatever no longer belongs, one object at a time so a
/// single failure doesn't block the rest.
pub async fn cleanup_node(pool: &MySqlPool, bus: &NodeBus, node_id: i64, inventory: &NodeInventory) -> CleanupResult {
    let mut result = CleanupResult::default();
    let in_bases = valid_in_node_bases(pool, node_id).await;
    let chain_bases = valid_chain_bases(pool, node_id).await;
    let out_bases = valid_out_node_bases(pool, node_id).await;
    let limiter_ids = valid_limiter_ids(pool, node_id).await;

    for name in &inventory.services {
        let (kind, base) = naming::classify_inventory_name(name);
        match kind {
            InventoryNameKind::Service if !in_bases.contains(base) => {
                let r = gost::delete_service(bus, node_id, base).await;
                if r.is_ok() || r.is_not_found() {
                    result.deleted_services += 1;
                } else {
                    result.errors.push(format!("service {name}: {}", r.message));
                }
            }
            InventoryNameKind::RemoteService if !out_bases.contains(base) => {
                let r = gost::delete_remote_service(bus, node_id, base).await;
                if r.is_ok() || r.is_not_found() {
                    result.deleted_services += 1;
                } else {
                    result.errors.push(format!("remote service {name}: {}", r.message));
                }
            }
            _ => {}
        }
    }

    for name in &inventory.chains {
        let (kind, base) = naming::classify_inventory_name(name);
        if kind == InventoryNameKind::Chain && !chain_bases.contains(base) {
            let r = gost::delete_chains(bus, node_id, base).await;
            if r.is_ok() || r.is_not_found() {
                result.deleted_chains += 1;
            } else {
                result.errors.push(format!("chain {name}: {}", r.message));
            }
        }
    }

    for name in &inventory.limiters {
        if limiter_ids.contains(name) {
            continue;
        }
        let Ok(limiter_id) = name.parse::<i64>() else { continue };
        let r = gost::delete_limiter(bus, node_id, limiter_id).await;
        if r.is_ok() || r.is_not_found() {
            result.deleted_limiters += 1;
        } else {
            result.errors.push(format!("limiter {name}: {}", r.message));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inventory_deserializes_from_node_push() {
        let inv: NodeInventory = serde_json::from_str(r#"{"services":["1_2_0_tcp"],"chains":[],"limiters":["9"]}"#).unwrap();
        assert_eq!(inv.services, vec!["1_2_0_tcp"]);
        assert_eq!(inv.limiters, vec!["9"]);
    }

    #[test]
    fn classify_drives_the_right_bucket() {
        let (kind, base) = naming::classify_inventory_name("1_2_0_tls");
        assert_eq!(kind, InventoryNameKind::RemoteService);
        assert_eq!(base, "1_2_0");
    }
}
