//! Service programmer (§4.2): turns a `(forward, tunnel, node)` tuple into
//! node session bus commands, and — the centerpiece — classifies a forward
//! update into the cheapest safe path: hot-update a forwarder in place,
//! skip entirely, or rebuild the listener. Grounded directly in
//! `original_source/go-backend/service/forward.go::UpdateForward`, whose
//! branch structure (tunnel changed / listen-ip changed / port+interface
//! same / addr-only changed) is reproduced here as an explicit enum rather
//! than inline booleans, which is the idiomatic-Rust rendering of the same
//! decision table.

pub mod gost;
pub mod xray_cmds;

use crate::domain::{Forward, Node, Tunnel, naming};
use crate::node_bus::{NodeBus, wire::NodeResponse};

/// What changed between the stored forward and the requested update,
/// already classified into the three paths `UpdateForward` distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePlan {
    /// Tunnel or listen-IP changed: delete old services, create new ones
    /// against the (possibly different) target node pair.
    Rebuild,
    /// Only the remote target list / load-balancing strategy changed:
    /// update just the forwarder, no listener restart.
    HotUpdateForwarder,
    /// Port or interface-binding changed, same tunnel: must recreate the
    /// listener via `UpdateService`, but the service name is unchanged.
    RecreateListener,
    /// Nothing service-affecting changed (e.g. only the display name).
    Noop,
}

pub fn classify_update(existing: &Forward, updated: &Forward, tunnel_changed: bool) -> UpdatePlan {
    if tunnel_changed {
        return UpdatePlan::Rebuild;
    }
    if existing.listen_ip != updated.listen_ip {
        return UpdatePlan::Rebuild;
    }

    let port_same = existing.in_port == updated.in_port;
    let interface_same = existing.interface_name == updated.interface_name;
    let addr_changed = existing.remote_addr != updated.remote_addr || existing.strategy != updated.strategy;

    if port_same && interface_same && addr_changed {
        UpdatePlan::HotUpdateForwarder
    } else if port_same && interface_same {
        UpdatePlan::Noop
    } else {
        UpdatePlan::RecreateListener
    }
}

fn base_name(forward: &Forward) -> String {
    naming::service_base_name(forward.id, forward.user_id, forward.user_tunnel_id)
}

/// One entry per node-side service pair a forward produces: the (indexed or
/// plain) base name plus the listen addresses that pair binds to. A
/// single-IP (or no override) forward produces exactly one entry named
/// after the plain base; a comma-separated `listen_ip` produces one
/// `_<index>`-suffixed entry per IP (§4.2 "Multi-IP listen").
fn listen_targets<'a>(forward: &'a Forward, tunnel: &'a Tunnel) -> Vec<(String, &'a str, &'a str)> {
    let base = base_name(forward);
    let ips = forward.listen_ips();
    match ips.len() {
        0 => vec![(base, tunnel.tcp_listen_addr.as_str(), tunnel.udp_listen_addr.as_str())],
        1 => vec![(base, ips[0], ips[0])],
        _ => ips
            .into_iter()
            .enumerate()
            .map(|(i, ip)| (naming::indexed_base(&base, i), ip, ip))
            .collect(),
    }
}

fn service_params<'a>(
    svc_base: String,
    forward: &'a Forward,
    tunnel: &'a Tunnel,
    tcp_listen_addr: &'a str,
    udp_listen_addr: &'a str,
    limiter: Option<i64>,
) -> gost::ServiceParams<'a> {
    gost::ServiceParams {
        base_name: svc_base,
        in_port: forward.in_port,
        limiter,
        remote_addr: &forward.remote_addr,
        is_relay: tunnel.is_relay(),
        tcp_listen_addr,
        udp_listen_addr,
        strategy: &forward.strategy,
        interface_name: &forward.interface_name,
    }
}

/// Creates the full service set for a new forward: for a relay tunnel this
/// is a chain plus an entry service on the in-node and a remote (`_tls`)
/// service on the out-node; for a direct tunnel just the entry service(s).
/// Chain and remote-service names are never indexed, even for a multi-IP
/// listen forward (§4.2).
///
/// Returns whether any piece already existed on the node (`true`) —
/// callers use this to decide whether a follow-up hot-update is needed to
/// reassert the forwarder target non-disruptively, since "already exists"
/// only proves the listener is present, not that it points at the current
/// remote address or strategy (the add-first-then-demote-to-update
/// strategy, §4.3).
pub async fn create_forward(
    bus: &NodeBus,
    forward: &Forward,
    tunnel: &Tunnel,
    in_node: &Node,
    out_node: Option<&Node>,
    limiter: Option<i64>,
) -> Result<bool, String> {
    let name = base_name(forward);
    let mut already_existed = false;

    if tunnel.is_relay() {
        let out_node = out_node.ok_or("中转隧道缺少出口节点")?;
        let chain = gost::add_chains(bus, in_node.id, &name, &out_node.ip, &tunnel.protocol, &forward.interface_name).await;
        if !chain.is_ok() && !chain.is_already_exists() {
            return Err(chain.message);
        }
        already_existed |= chain.is_already_exists();
        let remote = gost::add_remote_service(
            bus,
            out_node.id,
            &name,
            forward.out_port,
            &forward.remote_addr,
            &tunnel.protocol,
            &forward.strategy,
            &forward.interface_name,
        )
        .await;
        if !remote.is_ok() && !remote.is_already_exists() {
            return Err(remote.message);
        }
        already_existed |= remote.is_already_exists();
    }

    for (svc_base, tcp_addr, udp_addr) in listen_targets(forward, tunnel) {
        let params = service_params(svc_base, forward, tunnel, tcp_addr, udp_addr, limiter);
        let result = gost::add_service(bus, in_node.id, &params).await;
        if !result.is_ok() && !result.is_already_exists() {
            return Err(result.message);
        }
        already_existed |= result.is_already_exists();
    }
    Ok(already_existed)
}

/// Reasserts a forward's current remote target on an already-present
/// listener, without touching the listener itself. The non-disruptive half
/// of the add-first-then-demote-to-update strategy: called after
/// [`create_forward`] reports `already_existed`.
pub async fn reassert_forward_target(bus: &NodeBus, forward: &Forward, tunnel: &Tunnel, in_node: &Node, out_node: Option<&Node>) -> NodeResponse {
    let name = base_name(forward);
    if tunnel.is_relay() {
        match out_node {
            Some(out_node) => gost::update_remote_forwarder(bus, out_node.id, &name, &forward.remote_addr, &forward.strategy).await,
            None => NodeResponse {
                message: "中转隧道缺少出口节点".to_string(),
                data: serde_json::Value::Null,
            },
        }
    } else {
        gost::update_forwarder(bus, in_node.id, &name, &forward.remote_addr, &forward.strategy).await
    }
}

pub async fn delete_forward(bus: &NodeBus, forward: &Forward, tunnel: &Tunnel, in_node: &Node, out_node: Option<&Node>) -> Result<(), String> {
    let name = base_name(forward);
    for (svc_base, _, _) in listen_targets(forward, tunnel) {
        let result = gost::delete_service(bus, in_node.id, &svc_base).await;
        if !result.is_ok() && !result.is_not_found() {
            return Err(result.message);
        }
    }
    if tunnel.is_relay() {
        if let Some(out_node) = out_node {
            let _ = gost::delete_remote_service(bus, out_node.id, &name).await;
        }
        let _ = gost::delete_chains(bus, in_node.id, &name).await;
    }
    Ok(())
}

/// All node-side service-pair base names a forward currently occupies;
/// used by pause/resume call sites so a multi-IP forward's full name set is
/// enumerated rather than leaking the un-indexed entries (§4.2).
pub fn forward_service_base_names(forward: &Forward, tunnel: &Tunnel) -> Vec<String> {
    listen_targets(forward, tunnel).into_iter().map(|(base, _, _)| base).collect()
}

/// Applies an [`UpdatePlan`] to node state, falling back to
/// [`UpdatePlan::RecreateListener`]'s path when a hot update fails —
/// exactly as `UpdateForward` falls back to `updateGostServices` when
/// `isGostSuccess(hotResult)` is false.
pub async fn apply_update(
    bus: &NodeBus,
    plan: UpdatePlan,
    existing: &Forward,
    updated: &Forward,
    tunnel: &Tunnel,
    in_node: &Node,
    out_node: Option<&Node>,
    limiter: Option<i64>,
) -> Result<(), String> {
    match plan {
        UpdatePlan::Noop => Ok(()),
        UpdatePlan::Rebuild => {
            delete_forward(bus, existing, tunnel, in_node, out_node).await?;
            create_forward(bus, updated, tunnel, in_node, out_node, limiter).await.map(|_| ())
        }
        UpdatePlan::RecreateListener => {
            for (svc_base, tcp_addr, udp_addr) in listen_targets(updated, tunnel) {
                let params = service_params(svc_base, updated, tunnel, tcp_addr, udp_addr, limiter);
                let result = gost::update_service(bus, in_node.id, &params).await;
                if !result.is_ok() {
                    return Err(result.message);
                }
            }
            Ok(())
        }
        UpdatePlan::HotUpdateForwarder => {
            let name = base_name(updated);
            let hot: NodeResponse = if tunnel.is_relay() {
                match out_node {
                    Some(out_node) => gost::update_remote_forwarder(bus, out_node.id, &name, &updated.remote_addr, &updated.strategy).await,
                    None => return Err("中转隧道缺少出口节点".to_string()),
                }
            } else {
                gost::update_forwarder(bus, in_node.id, &name, &updated.remote_addr, &updated.strategy).await
            };
            if hot.is_ok() {
                return Ok(());
            }
            for (svc_base, tcp_addr, udp_addr) in listen_targets(updated, tunnel) {
                let params = service_params(svc_base, updated, tunnel, tcp_addr, udp_addr, limiter);
                let fallback = gost::update_service(bus, in_node.id, &params).await;
                if !fallback.is_ok() {
                    return Err(fallback.message);
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forward(in_port: i32, interface_name: &str, remote_addr: &str, strategy: &str, listen_ip: &str) -> Forward {
        Forward {
            id: 1,
            user_id: 5,
            tunnel_id: 7,
            user_tunnel_id: 3,
            name: "f".to_string(),
            in_port,
            out_port: 0,
            remote_addr: remote_addr.to_string(),
            strategy: strategy.to_string(),
            listen_ip: listen_ip.to_string(),
            interface_name: interface_name.to_string(),
            in_flow: 0,
            out_flow: 0,
            order_index: 0,
            status: 1,
            created_time: 0,
            updated_time: 0,
        }
    }

    #[test]
    fn addr_only_change_is_hot_update() {
        let existing = forward(100, "", "1.1.1.1:80", "fifo", "");
        let updated = forward(100, "", "2.2.2.2:80", "fifo", "");
        assert_eq!(classify_update(&existing, &updated, false), UpdatePlan::HotUpdateForwarder);
    }

    #[test]
    fn port_change_requires_listener_recreate() {
        let existing = forward(100, "", "1.1.1.1:80", "fifo", "");
        let updated = forward(200, "", "1.1.1.1:80", "fifo", "");
        assert_eq!(classify_update(&existing, &updated, false), UpdatePlan::RecreateListener);
    }

    #[test]
    fn listen_ip_change_forces_rebuild_even_without_tunnel_change() {
        let existing = forward(100, "", "1.1.1.1:80", "fifo", "");
        let updated = forward(100, "", "1.1.1.1:80", "fifo", "10.0.0.5");
        assert_eq!(classify_update(&existing, &updated, false), UpdatePlan::Rebuild);
    }

    #[test]
    fn tunnel_change_always_rebuilds() {
        let existing = forward(100, "", "1.1.1.1:80", "fifo", "");
        let updated = forward(100, "", "1.1.1.1:80", "fifo", "");
        assert_eq!(classify_update(&existing, &updated, true), UpdatePlan::Rebuild);
    }

    #[test]
    fn name_only_change_is_noop() {
        let existing = forward(100, "", "1.1.1.1:80", "fifo", "");
        let updated = forward(100, "", "1.1.1.1:80", "fifo", "");
        assert_eq!(classify_update(&existing, &updated, false), UpdatePlan::Noop);
    }
}
