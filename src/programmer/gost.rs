//! GOST (engine-1) service/chain/limiter command builders — the JSON shapes
//! a node's GOST supervisor expects over the node session bus. Grounded
//! directly in `original_source/go-backend/pkg/gost.go`: command names,
//! field names, and the `_tcp`/`_udp`/`_tls`/`_chains` naming convention are
//! reproduced verbatim, not redesigned (the core Non-goal is "no new wire
//! codec for GOST/Xray").

use serde_json::{Value, json};

use crate::domain::naming;
use crate::node_bus::{NodeBus, wire::NodeResponse};

fn format_listen_addr(ip: &str, port: i32) -> String {
    if ip.contains(':') {
        format!("[{ip}]:{port}")
    } else {
        format!("{ip}:{port}")
    }
}

fn build_forwarder(remote_addr: &str, strategy: &str) -> Value {
    let nodes: Vec<Value> = remote_addr
        .split(',')
        .enumerate()
        .map(|(i, addr)| {
            json!({
                "name": naming::forwarder_node_name(i + 1),
                "addr": addr.trim(),
            })
        })
        .collect();
    let strategy = if strategy.is_empty() { "fifo" } else { strategy };
    json!({
        "nodes": nodes,
        "selector": {
            "strategy": strategy,
            "maxFails": 1,
            "failTimeout": "600s",
        }
    })
}

/// Parameters shared by the two base-name services (tcp+udp) a direct or
/// relay-entry forward produces.
pub struct ServiceParams<'a> {
    pub base_name: String,
    pub in_port: i32,
    pub limiter: Option<i64>,
    pub remote_addr: &'a str,
    pub is_relay: bool,
    pub tcp_listen_addr: &'a str,
    pub udp_listen_addr: &'a str,
    pub strategy: &'a str,
    pub interface_name: &'a str,
}

fn build_service_config(params: &ServiceParams, protocol: &str) -> Value {
    let mut svc = serde_json::Map::new();
    svc.insert(
        "name".into(),
        json!(if protocol == "tcp" {
            naming::tcp_service_name(&params.base_name)
        } else {
            naming::udp_service_name(&params.base_name)
        }),
    );
    let addr = if protocol == "tcp" {
        format_listen_addr(params.tcp_listen_addr, params.in_port)
    } else {
        format_listen_addr(params.udp_listen_addr, params.in_port)
    };
    svc.insert("addr".into(), json!(addr));

    if !params.interface_name.is_empty() {
        svc.insert("metadata".into(), json!({"interface": params.interface_name}));
    }
    if let Some(limiter) = params.limiter {
        svc.insert("limiter".into(), json!(limiter.to_string()));
    }

    let mut handler = serde_json::Map::new();
    handler.insert("type".into(), json!(protocol));
    if params.is_relay {
        handler.insert("chain".into(), json!(naming::chain_name(&params.base_name)));
    }
    svc.insert("handler".into(), Value::Object(handler));

    let mut listener = serde_json::Map::new();
    listener.insert("type".into(), json!(protocol));
    if protocol == "udp" {
        listener.insert("metadata".into(), json!({"keepAlive": true}));
    }
    svc.insert("listener".into(), Value::Object(listener));

    if !params.is_relay {
        svc.insert("forwarder".into(), build_forwarder(params.remote_addr, params.strategy));
    }

    Value::Object(svc)
}

fn build_services(params: &ServiceParams) -> Value {
    json!([
        build_service_config(params, "tcp"),
        build_service_config(params, "udp"),
    ])
}

fn build_remote_service(base_name: &str, out_port: i32, remote_addr: &str, protocol: &str, strategy: &str, interface_name: &str) -> Value {
    let mut svc = serde_json::Map::new();
    svc.insert("name".into(), json!(naming::remote_service_name(base_name)));
    svc.insert("addr".into(), json!(format!(":{out_port}")));
    if !interface_name.is_empty() {
        svc.insert("metadata".into(), json!({"interface": interface_name}));
    }
    svc.insert("handler".into(), json!({"type": "relay"}));
    svc.insert("listener".into(), json!({"type": protocol}));
    svc.insert("forwarder".into(), build_forwarder(remote_addr, strategy));
    Value::Object(svc)
}

fn build_chain_data(base_name: &str, remote_addr: &str, protocol: &str, interface_name: &str) -> Value {
    let mut dialer = serde_json::Map::new();
    dialer.insert("type".into(), json!(protocol));
    if protocol == "quic" {
        dialer.insert("metadata".into(), json!({"keepAlive": true, "ttl": "10s"}));
    }

    let mut node = serde_json::Map::new();
    node.insert("name".into(), json!(naming::chain_node_name(base_name)));
    node.insert("addr".into(), json!(remote_addr));
    node.insert("connector".into(), json!({"type": "relay"}));
    node.insert("dialer".into(), Value::Object(dialer));
    if !interface_name.is_empty() {
        node.insert("interface".into(), json!(interface_name));
    }

    json!({
        "name": naming::chain_name(base_name),
        "hops": [{
            "name": naming::chain_hop_name(base_name),
            "nodes": [Value::Object(node)],
        }]
    })
}

fn create_limiter_data(name: i64, speed_mb: i64) -> Value {
    json!({
        "name": name.to_string(),
        "limits": [format!("$ {speed_mb}MB {speed_mb}MB")],
    })
}

pub async fn add_service(bus: &NodeBus, node_id: i64, params: &ServiceParams<'_>) -> NodeResponse {
    bus.send_msg(node_id, "AddService", build_services(params)).await
}

pub async fn update_service(bus: &NodeBus, node_id: i64, params: &ServiceParams<'_>) -> NodeResponse {
    bus.send_msg(node_id, "UpdateService", build_services(params)).await
}

pub async fn delete_service(bus: &NodeBus, node_id: i64, base_name: &str) -> NodeResponse {
    let data = json!({ "services": [naming::tcp_service_name(base_name), naming::udp_service_name(base_name)] });
    bus.send_msg(node_id, "DeleteService", data).await
}

pub async fn pause_service(bus: &NodeBus, node_id: i64, base_name: &str) -> NodeResponse {
    let data = json!({ "services": [naming::tcp_service_name(base_name), naming::udp_service_name(base_name)] });
    bus.send_msg(node_id, "PauseService", data).await
}

pub async fn resume_service(bus: &NodeBus, node_id: i64, base_name: &str) -> NodeResponse {
    let data = json!({ "services": [naming::tcp_service_name(base_name), naming::udp_service_name(base_name)] });
    bus.send_msg(node_id, "ResumeService", data).await
}

#[allow(clippy::too_many_arguments)]
pub async fn add_remote_service(
    bus: &NodeBus,
    node_id: i64,
    base_name: &str,
    out_port: i32,
    remote_addr: &str,
    protocol: &str,
    strategy: &str,
    interface_name: &str,
) -> NodeResponse {
    let service = build_remote_service(base_name, out_port, remote_addr, protocol, strategy, interface_name);
    bus.send_msg(node_id, "AddService", json!([service])).await
}

#[allow(clippy::too_many_arguments)]
pub async fn update_remote_service(
    bus: &NodeBus,
    node_id: i64,
    base_name: &str,
    out_port: i32,
    remote_addr: &str,
    protocol: &str,
    strategy: &str,
    interface_name: &str,
) -> NodeResponse {
    let service = build_remote_service(base_name, out_port, remote_addr, protocol, strategy, interface_name);
    bus.send_msg(node_id, "UpdateService", json!([service])).await
}

pub async fn delete_remote_service(bus: &NodeBus, node_id: i64, base_name: &str) -> NodeResponse {
    let data = json!({ "services": [naming::remote_service_name(base_name)] });
    bus.send_msg(node_id, "DeleteService", data).await
}

pub async fn pause_remote_service(bus: &NodeBus, node_id: i64, base_name: &str) -> NodeResponse {
    let data = json!({ "services": [naming::remote_service_name(base_name)] });
    bus.send_msg(node_id, "PauseService", data).await
}

pub async fn resume_remote_service(bus: &NodeBus, node_id: i64, base_name: &str) -> NodeResponse {
    let data = json!({ "services": [naming::remote_service_name(base_name)] });
    bus.send_msg(node_id, "ResumeService", data).await
}

pub async fn add_chains(bus: &NodeBus, node_id: i64, base_name: &str, remote_addr: &str, protocol: &str, interface_name: &str) -> NodeResponse {
    let data = build_chain_data(base_name, remote_addr, protocol, interface_name);
    bus.send_msg(node_id, "AddChains", data).await
}

pub async fn update_chains(bus: &NodeBus, node_id: i64, base_name: &str, remote_addr: &str, protocol: &str, interface_name: &str) -> NodeResponse {
    let data = build_chain_data(base_name, remote_addr, protocol, interface_name);
    let req = json!({ "chain": naming::chain_name(base_name), "data": data });
    bus.send_msg(node_id, "UpdateChains", req).await
}

pub async fn delete_chains(bus: &NodeBus, node_id: i64, base_name: &str) -> NodeResponse {
    let data = json!({ "chain": naming::chain_name(base_name) });
    bus.send_msg(node_id, "DeleteChains", data).await
}

/// Hot-updates only the forwarder (target list + strategy) of an existing
/// direct-forward service, without touching its listener — the cheap path
/// `forward.go::UpdateForward` takes when only `remote_addr`/`strategy`
/// changed. The node-side command name is not present in the retrieved
/// source; it is inferred from the `UpdateLimiters`/`UpdateChains`
/// identifier-plus-data pairing already used throughout this file.
pub async fn update_forwarder(bus: &NodeBus, node_id: i64, base_name: &str, remote_addr: &str, strategy: &str) -> NodeResponse {
    let req = json!({
        "service": naming::tcp_service_name(base_name),
        "forwarder": build_forwarder(remote_addr, strategy),
    });
    bus.send_msg(node_id, "UpdateForwarder", req).await
}

/// Same hot path for a relay's exit-side `_tls` remote service.
pub async fn update_remote_forwarder(bus: &NodeBus, node_id: i64, base_name: &str, remote_addr: &str, strategy: &str) -> NodeResponse {
    let req = json!({
        "service": naming::remote_service_name(base_name),
        "forwarder": build_forwarder(remote_addr, strategy),
    });
    bus.send_msg(node_id, "UpdateRemoteForwarder", req).await
}

pub async fn add_limiter(bus: &NodeBus, node_id: i64, limiter_id: i64, speed_mb: i64) -> NodeResponse {
    bus.send_msg(node_id, "AddLimiters", create_limiter_data(limiter_id, speed_mb)).await
}

pub async fn update_limiter(bus: &NodeBus, node_id: i64, limiter_id: i64, speed_mb: i64) -> NodeResponse {
    let req = json!({ "limiter": limiter_id.to_string(), "data": create_limiter_data(limiter_id, speed_mb) });
    bus.send_msg(node_id, "UpdateLimiters", req).await
}

pub async fn delete_limiter(bus: &NodeBus, node_id: i64, limiter_id: i64) -> NodeResponse {
    let req = json!({ "limiter": limiter_id.to_string() });
    bus.send_msg(node_id, "DeleteLimiters", req).await
}

/// Instructs a node to fetch and install a new binary from `download_url`
/// and restart itself; used by the admin "check for update" flow.
pub async fn update_binary(bus: &NodeBus, node_id: i64, download_url: &str) -> NodeResponse {
    bus.send_msg(node_id, "NodeUpdateBinary", json!({ "url": download_url })).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_config_names_follow_naming_convention() {
        let params = ServiceParams {
            base_name: "17_5_7".to_string(),
            in_port: 10001,
            limiter: Some(9),
            remote_addr: "1.2.3.4:80,1.2.3.5:80",
            is_relay: false,
            tcp_listen_addr: "0.0.0.0",
            udp_listen_addr: "0.0.0.0",
            strategy: "",
            interface_name: "",
        };
        let services = build_services(&params);
        let tcp = &services[0];
        assert_eq!(tcp["name"], "17_5_7_tcp");
        assert_eq!(tcp["addr"], "0.0.0.0:10001");
        assert_eq!(tcp["limiter"], "9");
        assert!(tcp.get("forwarder").is_some());
        assert!(tcp["handler"].get("chain").is_none());
    }

    #[test]
    fn relay_service_references_chain_instead_of_forwarder() {
        let params = ServiceParams {
            base_name: "17_5_7".to_string(),
            in_port: 10001,
            limiter: None,
            remote_addr: "",
            is_relay: true,
            tcp_listen_addr: "0.0.0.0",
            udp_listen_addr: "0.0.0.0",
            strategy: "",
            interface_name: "",
        };
        let services = build_services(&params);
        assert_eq!(services[0]["handler"]["chain"], "17_5_7_chains");
        assert!(services[0].get("forwarder").is_none());
    }

    #[test]
    fn forwarder_enumerates_multiple_remote_targets() {
        let forwarder = build_forwarder("1.1.1.1:80, 2.2.2.2:80", "round");
        let nodes = forwarder["nodes"].as_array().unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0]["name"], "node_1");
        assert_eq!(nodes[1]["addr"], "2.2.2.2:80");
        assert_eq!(forwarder["selector"]["strategy"], "round");
    }

    #[test]
    fn ipv6_listen_addr_is_bracketed() {
        assert_eq!(format_listen_addr("::1", 443), "[::1]:443");
    }
}
