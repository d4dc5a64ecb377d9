//! Xray (engine-2) command builders, grounded verbatim in
//! `original_source/go-backend/pkg/xray.go`.

use serde_json::{Value, json};

use crate::domain::{XrayClient, XrayInbound};
use crate::node_bus::{NodeBus, wire::NodeResponse};

/// A client object carries both `id` and `password` regardless of protocol
/// (VLESS reads `id`, Shadowsocks reads `password`); the engine ignores
/// whichever field its protocol doesn't use.
fn client_entry(client: &XrayClient) -> Value {
    let mut entry = json!({
        "id": client.credential,
        "password": client.credential,
        "email": client.email,
    });
    if !client.flow.is_empty() {
        entry["flow"] = json!(client.flow);
    }
    entry
}

/// Merges the inbound's enabled client list into its `settings_json`'s
/// `clients` array before the payload goes to the node, so a single
/// `XrayApplyConfig`/`XrayAddInbound` carries the full client set rather
/// than requiring a follow-up `XrayAddClient` per client (§4.3 phase 3).
fn settings_with_clients(settings_json: &str, clients: &[XrayClient]) -> String {
    let mut settings: Value = serde_json::from_str(settings_json).unwrap_or_else(|_| json!({}));
    let entries: Vec<Value> = clients.iter().filter(|c| c.enable == 1).map(client_entry).collect();
    settings["clients"] = json!(entries);
    settings.to_string()
}

fn inbound_payload(inbound: &XrayInbound, clients: &[XrayClient]) -> Value {
    json!({
        "tag": inbound.tag,
        "protocol": inbound.protocol,
        "listen": inbound.listen,
        "port": inbound.port,
        "settingsJson": settings_with_clients(&inbound.settings_json, clients),
        "streamSettingsJson": inbound.stream_settings_json,
        "sniffingJson": inbound.sniffing_json,
    })
}

pub async fn start(bus: &NodeBus, node_id: i64) -> NodeResponse {
    bus.send_msg(node_id, "XrayStart", json!({})).await
}

pub async fn stop(bus: &NodeBus, node_id: i64) -> NodeResponse {
    bus.send_msg(node_id, "XrayStop", json!({})).await
}

pub async fn restart(bus: &NodeBus, node_id: i64) -> NodeResponse {
    bus.send_msg(node_id, "XrayRestart", json!({})).await
}

pub async fn status(bus: &NodeBus, node_id: i64) -> NodeResponse {
    bus.send_msg(node_id, "XrayStatus", json!({})).await
}

pub async fn add_inbound(bus: &NodeBus, node_id: i64, inbound: &XrayInbound, clients: &[XrayClient]) -> NodeResponse {
    bus.send_msg(node_id, "XrayAddInbound", inbound_payload(inbound, clients)).await
}

pub async fn remove_inbound(bus: &NodeBus, node_id: i64, tag: &str) -> NodeResponse {
    bus.send_msg(node_id, "XrayRemoveInbound", json!({ "tag": tag })).await
}

#[allow(clippy::too_many_arguments)]
pub async fn add_client(
    bus: &NodeBus,
    node_id: i64,
    inbound_tag: &str,
    email: &str,
    uuid_or_password: &str,
    flow: &str,
    alter_id: i32,
    protocol: &str,
) -> NodeResponse {
    let data = json!({
        "inboundTag": inbound_tag,
        "email": email,
        "uuidOrPassword": uuid_or_password,
        "flow": flow,
        "alterId": alter_id,
        "protocol": protocol,
    });
    bus.send_msg(node_id, "XrayAddClient", data).await
}

pub async fn remove_client(bus: &NodeBus, node_id: i64, inbound_tag: &str, email: &str) -> NodeResponse {
    let data = json!({ "inboundTag": inbound_tag, "email": email });
    bus.send_msg(node_id, "XrayRemoveClient", data).await
}

/// `reset: true` mirrors the original: each poll drains the node-side
/// counters, so the panel is the sole source of cumulative totals.
pub async fn get_traffic(bus: &NodeBus, node_id: i64) -> NodeResponse {
    bus.send_msg(node_id, "XrayGetTraffic", json!({ "reset": true })).await
}

/// `items` pairs each inbound with its own enabled-client rows; callers
/// typically group a flat `xray_clients` query by `inbound_id` first.
pub async fn apply_config(bus: &NodeBus, node_id: i64, items: &[(XrayInbound, Vec<XrayClient>)]) -> NodeResponse {
    let arr: Vec<Value> = items.iter().map(|(inbound, clients)| inbound_payload(inbound, clients)).collect();
    bus.send_msg(node_id, "XrayApplyConfig", json!({ "inbounds": arr })).await
}

pub async fn deploy_cert(bus: &NodeBus, node_id: i64, domain: &str, public_key: &str, private_key: &str) -> NodeResponse {
    let data = json!({ "domain": domain, "publicKey": public_key, "privateKey": private_key });
    bus.send_msg(node_id, "XrayDeployCert", data).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_payload_uses_camel_case_json_field_names() {
        let inbound = XrayInbound {
            id: 1,
            node_id: 1,
            tag: "in-1".to_string(),
            protocol: "vless".to_string(),
            listen: "0.0.0.0".to_string(),
            port: 443,
            settings_json: "{}".to_string(),
            stream_settings_json: "{}".to_string(),
            sniffing_json: "{}".to_string(),
            enable: 1,
            created_time: 0,
            updated_time: 0,
        };
        let payload = inbound_payload(&inbound, &[]);
        assert_eq!(payload["settingsJson"], "{\"clients\":[]}");
        assert_eq!(payload["streamSettingsJson"], "{}");
        assert_eq!(payload["port"], 443);
    }

    #[test]
    fn inbound_payload_merges_only_enabled_clients() {
        let inbound = XrayInbound {
            id: 1,
            node_id: 1,
            tag: "in-1".to_string(),
            protocol: "vless".to_string(),
            listen: "0.0.0.0".to_string(),
            port: 443,
            settings_json: "{\"decryption\":\"none\"}".to_string(),
            stream_settings_json: "{}".to_string(),
            sniffing_json: "{}".to_string(),
            enable: 1,
            created_time: 0,
            updated_time: 0,
        };
        let enabled = XrayClient {
            id: 1,
            inbound_id: 1,
            user_id: 1,
            email: "a@x".to_string(),
            credential: "uuid-a".to_string(),
            flow: "xtls-rprx-vision".to_string(),
            total_traffic: 0,
            up_traffic: 0,
            down_traffic: 0,
            exp_time: 0,
            reset_cycle_days: 0,
            enable: 1,
            created_time: 0,
            updated_time: 0,
        };
        let mut disabled = enabled.clone();
        disabled.id = 2;
        disabled.email = "b@x".to_string();
        disabled.enable = 0;

        let payload = inbound_payload(&inbound, &[enabled, disabled]);
        let settings: Value = serde_json::from_str(payload["settingsJson"].as_str().unwrap()).unwrap();
        assert_eq!(settings["decryption"], "none");
        let clients = settings["clients"].as_array().unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0]["email"], "a@x");
        assert_eq!(clients[0]["flow"], "xtls-rprx-vision");
    }
}
