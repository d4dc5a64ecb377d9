//! Subscription link generation (§6 `xray/sub/*` and the public
//! `xray/sub/:token` / `open_api/sub_store` endpoints): turns a user's
//! enabled Xray clients into share links an Xray/V2Ray client can import.
//! Grounded in `original_source/go-backend/service/xray_client.go`'s
//! `GetSubscriptionLinks`/`generateProtocolLink`/`generateVlessLink`/
//! `generateShadowsocksLink`/`generateTrojanLink`/`generateVmessLink`.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use serde::Serialize;
use sqlx::MySqlPool;

use crate::domain::{Node, User, XrayClient, XrayInbound};

const NODE_STATUS_ACTIVE: i32 = 1;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SubscriptionLink {
    pub link: String,
    pub protocol: String,
    pub remark: String,
    pub node_name: String,
}

fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

fn generate_vless_link(client: &XrayClient, host: &str, port: i32, remark: &str) -> String {
    let mut link = format!(
        "vless://{}@{}:{}?encryption=none",
        client.credential, host, port
    );
    if !client.flow.is_empty() {
        link.push_str("&flow=");
        link.push_str(&client.flow);
    }
    link.push_str("&type=tcp#");
    link.push_str(&percent_encode(remark));
    link
}

fn generate_trojan_link(client: &XrayClient, host: &str, port: i32, remark: &str) -> String {
    format!(
        "trojan://{}@{}:{}?type=tcp#{}",
        client.credential,
        host,
        port,
        percent_encode(remark)
    )
}

fn generate_shadowsocks_link(client: &XrayClient, host: &str, port: i32, remark: &str) -> String {
    let method = "aes-256-gcm";
    let user_info = format!("{method}:{}", client.credential);
    let encoded = BASE64_STANDARD.encode(user_info.as_bytes());
    format!("ss://{encoded}@{host}:{port}#{}", percent_encode(remark))
}

fn generate_vmess_link(client: &XrayClient, host: &str, port: i32, remark: &str) -> String {
    let config = serde_json::json!({
        "v": "2",
        "ps": remark,
        "add": host,
        "port": port,
        "id": client.credential,
        "aid": 0,
        "scy": "auto",
        "net": "tcp",
        "type": "none",
        "host": "",
        "path": "",
        "tls": "",
    });
    let encoded = BASE64_STANDARD.encode(config.to_string().as_bytes());
    format!("vmess://{encoded}")
}

fn generate_protocol_link(client: &XrayClient, inbound: &XrayInbound, node: &Node, remark: &str) -> Option<String> {
    let host = node.ip.as_str();
    let port = inbound.port;
    match inbound.protocol.as_str() {
        "vmess" => Some(generate_vmess_link(client, host, port, remark)),
        "vless" => Some(generate_vless_link(client, host, port, remark)),
        "trojan" => Some(generate_trojan_link(client, host, port, remark)),
        "shadowsocks" => Some(generate_shadowsocks_link(client, host, port, remark)),
        _ => None,
    }
}

async fn user_has_node_access(pool: &MySqlPool, user_id: i64, node_id: i64) -> bool {
    sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM user_nodes WHERE user_id = ? AND node_id = ?",
    )
    .bind(user_id)
    .bind(node_id)
    .fetch_one(pool)
    .await
    .unwrap_or(0)
        > 0
}

/// Builds one link per enabled client whose inbound and node are both live,
/// gated by per-node access grants for non-admin users. Admins see
/// everything; a disabled/missing node or inbound silently drops the link
/// rather than erroring the whole subscription.
pub async fn subscription_links(pool: &MySqlPool, user: &User) -> Vec<SubscriptionLink> {
    let clients: Vec<XrayClient> =
        sqlx::query_as("SELECT * FROM xray_clients WHERE user_id = ? AND enable = 1")
            .bind(user.id)
            .fetch_all(pool)
            .await
            .unwrap_or_default();

    let mut links = Vec::new();
    for client in &clients {
        let Ok(Some(inbound)) = sqlx::query_as::<_, XrayInbound>("SELECT * FROM xray_inbounds WHERE id = ?")
            .bind(client.inbound_id)
            .fetch_optional(pool)
            .await
        else {
            continue;
        };
        if inbound.enable != 1 {
            continue;
        }

        let Ok(Some(node)) = sqlx::query_as::<_, Node>("SELECT * FROM nodes WHERE id = ?")
            .bind(inbound.node_id)
            .fetch_optional(pool)
            .await
        else {
            continue;
        };
        if node.status != NODE_STATUS_ACTIVE {
            continue;
        }

        if !user.is_admin() && !user_has_node_access(pool, user.id, node.id).await {
            continue;
        }

        let remark = if !client.email.is_empty() {
            client.email.as_str()
        } else {
            inbound.tag.as_str()
        };

        if let Some(link) = generate_protocol_link(client, &inbound, &node, remark) {
            links.push(SubscriptionLink {
                link,
                protocol: inbound.protocol.clone(),
                remark: remark.to_string(),
                node_name: node.name.clone(),
            });
        }
    }
    links
}

/// Raw-text subscription body: every link joined with `\n`, standard
/// base64-encoded, matching `XraySubscription`/`GetSubStore`'s response
/// contract (an Xray/V2Ray client subscription URL expects exactly this).
pub fn encode_subscription_body(links: &[SubscriptionLink]) -> String {
    let joined = links
        .iter()
        .map(|l| l.link.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    BASE64_STANDARD.encode(joined.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(credential: &str, flow: &str, email: &str) -> XrayClient {
        XrayClient {
            id: 1,
            inbound_id: 1,
            user_id: 1,
            email: email.to_string(),
            credential: credential.to_string(),
            flow: flow.to_string(),
            total_traffic: 0,
            up_traffic: 0,
            down_traffic: 0,
            exp_time: 0,
            reset_cycle_days: 0,
            enable: 1,
            created_time: 0,
            updated_time: 0,
        }
    }

    #[test]
    fn vless_link_includes_flow_when_present() {
        let c = client("uuid-1", "xtls-rprx-vision", "a@b.com");
        let link = generate_vless_link(&c, "1.2.3.4", 443, "remark one");
        assert!(link.starts_with("vless://uuid-1@1.2.3.4:443?encryption=none&flow=xtls-rprx-vision&type=tcp#"));
        assert!(link.ends_with("remark%20one"));
    }

    #[test]
    fn vless_link_omits_flow_when_empty() {
        let c = client("uuid-2", "", "a@b.com");
        let link = generate_vless_link(&c, "host", 1, "r");
        assert!(!link.contains("flow="));
    }

    #[test]
    fn shadowsocks_link_base64_encodes_method_and_credential() {
        let c = client("password123", "", "a@b.com");
        let link = generate_shadowsocks_link(&c, "host", 8388, "r");
        let expected = BASE64_STANDARD.encode(b"aes-256-gcm:password123");
        assert_eq!(link, format!("ss://{expected}@host:8388#r"));
    }

    #[test]
    fn unknown_protocol_yields_no_link() {
        let c = client("x", "", "");
        let inbound = XrayInbound {
            id: 1,
            node_id: 1,
            tag: "t".to_string(),
            protocol: "http".to_string(),
            listen: String::new(),
            port: 80,
            settings_json: "{}".to_string(),
            stream_settings_json: "{}".to_string(),
            sniffing_json: "{}".to_string(),
            enable: 1,
            created_time: 0,
            updated_time: 0,
        };
        let node = Node {
            id: 1,
            name: "n".to_string(),
            ip: "1.2.3.4".to_string(),
            secret: String::new(),
            port_sta: 0,
            port_end: 0,
            version: String::new(),
            engine_version: String::new(),
            engine_status: 0,
            status: 1,
            created_time: 0,
            updated_time: 0,
        };
        assert_eq!(generate_protocol_link(&c, &inbound, &node, "r"), None);
    }

    #[test]
    fn encode_subscription_body_joins_with_newline_and_base64s() {
        let links = vec![
            SubscriptionLink {
                link: "vless://a".to_string(),
                protocol: "vless".to_string(),
                remark: "a".to_string(),
                node_name: "n".to_string(),
            },
            SubscriptionLink {
                link: "ss://b".to_string(),
                protocol: "shadowsocks".to_string(),
                remark: "b".to_string(),
                node_name: "n".to_string(),
            },
        ];
        let body = encode_subscription_body(&links);
        let decoded = BASE64_STANDARD.decode(body).unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), "vless://a\nss://b");
    }
}
