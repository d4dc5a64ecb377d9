//! Wire shapes for the node session protocol (§6 "Node session protocol").

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct OutboundCommand<'a> {
    #[serde(rename = "type")]
    pub type_: &'a str,
    pub data: serde_json::Value,
    #[serde(rename = "requestId")]
    pub request_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundCorrelated {
    #[serde(rename = "requestId")]
    pub request_id: Option<Uuid>,
    pub message: Option<String>,
    #[serde(rename = "type")]
    pub type_: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// What a `SendMsg`-equivalent call resolves to — whatever the node sent
/// back for this `requestId`, or a synthesized timeout/offline response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResponse {
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl NodeResponse {
    pub fn ok() -> Self {
        Self {
            message: "OK".to_string(),
            data: serde_json::Value::Null,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.message == "OK"
    }

    pub fn timeout() -> Self {
        Self {
            message: "等待响应超时".to_string(),
            data: serde_json::Value::Null,
        }
    }

    pub fn offline() -> Self {
        Self {
            message: "节点不在线".to_string(),
            data: serde_json::Value::Null,
        }
    }

    /// "not found" anywhere in the message is a recoverable signal per §4.2.
    pub fn is_not_found(&self) -> bool {
        self.message.to_lowercase().contains("not found")
    }

    pub fn is_already_exists(&self) -> bool {
        self.message.to_lowercase().contains("already exists")
    }

    /// Whether the failure indicates the Xray engine's control port isn't
    /// up yet, rather than a real configuration rejection — the signal
    /// that promotes a failed hot-add to a full config apply (§4.3 phase 3).
    pub fn is_engine_not_running(&self) -> bool {
        let m = self.message.to_lowercase();
        m.contains("connection refused") || m.contains("not running") || m.contains("10085") || m.contains("dial tcp")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeQuery {
    pub id: Option<i64>,
    #[serde(rename = "type", default)]
    pub type_: i32,
    pub secret: Option<String>,
    #[serde(rename = "nodeVersion", default)]
    pub node_version: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_detection_is_case_insensitive_substring() {
        let r = NodeResponse {
            message: "service Not Found on node".to_string(),
            data: serde_json::Value::Null,
        };
        assert!(r.is_not_found());
        assert!(!r.is_already_exists());
    }

    #[test]
    fn already_exists_detection_is_case_insensitive_substring() {
        let r = NodeResponse {
            message: "limiter already exists".to_string(),
            data: serde_json::Value::Null,
        };
        assert!(r.is_already_exists());
    }
}
