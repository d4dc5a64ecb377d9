//! Core entity types shared by the persistence layer, the service programmer,
//! and the HTTP handlers. Timestamps are epoch-millis unless noted; `status`
//! is 1=active/0=disabled unless the field comment says otherwise.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

pub mod naming;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    InvalidPort { port: i64 },
    PortRangeExhausted { node_id: i64 },
    TunnelTypeRequiresOutNode,
    TunnelInUse { tunnel_id: i64 },
    SpeedLimitInUse { speed_limit_id: i64 },
    UserExpiredOrDisabled,
    UserTunnelMissing,
    UserTunnelExpiredOrDisabled,
    UserFlowExceeded,
    UserTunnelFlowExceeded,
    UserForwardCapExceeded,
    UserTunnelForwardCapExceeded,
    SsrfRejected { target: String },
    NotFound { what: &'static str },
}

impl DomainError {
    /// Terse Chinese phrase surfaced verbatim in the `msg` field of the
    /// HTTP envelope, matching the tone of the system this panel replaces.
    pub fn message(&self) -> String {
        match self {
            Self::InvalidPort { port } => format!("端口 {port} 不在隧道允许范围内"),
            Self::PortRangeExhausted { node_id } => format!("节点 {node_id} 端口已耗尽"),
            Self::TunnelTypeRequiresOutNode => "中转隧道必须指定出口节点".to_string(),
            Self::TunnelInUse { .. } => "隧道正在被使用，无法删除".to_string(),
            Self::SpeedLimitInUse { .. } => "限速规则正在被使用，无法删除".to_string(),
            Self::UserExpiredOrDisabled => "用户已到期或被禁用".to_string(),
            Self::UserTunnelMissing => "你没有该隧道权限".to_string(),
            Self::UserTunnelExpiredOrDisabled => "隧道权限已到期或被禁用".to_string(),
            Self::UserFlowExceeded => "用户流量已用尽".to_string(),
            Self::UserTunnelFlowExceeded => "隧道流量已用尽".to_string(),
            Self::UserForwardCapExceeded => "转发数量已达上限".to_string(),
            Self::UserTunnelForwardCapExceeded => "该隧道下转发数量已达上限".to_string(),
            Self::SsrfRejected { target } => format!("目标地址不允许: {target}"),
            Self::NotFound { what } => format!("{what}不存在"),
        }
    }
}

impl std::fmt::Display for DomainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for DomainError {}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[repr(i32)]
pub enum Role {
    Admin = 0,
    User = 1,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, FromRow)]
pub struct User {
    pub id: i64,
    pub user: String,
    pub password: String,
    pub role_id: i32,
    pub flow: i64,
    pub in_flow: i64,
    pub out_flow: i64,
    pub num: i64,
    pub exp_time: i64,
    pub status: i32,
    pub flow_reset_time: i32,
    pub created_time: i64,
    pub updated_time: i64,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role_id == Role::Admin as i32
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.exp_time > 0 && self.exp_time <= now_ms
    }

    pub fn flow_exceeded(&self, bytes_to_gb: i64) -> bool {
        self.flow * bytes_to_gb < self.in_flow + self.out_flow
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, FromRow)]
pub struct Node {
    pub id: i64,
    pub name: String,
    pub ip: String,
    pub secret: String,
    pub port_sta: i32,
    pub port_end: i32,
    pub version: String,
    pub engine_version: String,
    pub engine_status: i32,
    pub status: i32,
    pub created_time: i64,
    pub updated_time: i64,
}

pub const TUNNEL_TYPE_DIRECT: i32 = 1;
pub const TUNNEL_TYPE_RELAY: i32 = 2;

pub const FLOW_MODE_OUT_ONLY: i32 = 1;
pub const FLOW_MODE_IN_AND_OUT: i32 = 2;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, FromRow)]
pub struct Tunnel {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub type_: i32,
    pub in_node_id: i64,
    pub out_node_id: i64,
    pub in_ip: String,
    pub out_ip: String,
    pub protocol: String,
    pub tcp_listen_addr: String,
    pub udp_listen_addr: String,
    pub traffic_ratio: f64,
    pub flow: i32,
    pub status: i32,
    pub created_time: i64,
    pub updated_time: i64,
}

impl Tunnel {
    pub fn is_relay(&self) -> bool {
        self.type_ == TUNNEL_TYPE_RELAY
    }
}

pub const FORWARD_STATUS_ACTIVE: i32 = 1;
pub const FORWARD_STATUS_PAUSED: i32 = 0;
pub const FORWARD_STATUS_ERROR: i32 = -1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, FromRow)]
pub struct Forward {
    pub id: i64,
    pub user_id: i64,
    pub tunnel_id: i64,
    pub user_tunnel_id: i64,
    pub name: String,
    pub in_port: i32,
    pub out_port: i32,
    pub remote_addr: String,
    pub strategy: String,
    pub listen_ip: String,
    pub interface_name: String,
    pub in_flow: i64,
    pub out_flow: i64,
    pub order_index: i32,
    pub status: i32,
    pub created_time: i64,
    pub updated_time: i64,
}

impl Forward {
    pub fn remote_targets(&self) -> Vec<&str> {
        self.remote_addr.split(',').map(str::trim).collect()
    }

    pub fn listen_ips(&self) -> Vec<&str> {
        if self.listen_ip.is_empty() {
            Vec::new()
        } else {
            self.listen_ip.split(',').map(str::trim).collect()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, FromRow)]
pub struct UserTunnel {
    pub id: i64,
    pub user_id: i64,
    pub tunnel_id: i64,
    pub flow: i64,
    pub in_flow: i64,
    pub out_flow: i64,
    pub num: i64,
    pub exp_time: i64,
    pub speed_id: Option<i64>,
    pub status: i32,
    pub created_time: i64,
    pub updated_time: i64,
}

impl UserTunnel {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.exp_time > 0 && self.exp_time <= now_ms
    }

    pub fn flow_exceeded(&self, bytes_to_gb: i64) -> bool {
        self.in_flow + self.out_flow >= self.flow * bytes_to_gb
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, FromRow)]
pub struct SpeedLimit {
    pub id: i64,
    pub name: String,
    pub speed: i64,
    pub tunnel_id: i64,
    pub status: i32,
    pub created_time: i64,
    pub updated_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, FromRow)]
pub struct UserNode {
    pub id: i64,
    pub user_id: i64,
    pub node_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, FromRow)]
pub struct XrayInbound {
    pub id: i64,
    pub node_id: i64,
    pub tag: String,
    pub protocol: String,
    pub listen: String,
    pub port: i32,
    pub settings_json: String,
    pub stream_settings_json: String,
    pub sniffing_json: String,
    pub enable: i32,
    pub created_time: i64,
    pub updated_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, FromRow)]
pub struct XrayClient {
    pub id: i64,
    pub inbound_id: i64,
    pub user_id: i64,
    pub email: String,
    pub credential: String,
    pub flow: String,
    pub total_traffic: i64,
    pub up_traffic: i64,
    pub down_traffic: i64,
    pub exp_time: i64,
    pub reset_cycle_days: i32,
    pub enable: i32,
    pub created_time: i64,
    pub updated_time: i64,
}

impl XrayClient {
    pub fn traffic_exceeded(&self) -> bool {
        self.total_traffic > 0 && self.up_traffic + self.down_traffic >= self.total_traffic
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, FromRow)]
pub struct XrayTlsCert {
    pub id: i64,
    pub node_id: i64,
    pub domain: String,
    pub public_key: String,
    #[serde(skip_serializing)]
    pub private_key: String,
    pub acme_enabled: i32,
    pub acme_email: String,
    pub challenge_type: String,
    pub dns_provider: String,
    pub dns_json: String,
    pub exp_time: i64,
    pub last_renew_time: i64,
    pub created_time: i64,
    pub updated_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, FromRow)]
pub struct StatisticsFlow {
    pub id: i64,
    pub user_id: i64,
    pub flow: i64,
    pub total_flow: i64,
    pub time: String,
    pub created_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, FromRow)]
pub struct StatisticsForwardFlow {
    pub id: i64,
    pub forward_id: i64,
    pub in_flow: i64,
    pub out_flow: i64,
    pub record_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, FromRow)]
pub struct MonitorLatency {
    pub id: i64,
    pub forward_id: i64,
    pub node_id: i64,
    pub target: String,
    pub latency_ms: i32,
    pub success: bool,
    pub record_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, FromRow)]
pub struct SystemConfig {
    pub key: String,
    pub value: String,
    pub description: String,
}

pub const BYTES_TO_GB: i64 = 1024 * 1024 * 1024;
