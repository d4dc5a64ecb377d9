//! Control-plane panel for a fleet of GOST/Xray forwarding nodes: node
//! session bus, service programmer, per-node reconciler, traffic ingest and
//! quota enforcement, and the HTTP surface tying them together.

pub mod auth;
pub mod config;
pub mod cron;
pub mod crypto;
pub mod db;
pub mod domain;
pub mod error;
pub mod http;
pub mod node_bus;
pub mod orphan;
pub mod programmer;
pub mod protocol;
pub mod quota;
pub mod reconcile;
pub mod subscription;
