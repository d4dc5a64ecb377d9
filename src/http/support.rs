//! Shared helpers for the forward/tunnel handlers (§4.5): port allocation,
//! quota checks and the SSRF guard. These sit above the pure `domain`
//! module because they need the DB pool; `domain::DomainError` carries the
//! user-facing message all the way out through `ApiError`'s `From` impl.

use std::net::IpAddr;

use sqlx::MySqlPool;

use crate::domain::{BYTES_TO_GB, DomainError, Forward, User, UserTunnel};

/// Lowest free port in `[port_sta,port_end]` not used by any other forward
/// sharing `node_id` as in-node (or out-node, for relay out-ports),
/// excluding `exclude_forward_id` (the forward being edited, if any).
pub async fn allocate_port(
    pool: &MySqlPool,
    node_id: i64,
    port_sta: i32,
    port_end: i32,
    on_in_node: bool,
    exclude_forward_id: Option<i64>,
) -> Result<i32, DomainError> {
    let column = if on_in_node { "in_node_id" } else { "out_node_id" };
    let port_column = if on_in_node { "f.in_port" } else { "f.out_port" };
    let query = format!(
        "SELECT {port_column} FROM forwards f JOIN tunnels t ON t.id = f.tunnel_id \
         WHERE t.{column} = ? AND f.id != ?"
    );
    let used: Vec<(i32,)> = sqlx::query_as(&query)
        .bind(node_id)
        .bind(exclude_forward_id.unwrap_or(0))
        .fetch_all(pool)
        .await
        .unwrap_or_default();
    let used: std::collections::HashSet<i32> = used.into_iter().map(|(p,)| p).collect();

    (port_sta..=port_end)
        .find(|p| !used.contains(p))
        .ok_or(DomainError::PortRangeExhausted { node_id })
}

pub fn validate_port_range(port: i32, port_sta: i32, port_end: i32) -> Result<(), DomainError> {
    if port < port_sta || port > port_end {
        return Err(DomainError::InvalidPort { port: port as i64 });
    }
    Ok(())
}

/// A forward's taken ports are unique among forwards sharing the same
/// in-node (and, for relay, the same out-node), excluding the forward
/// itself when editing.
pub async fn port_in_use(
    pool: &MySqlPool,
    node_id: i64,
    port: i32,
    on_in_node: bool,
    exclude_forward_id: Option<i64>,
) -> bool {
    let column = if on_in_node { "in_node_id" } else { "out_node_id" };
    let port_column = if on_in_node { "f.in_port" } else { "f.out_port" };
    let query = format!(
        "SELECT COUNT(*) FROM forwards f JOIN tunnels t ON t.id = f.tunnel_id \
         WHERE t.{column} = ? AND {port_column} = ? AND f.id != ?"
    );
    sqlx::query_scalar::<_, i64>(&query)
        .bind(node_id)
        .bind(port)
        .bind(exclude_forward_id.unwrap_or(0))
        .fetch_one(pool)
        .await
        .unwrap_or(0)
        > 0
}

/// §4.5 "Quota checks (on forward create/update, non-admin)".
pub async fn check_forward_quota(
    pool: &MySqlPool,
    user: &User,
    user_tunnel: &UserTunnel,
    now_ms: i64,
    exclude_forward_id: Option<i64>,
) -> Result<(), DomainError> {
    if user.is_expired(now_ms) || user.status != 1 {
        return Err(DomainError::UserExpiredOrDisabled);
    }
    if user_tunnel.status != 1 || user_tunnel.is_expired(now_ms) {
        return Err(DomainError::UserTunnelExpiredOrDisabled);
    }
    if user.flow_exceeded(BYTES_TO_GB) {
        return Err(DomainError::UserFlowExceeded);
    }
    if user_tunnel.flow_exceeded(BYTES_TO_GB) {
        return Err(DomainError::UserTunnelFlowExceeded);
    }

    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM forwards WHERE user_id = ? AND id != ?")
        .bind(user.id)
        .bind(exclude_forward_id.unwrap_or(0))
        .fetch_one(pool)
        .await
        .unwrap_or(0);
    if total >= user.num {
        return Err(DomainError::UserForwardCapExceeded);
    }

    let on_tunnel: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM forwards WHERE user_id = ? AND tunnel_id = ? AND id != ?",
    )
    .bind(user.id)
    .bind(user_tunnel.tunnel_id)
    .bind(exclude_forward_id.unwrap_or(0))
    .fetch_one(pool)
    .await
    .unwrap_or(0);
    if on_tunnel >= user_tunnel.num {
        return Err(DomainError::UserTunnelForwardCapExceeded);
    }

    Ok(())
}

/// §4.5 SSRF guard: rejects private-range literal IPs outright, and resolves
/// domain names to reject any private IP in the result set. Admins bypass
/// this entirely at the call site.
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.octets()[0..2] == [169, 254]
        }
        IpAddr::V6(v6) => {
            v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00 || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

async fn host_is_private(host: &str) -> bool {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return is_private_ip(ip);
    }
    match tokio::net::lookup_host((host, 0)).await {
        Ok(addrs) => addrs.map(|a| a.ip()).any(is_private_ip),
        Err(_) => false,
    }
}

pub async fn validate_remote_addr(remote_addr: &str, is_admin: bool) -> Result<(), DomainError> {
    if is_admin {
        return Ok(());
    }
    for target in remote_addr.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let Some((host, _port)) = target.rsplit_once(':') else {
            continue;
        };
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host_is_private(host).await {
            return Err(DomainError::SsrfRejected { target: target.to_string() });
        }
    }
    Ok(())
}

/// Non-admin visibility check: a forward row must belong to the caller.
pub fn owns_forward(forward: &Forward, user_id: i64) -> bool {
    forward.user_id == user_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_v4_ranges_are_rejected() {
        assert!(is_private_ip("127.0.0.1".parse().unwrap()));
        assert!(is_private_ip("10.0.0.5".parse().unwrap()));
        assert!(is_private_ip("192.168.1.1".parse().unwrap()));
        assert!(is_private_ip("169.254.1.1".parse().unwrap()));
        assert!(!is_private_ip("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn private_v6_ranges_are_rejected() {
        assert!(is_private_ip("::1".parse().unwrap()));
        assert!(is_private_ip("fc00::1".parse().unwrap()));
        assert!(is_private_ip("fe80::1".parse().unwrap()));
        assert!(!is_private_ip("2001:4860:4860::8888".parse().unwrap()));
    }
}
