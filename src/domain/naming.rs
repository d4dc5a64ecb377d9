//! The deterministic service-naming function that joins panel state to
//! node-side GOST service/chain/limiter names. Every reconcile and cleanup
//! operation depends on this being pure — see `original_source` `service/forward.go`
//! `buildServiceName` and `pkg/gost.go`'s naming conventions.

/// `"<forwardId>_<userId>_<userTunnelId>"`, with `userTunnelId` 0 for admin-owned forwards.
pub fn service_base_name(forward_id: i64, user_id: i64, user_tunnel_id: i64) -> String {
    format!("{forward_id}_{user_id}_{user_tunnel_id}")
}

pub fn tcp_service_name(base: &str) -> String {
    format!("{base}_tcp")
}

pub fn udp_service_name(base: &str) -> String {
    format!("{base}_udp")
}

/// Multi-IP listen suffixes the base with `_<index>` before the protocol suffix.
pub fn indexed_base(base: &str, index: usize) -> String {
    format!("{base}_{index}")
}

pub fn chain_name(base: &str) -> String {
    format!("{base}_chains")
}

pub fn remote_service_name(base: &str) -> String {
    format!("{base}_tls")
}

pub fn chain_hop_name(base: &str) -> String {
    format!("hop-{base}")
}

pub fn chain_node_name(base: &str) -> String {
    format!("node-{base}")
}

pub fn forwarder_node_name(index: usize) -> String {
    format!("node_{index}")
}

/// Classification of a node-pushed inventory name during orphan cleanup
/// (§4.3). Unrecognised suffixes are treated as bare limiter ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InventoryNameKind {
    Service,
    RemoteService,
    Chain,
    Limiter,
}

pub fn classify_inventory_name(name: &str) -> (InventoryNameKind, &str) {
    if let Some(base) = name.strip_suffix("_chains") {
        return (InventoryNameKind::Chain, base);
    }
    if let Some(base) = name.strip_suffix("_tls") {
        return (InventoryNameKind::RemoteService, base);
    }
    if let Some(base) = name.strip_suffix("_tcp") {
        return (InventoryNameKind::Service, base);
    }
    if let Some(base) = name.strip_suffix("_udp") {
        return (InventoryNameKind::Service, base);
    }
    (InventoryNameKind::Limiter, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_owned_forward_has_zero_user_tunnel_id() {
        assert_eq!(service_base_name(17, 5, 0), "17_5_0");
    }

    #[test]
    fn protocol_suffixes_are_appended_to_base() {
        let base = service_base_name(17, 5, 7);
        assert_eq!(tcp_service_name(&base), "17_5_7_tcp");
        assert_eq!(udp_service_name(&base), "17_5_7_udp");
    }

    #[test]
    fn multi_ip_indexes_before_protocol_suffix() {
        let base = service_base_name(17, 5, 7);
        let indexed = indexed_base(&base, 0);
        assert_eq!(tcp_service_name(&indexed), "17_5_7_0_tcp");
    }

    #[test]
    fn relay_names_are_derived_from_base() {
        let base = "17_5_7";
        assert_eq!(chain_name(base), "17_5_7_chains");
        assert_eq!(remote_service_name(base), "17_5_7_tls");
        assert_eq!(chain_hop_name(base), "hop-17_5_7");
        assert_eq!(chain_node_name(base), "node-17_5_7");
    }

    #[test]
    fn classify_inventory_name_recognizes_all_suffixes() {
        assert_eq!(
            classify_inventory_name("17_5_7_chains"),
            (InventoryNameKind::Chain, "17_5_7")
        );
        assert_eq!(
            classify_inventory_name("17_5_7_tls"),
            (InventoryNameKind::RemoteService, "17_5_7")
        );
        assert_eq!(
            classify_inventory_name("17_5_7_tcp"),
            (InventoryNameKind::Service, "17_5_7")
        );
        assert_eq!(
            classify_inventory_name("17_5_7_udp"),
            (InventoryNameKind::Service, "17_5_7")
        );
        assert_eq!(
            classify_inventory_name("42"),
            (InventoryNameKind::Limiter, "42")
        );
    }
}
