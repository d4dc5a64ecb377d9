//! HTTP surface (§6): one route table assembled from per-entity handler
//! modules, a uniform `{code,msg,ts,data?}` JSON envelope (`crate::error`),
//! and the node-session-bus WebSocket upgrade at `/system-info`. Router
//! shape (nested `Router`s, `Extension`/`State`-carried `AppState`, CORS and
//! trace layering) follows the teacher's own `http/mod.rs`; the route list
//! itself is grounded in `original_source/go-backend/router/router.go`.

mod captcha;
mod config_routes;
mod dashboard;
mod flow;
mod forward;
mod install;
mod node;
mod ratelimit;
mod speed_limit;
mod support;
mod system;
mod tunnel;
mod user;
mod ws;
mod xray;

use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{get, post},
};
use sqlx::MySqlPool;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

use crate::auth;
use crate::config::Config;
use crate::node_bus::NodeBus;
use crate::quota::QuotaEngine;
use crate::reconcile::ReconcileHandle;

/// Shared state every handler and the node-bus upgrade close over. Holds
/// the DB pool, the node session bus, the reconciler, the quota engine and
/// the effective config — nothing here is a process-wide singleton (§9
/// "Global DB handle").
#[derive(Clone)]
pub struct AppState {
    pub pool: MySqlPool,
    pub bus: NodeBus,
    pub reconcile: ReconcileHandle,
    pub quota: QuotaEngine,
    pub config: Arc<Config>,
    pub jwt_secret: String,
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origins = config.allowed_origins_list();
    if origins.is_empty() {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    let parsed: Vec<_> = origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(parsed))
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Routes with no auth requirement at all.
fn public_routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/user/login", post(user::login))
        .route("/api/v1/captcha/generate", post(captcha::generate))
        .route("/api/v1/captcha/check", post(captcha::check))
        .route("/api/v1/captcha/verify", post(captcha::verify))
        .route_layer(middleware::from_fn(ratelimit::login_bucket))
        .route("/api/v1/config/list", post(config_routes::list))
        .route("/api/v1/config/get", post(config_routes::get))
        .route("/flow/upload", post(flow::gost_upload))
        .route("/flow/config", post(flow::flow_config))
        .route("/flow/test", get(flow::flow_test).post(flow::flow_test))
        .route("/flow/xray-upload", post(flow::xray_upload))
        .route("/node-install/script", get(install::script))
        .route("/node-install/binary/:arch", get(install::binary))
        .route("/api/v1/xray/sub/:token", get(xray::subscription_by_token))
        .route("/api/v1/open_api/sub_store", get(xray::sub_store))
        .route("/api/v1/version", get(system::version))
        .route("/system-info", get(ws::upgrade))
}

/// Routes behind `require_auth`; admin-only ones additionally carry
/// `require_admin`, layered per-route so non-admin routes in the same
/// router are unaffected.
fn authed_routes() -> Router<AppState> {
    let admin_only = Router::new()
        .route("/api/v1/user/create", post(user::create))
        .route("/api/v1/user/list", post(user::list))
        .route("/api/v1/user/update", post(user::update))
        .route("/api/v1/user/delete", post(user::delete))
        .route("/api/v1/user/reset", post(user::reset))
        .route("/api/v1/node/create", post(node::create))
        .route("/api/v1/node/list", post(node::list))
        .route("/api/v1/node/update", post(node::update))
        .route("/api/v1/node/delete", post(node::delete))
        .route("/api/v1/node/install", post(node::install))
        .route("/api/v1/node/install/docker", post(node::install_docker))
        .route("/api/v1/node/reconcile", post(node::reconcile))
        .route("/api/v1/tunnel/create", post(tunnel::create))
        .route("/api/v1/tunnel/list", post(tunnel::list))
        .route("/api/v1/tunnel/update", post(tunnel::update))
        .route("/api/v1/tunnel/delete", post(tunnel::delete))
        .route("/api/v1/tunnel/user/assign", post(tunnel::user_assign))
        .route("/api/v1/tunnel/user/list", post(tunnel::user_list))
        .route("/api/v1/tunnel/user/remove", post(tunnel::user_remove))
        .route("/api/v1/tunnel/user/update", post(tunnel::user_update))
        .route("/api/v1/tunnel/diagnose", post(tunnel::diagnose))
        .route("/api/v1/forward/force-delete", post(forward::force_delete))
        .route("/api/v1/speed-limit/create", post(speed_limit::create))
        .route("/api/v1/speed-limit/list", post(speed_limit::list))
        .route("/api/v1/speed-limit/update", post(speed_limit::update))
        .route("/api/v1/speed-limit/delete", post(speed_limit::delete))
        .route("/api/v1/speed-limit/tunnels", post(speed_limit::tunnels))
        .route("/api/v1/config/update", post(config_routes::update))
        .route("/api/v1/config/update-single", post(config_routes::update_single))
        .route("/api/v1/xray/node/start", post(xray::node_start))
        .route("/api/v1/xray/node/stop", post(xray::node_stop))
        .route("/api/v1/xray/node/restart", post(xray::node_restart))
        .route("/api/v1/xray/node/status", post(xray::node_status))
        .route("/api/v1/system/check-update", post(system::check_update))
        .route_layer(middleware::from_fn(auth::require_admin));

    let open_to_members = Router::new()
        .route("/api/v1/user/package", post(user::package))
        .route("/api/v1/user/updatePassword", post(user::update_password))
        .route("/api/v1/node/accessible", post(node::accessible))
        .route("/api/v1/tunnel/user/tunnel", post(tunnel::user_tunnel))
        .route("/api/v1/forward/create", post(forward::create))
        .route("/api/v1/forward/list", post(forward::list))
        .route("/api/v1/forward/update", post(forward::update))
        .route("/api/v1/forward/delete", post(forward::delete))
        .route("/api/v1/forward/pause", post(forward::pause))
        .route("/api/v1/forward/resume", post(forward::resume))
        .route("/api/v1/forward/diagnose", post(forward::diagnose))
        .route("/api/v1/forward/update-order", post(forward::update_order))
        .route("/api/v1/xray/inbound/create", post(xray::inbound_create))
        .route("/api/v1/xray/inbound/list", post(xray::inbound_list))
        .route("/api/v1/xray/inbound/update", post(xray::inbound_update))
        .route("/api/v1/xray/inbound/delete", post(xray::inbound_delete))
        .route("/api/v1/xray/inbound/enable", post(xray::inbound_enable))
        .route("/api/v1/xray/inbound/disable", post(xray::inbound_disable))
        .route("/api/v1/xray/client/create", post(xray::client_create))
        .route("/api/v1/xray/client/list", post(xray::client_list))
        .route("/api/v1/xray/client/update", post(xray::client_update))
        .route("/api/v1/xray/client/delete", post(xray::client_delete))
        .route("/api/v1/xray/client/reset-traffic", post(xray::client_reset_traffic))
        .route("/api/v1/xray/cert/create", post(xray::cert_create))
        .route("/api/v1/xray/cert/list", post(xray::cert_list))
        .route("/api/v1/xray/cert/delete", post(xray::cert_delete))
        .route("/api/v1/xray/cert/issue", post(xray::cert_issue))
        .route("/api/v1/xray/cert/renew", post(xray::cert_renew))
        .route("/api/v1/xray/sub/token", post(xray::sub_token))
        .route("/api/v1/xray/sub/links", post(xray::sub_links))
        .route("/api/v1/dashboard/stats", post(dashboard::stats));

    admin_only.merge(open_to_members)
}

pub fn build_router(state: AppState) -> Router {
    let authed = authed_routes().layer(middleware::from_fn_with_state(state.clone(), auth::require_auth));

    public_routes()
        .merge(authed)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state.config))
        .with_state(state)
}
