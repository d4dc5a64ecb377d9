use std::sync::Arc;

use clap::Parser;
use rand::Rng;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use flux_panel::config::{Config, JWT_SECRET_SENTINEL};
use flux_panel::http::AppState;
use flux_panel::node_bus::NodeBus;
use flux_panel::quota::QuotaEngine;
use flux_panel::reconcile::ReconcileHandle;
use flux_panel::{cron, db};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Config::parse();
    let pool = db::connect(&config.mysql_url()).await?;
    db::migrate(&pool).await?;
    flux_panel::auth::ensure_admin_bootstrap(&pool).await?;

    let jwt_secret = effective_jwt_secret(&config);
    let bus = NodeBus::new();
    let reconcile = ReconcileHandle::new(pool.clone(), bus.clone());
    let quota = QuotaEngine::new(pool.clone(), bus.clone());

    tokio::spawn(cron::run_hourly_rollup(pool.clone()));
    tokio::spawn(cron::run_daily_reset(pool.clone(), bus.clone()));
    tokio::spawn(cron::run_latency_probe(
        pool.clone(),
        bus.clone(),
        std::time::Duration::from_secs(config.latency_probe_seconds),
    ));

    let state = AppState {
        pool,
        bus,
        reconcile,
        quota,
        config: Arc::new(config.clone()),
        jwt_secret,
    };

    let app = flux_panel::http::build_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.server_port));
    info!(%addr, "starting flux-panel");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    Ok(())
}

/// A blank or legacy-sentinel `JWT_SECRET` gets a random per-process value
/// instead (§4.5 admin bootstrap): sessions just don't survive a restart.
fn effective_jwt_secret(config: &Config) -> String {
    if config.jwt_secret.is_empty() || config.jwt_secret == JWT_SECRET_SENTINEL {
        let mut rng = rand::thread_rng();
        (0..32).map(|_| format!("{:02x}", rng.r#gen::<u8>())).collect()
    } else {
        config.jwt_secret.clone()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).compact().init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
