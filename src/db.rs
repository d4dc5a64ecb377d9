//! MySQL pool setup and migrations. Grounded in
//! `original_source/go-backend/config/config.go`'s `DSN()` (mysql on
//! `host:3306`, the panel never points anywhere else) and on the `sqlx`
//! usage shown in `examples/other_examples` manifests that pair
//! `runtime-tokio-rustls` with `migrate`.

use sqlx::mysql::{MySqlPool, MySqlPoolOptions};

pub async fn connect(url: &str) -> Result<MySqlPool, sqlx::Error> {
    MySqlPoolOptions::new()
        .max_connections(20)
        .connect(url)
        .await
}

pub async fn migrate(pool: &MySqlPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
