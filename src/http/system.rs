//! Version reporting and self-update check (§6 `version`/`system/*`).
//! Grounded in `original_source/go-backend/handler/version.go`,
//! `handler/system.go` and `service/update.go`.

use std::sync::LazyLock;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::{ApiResult, R};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
const UPDATE_CHECK_URL: &str = "https://api.github.com/repos/0xNetuser/flux-panel/releases/latest";
const CACHE_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Serialize)]
struct UpdateResult {
    current: String,
    latest: String,
    #[serde(rename = "hasUpdate")]
    has_update: bool,
    #[serde(rename = "releaseUrl")]
    release_url: String,
}

static UPDATE_CACHE: LazyLock<Mutex<Option<(UpdateResult, Instant)>>> = LazyLock::new(|| Mutex::new(None));

/// `GET /api/v1/version` (public).
pub async fn version() -> ApiResult {
    Ok(R::ok(serde_json::json!({"version": VERSION})))
}

#[derive(serde::Deserialize)]
struct ReleaseResponse {
    tag_name: String,
    html_url: String,
}

/// `POST /api/v1/system/check-update` (admin): cached for an hour against
/// GitHub's releases API so an admin mashing the button doesn't draw rate
/// limits down.
pub async fn check_update() -> ApiResult {
    {
        let cache = UPDATE_CACHE.lock().await;
        if let Some((result, fetched_at)) = cache.as_ref() {
            if fetched_at.elapsed() < CACHE_TTL {
                return Ok(R::ok(result.clone()));
            }
        }
    }

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .user_agent("flux-panel")
        .build()
        .expect("reqwest client");

    let release: ReleaseResponse = match client.get(UPDATE_CHECK_URL).send().await {
        Ok(resp) => match resp.json().await {
            Ok(r) => r,
            Err(err) => {
                warn!(%err, "failed to parse release response");
                return Ok(R::err("解析更新信息失败"));
            }
        },
        Err(err) => {
            warn!(%err, "failed to check for updates");
            return Ok(R::err(format!("检查更新失败: {err}")));
        }
    };

    let latest = release.tag_name.trim_start_matches('v');
    let current = VERSION.trim_start_matches('v');
    let result = UpdateResult {
        current: VERSION.to_string(),
        latest: release.tag_name.clone(),
        has_update: latest != current && VERSION != "dev",
        release_url: release.html_url,
    };

    *UPDATE_CACHE.lock().await = Some((result.clone(), Instant::now()));
    Ok(R::ok(result))
}
