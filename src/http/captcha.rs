//! Math/string CAPTCHA challenge store (§6 public routes). Grounded in
//! `original_source/go-backend/service/captcha.go`'s
//! `CaptchaGenerate`/`CaptchaCheck`/`CaptchaVerify` trio and its
//! generate-once/verify-consumes-on-success semantics; the upstream image
//! renderer (`base64Captcha`) has no counterpart crate anywhere in this
//! stack, so the challenge image is a small inline SVG built by string
//! templating instead of a rasterised bitmap.

use std::sync::LazyLock;
use std::time::{Duration, Instant};

use axum::Json;
use dashmap::DashMap;
use rand::Rng;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult, R};

const CAPTCHA_CHARS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const CAPTCHA_LEN: usize = 4;
const CAPTCHA_TTL: Duration = Duration::from_secs(5 * 60);

struct Challenge {
    answer: String,
    expires_at: Instant,
}

static STORE: LazyLock<DashMap<String, Challenge>> = LazyLock::new(DashMap::new);

fn random_answer() -> String {
    let mut rng = rand::thread_rng();
    (0..CAPTCHA_LEN)
        .map(|_| CAPTCHA_CHARS[rng.gen_range(0..CAPTCHA_CHARS.len())] as char)
        .collect()
}

fn render_svg(answer: &str) -> String {
    let spaced: String = answer.chars().map(|c| format!("{c} ")).collect();
    format!(
        "<svg xmlns='http://www.w3.org/2000/svg' width='240' height='80'>\
         <rect width='100%' height='100%' fill='#f0f0f0'/>\
         <text x='20' y='52' font-size='36' font-family='monospace' fill='#333'>{spaced}</text>\
         </svg>"
    )
}

fn data_uri(answer: &str) -> String {
    use base64::Engine as _;
    let svg = render_svg(answer);
    let encoded = base64::engine::general_purpose::STANDARD.encode(svg.as_bytes());
    format!("data:image/svg+xml;base64,{encoded}")
}

fn prune_expired() {
    let now = Instant::now();
    STORE.retain(|_, c| c.expires_at > now);
}

pub fn verify_consuming(captcha_id: &str, answer: &str) -> bool {
    let Some((_, challenge)) = STORE.remove(captcha_id) else {
        return false;
    };
    challenge.expires_at > Instant::now() && challenge.answer.eq_ignore_ascii_case(answer.trim())
}

pub async fn generate() -> ApiResult {
    prune_expired();
    let id = Uuid::new_v4().to_string();
    let answer = random_answer();
    let image = data_uri(&answer);
    STORE.insert(
        id.clone(),
        Challenge { answer, expires_at: Instant::now() + CAPTCHA_TTL },
    );
    Ok(R::ok(serde_json::json!({
        "captchaId": id,
        "captchaImage": image,
    })))
}

#[derive(Debug, Deserialize)]
pub struct CheckRequest {
    #[serde(default, rename = "captchaId")]
    captcha_id: String,
}

pub async fn check(Json(body): Json<CheckRequest>) -> ApiResult {
    let exists = !body.captcha_id.is_empty()
        && STORE
            .get(&body.captcha_id)
            .is_some_and(|c| c.expires_at > Instant::now());
    if exists {
        Ok(R::ok_msg("验证通过"))
    } else {
        Err(ApiError::validation("验证失败"))
    }
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    #[serde(default, rename = "captchaId")]
    captcha_id: String,
    #[serde(default)]
    answer: String,
}

pub async fn verify(Json(body): Json<VerifyRequest>) -> ApiResult {
    if body.captcha_id.is_empty() || body.answer.is_empty() {
        return Err(ApiError::validation("验证码参数不能为空"));
    }
    if verify_consuming(&body.captcha_id, &body.answer) {
        Ok(R::ok_msg("验证成功"))
    } else {
        Err(ApiError::validation("验证码错误"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_consuming_is_one_shot() {
        let id = "test-id".to_string();
        STORE.insert(
            id.clone(),
            Challenge { answer: "ABCD".to_string(), expires_at: Instant::now() + CAPTCHA_TTL },
        );
        assert!(verify_consuming(&id, "abcd"));
        assert!(!verify_consuming(&id, "abcd"));
    }

    #[test]
    fn verify_consuming_rejects_expired() {
        let id = "expired-id".to_string();
        STORE.insert(
            id.clone(),
            Challenge { answer: "ABCD".to_string(), expires_at: Instant::now() - Duration::from_secs(1) },
        );
        assert!(!verify_consuming(&id, "abcd"));
    }
}
