//! Hand-rolled HS256 JWT for user sessions and subscription links.
//! Claim shape and constant-time signature check are grounded in
//! `original_source/go-backend/pkg/jwt.go`; the header/signing-input/base64
//! machinery follows the same shape as the teacher's own `login_token.rs`.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

pub const SESSION_TOKEN_TTL_SECONDS: i64 = 7 * 24 * 3600;
pub const SUBSCRIPTION_TOKEN_TTL_SECONDS: i64 = 24 * 3600;
pub const SUBSCRIPTION_SCOPE: &str = "subscription";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug)]
pub enum JwtError {
    Malformed,
    InvalidHeader,
    InvalidSignature,
    InvalidClaims,
    Expired,
    WrongScope,
}

impl std::fmt::Display for JwtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::Malformed => "token解析失败",
            Self::InvalidHeader => "token解析失败",
            Self::InvalidSignature => "token无效或已过期",
            Self::InvalidClaims => "token无效或已过期",
            Self::Expired => "token无效或已过期",
            Self::WrongScope => "token无效或已过期",
        };
        write!(f, "{msg}")
    }
}

impl std::error::Error for JwtError {}

#[derive(Serialize)]
struct JwtHeader<'a> {
    alg: &'a str,
    typ: &'a str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    pub user: String,
    pub name: String,
    pub role_id: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionClaims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    pub scope: String,
}

fn sign(secret: &str, signing_input: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac key init failed");
    mac.update(signing_input.as_bytes());
    URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
}

fn encode<T: Serialize>(secret: &str, claims: &T) -> String {
    let header = JwtHeader {
        alg: "HS256",
        typ: "JWT",
    };
    let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).unwrap());
    let claims_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap());
    let signing_input = format!("{header_b64}.{claims_b64}");
    let sig_b64 = sign(secret, &signing_input);
    format!("{signing_input}.{sig_b64}")
}

fn decode_parts(token: &str) -> Result<(&str, &str, &str), JwtError> {
    let mut parts = token.split('.');
    let header_b64 = parts.next().ok_or(JwtError::Malformed)?;
    let claims_b64 = parts.next().ok_or(JwtError::Malformed)?;
    let sig_b64 = parts.next().ok_or(JwtError::Malformed)?;
    if parts.next().is_some() {
        return Err(JwtError::Malformed);
    }
    Ok((header_b64, claims_b64, sig_b64))
}

fn verify_signature(secret: &str, header_b64: &str, claims_b64: &str, sig_b64: &str) -> Result<(), JwtError> {
    let header_bytes = URL_SAFE_NO_PAD
        .decode(header_b64)
        .map_err(|_| JwtError::InvalidHeader)?;
    let header: serde_json::Value =
        serde_json::from_slice(&header_bytes).map_err(|_| JwtError::InvalidHeader)?;
    if header.get("alg").and_then(|v| v.as_str()) != Some("HS256") {
        return Err(JwtError::InvalidHeader);
    }

    let signing_input = format!("{header_b64}.{claims_b64}");
    let sig_bytes = URL_SAFE_NO_PAD
        .decode(sig_b64)
        .map_err(|_| JwtError::Malformed)?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| JwtError::InvalidSignature)?;
    mac.update(signing_input.as_bytes());
    mac.verify_slice(&sig_bytes)
        .map_err(|_| JwtError::InvalidSignature)
}

pub fn issue_session_token(
    secret: &str,
    user_id: i64,
    username: &str,
    role_id: i32,
    now: DateTime<Utc>,
) -> String {
    let iat = now.timestamp();
    let claims = SessionClaims {
        sub: user_id.to_string(),
        iat,
        exp: iat + SESSION_TOKEN_TTL_SECONDS,
        user: username.to_string(),
        name: username.to_string(),
        role_id,
    };
    encode(secret, &claims)
}

pub fn validate_session_token(
    secret: &str,
    token: &str,
    now: DateTime<Utc>,
) -> Result<SessionClaims, JwtError> {
    let (header_b64, claims_b64, sig_b64) = decode_parts(token)?;
    verify_signature(secret, header_b64, claims_b64, sig_b64)?;

    let claims_bytes = URL_SAFE_NO_PAD
        .decode(claims_b64)
        .map_err(|_| JwtError::InvalidClaims)?;
    let claims: SessionClaims =
        serde_json::from_slice(&claims_bytes).map_err(|_| JwtError::InvalidClaims)?;
    if claims.exp <= now.timestamp() {
        return Err(JwtError::Expired);
    }
    Ok(claims)
}

pub fn issue_subscription_token(secret: &str, user_id: i64, now: DateTime<Utc>) -> String {
    let iat = now.timestamp();
    let claims = SubscriptionClaims {
        sub: user_id.to_string(),
        iat,
        exp: iat + SUBSCRIPTION_TOKEN_TTL_SECONDS,
        scope: SUBSCRIPTION_SCOPE.to_string(),
    };
    encode(secret, &claims)
}

pub fn validate_subscription_token(
    secret: &str,
    token: &str,
    now: DateTime<Utc>,
) -> Result<SubscriptionClaims, JwtError> {
    let (header_b64, claims_b64, sig_b64) = decode_parts(token)?;
    verify_signature(secret, header_b64, claims_b64, sig_b64)?;

    let claims_bytes = URL_SAFE_NO_PAD
        .decode(claims_b64)
        .map_err(|_| JwtError::InvalidClaims)?;
    let claims: SubscriptionClaims =
        serde_json::from_slice(&claims_bytes).map_err(|_| JwtError::InvalidClaims)?;
    if claims.exp <= now.timestamp() {
        return Err(JwtError::Expired);
    }
    if claims.scope != SUBSCRIPTION_SCOPE {
        return Err(JwtError::WrongScope);
    }
    Ok(claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_token_roundtrips() {
        let now = Utc::now();
        let token = issue_session_token("secret", 5, "alice", 1, now);
        let claims = validate_session_token("secret", &token, now).unwrap();
        assert_eq!(claims.sub, "5");
        assert_eq!(claims.user, "alice");
        assert_eq!(claims.role_id, 1);
    }

    #[test]
    fn session_token_rejects_tampered_signature() {
        let now = Utc::now();
        let token = issue_session_token("secret", 5, "alice", 1, now);
        let mut tampered = token.clone();
        tampered.push('x');
        assert!(validate_session_token("secret", &tampered, now).is_err());
    }

    #[test]
    fn session_token_rejects_wrong_secret() {
        let now = Utc::now();
        let token = issue_session_token("secret", 5, "alice", 1, now);
        assert!(validate_session_token("other", &token, now).is_err());
    }

    #[test]
    fn session_token_expires_after_ttl() {
        let now = Utc::now();
        let token = issue_session_token("secret", 5, "alice", 1, now);
        let later = now + chrono::Duration::seconds(SESSION_TOKEN_TTL_SECONDS + 1);
        assert!(matches!(
            validate_session_token("secret", &token, later),
            Err(JwtError::Expired)
        ));
    }

    #[test]
    fn subscription_token_carries_scope_and_shorter_ttl() {
        let now = Utc::now();
        let token = issue_subscription_token("secret", 42, now);
        let claims = validate_subscription_token("secret", &token, now).unwrap();
        assert_eq!(claims.sub, "42");
        assert_eq!(claims.scope, SUBSCRIPTION_SCOPE);

        let later = now + chrono::Duration::seconds(SUBSCRIPTION_TOKEN_TTL_SECONDS + 1);
        assert!(validate_subscription_token("secret", &token, later).is_err());
    }

    #[test]
    fn session_token_rejected_as_subscription_token() {
        let now = Utc::now();
        let token = issue_session_token("secret", 5, "alice", 1, now);
        assert!(matches!(
            validate_subscription_token("secret", &token, now),
            Err(JwtError::InvalidClaims)
        ));
    }
}
