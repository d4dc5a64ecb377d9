//! Uniform HTTP response envelope and error conversion. Every handler
//! returns `Result<Json<R>, ApiError>`; `ApiError::into_response` keeps the
//! JSON envelope shape intact even on failure (HTTP status stays 200 except
//! for the 401 case, matching `original_source/go-backend/dto/response.go`).

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

use crate::domain::DomainError;

#[derive(Debug, Serialize)]
pub struct R {
    pub code: i32,
    pub msg: String,
    pub ts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl R {
    pub fn ok(data: impl Serialize) -> Self {
        Self {
            code: 0,
            msg: "success".to_string(),
            ts: Utc::now().timestamp_millis(),
            data: Some(serde_json::to_value(data).unwrap_or(Value::Null)),
        }
    }

    pub fn ok_msg(msg: impl Into<String>) -> Self {
        Self {
            code: 0,
            msg: msg.into(),
            ts: Utc::now().timestamp_millis(),
            data: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            code: -1,
            msg: msg.into(),
            ts: Utc::now().timestamp_millis(),
            data: None,
        }
    }
}

impl IntoResponse for R {
    fn into_response(self) -> Response {
        let status = if self.code == 401 {
            StatusCode::UNAUTHORIZED
        } else {
            StatusCode::OK
        };
        (status, Json(self)).into_response()
    }
}

/// A typed error that every service-layer operation returns; `IntoResponse`
/// folds it into the `R` envelope so handlers can use plain `?`.
#[derive(Debug)]
pub enum ApiError {
    Validation(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Internal(String),
}

impl ApiError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(m) | Self::NotFound(m) | Self::Forbidden(m) | Self::Internal(m) => {
                write!(f, "{m}")
            }
            Self::Unauthorized(m) => write!(f, "{m}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<DomainError> for ApiError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::NotFound { .. } => ApiError::NotFound(value.message()),
            _ => ApiError::Validation(value.message()),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(value: sqlx::Error) -> Self {
        match value {
            sqlx::Error::RowNotFound => ApiError::NotFound("记录不存在".to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Not-found is deliberately surfaced as an ordinary validation
        // failure: non-admin requests for entities they don't own look the
        // same as entities that don't exist (§7 "not-found / ownership").
        match self {
            Self::Validation(msg) | Self::NotFound(msg) | Self::Forbidden(msg) => {
                R::err(msg).into_response()
            }
            Self::Unauthorized(msg) => R {
                code: 401,
                msg,
                ts: Utc::now().timestamp_millis(),
                data: None,
            }
            .into_response(),
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "internal error");
                R::err("服务器内部错误").into_response()
            }
        }
    }
}

pub type ApiResult = Result<R, ApiError>;
