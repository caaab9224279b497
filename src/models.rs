//! Shared decision types and API error kinds.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse decision class used for metrics and the decision bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Allow,
    Block,
    Verify,
    Sanitize,
}

impl Family {
    pub fn as_str(&self) -> &'static str {
        match self {
            Family::Allow => "allow",
            Family::Block => "block",
            Family::Verify => "verify",
            Family::Sanitize => "sanitize",
        }
    }
}

/// Runtime operational mode carried in `X-Guardrail-Mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Normal,
    EgressOnly,
    ExecuteLocked,
    FullQuarantine,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Normal => "normal",
            Mode::EgressOnly => "egress_only",
            Mode::ExecuteLocked => "execute_locked",
            Mode::FullQuarantine => "full_quarantine",
        }
    }
}

/// Terminal per-rule action produced by the detectors + policy compose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Clarify,
    Deny,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Allow => "allow",
            Action::Clarify => "clarify",
            Action::Deny => "deny",
        }
    }

    pub fn family(&self) -> Family {
        match self {
            Action::Allow => Family::Allow,
            Action::Clarify => Family::Verify,
            Action::Deny => Family::Block,
        }
    }
}

/// One record on the decision bus and in the decisions NDJSON log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionEvent {
    #[serde(default)]
    pub ts: i64,
    pub incident_id: String,
    pub request_id: String,
    pub tenant: String,
    pub bot: String,
    pub family: Family,
    pub mode: Mode,
    pub status: u16,
    pub endpoint: String,
    #[serde(default)]
    pub rule_ids: Vec<String>,
    pub policy_version: String,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shadow_action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shadow_rule_ids: Option<Vec<String>>,
}

/// API error kinds mapped to stable JSON bodies. Response bodies stay
/// small and never carry secret material.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("validation failed: {0}")]
    ValidationFailed(String),
    #[error("store unavailable")]
    StoreUnavailable,
    #[error("internal: {0}")]
    Internal(String),
}

impl ApiError {
    fn code(&self) -> (&'static str, StatusCode) {
        match self {
            ApiError::BadRequest(_) => ("bad_request", StatusCode::BAD_REQUEST),
            ApiError::Unauthorized => ("unauthorized", StatusCode::UNAUTHORIZED),
            ApiError::Forbidden => ("forbidden", StatusCode::FORBIDDEN),
            ApiError::NotFound => ("not_found", StatusCode::NOT_FOUND),
            ApiError::Conflict(_) => ("conflict", StatusCode::CONFLICT),
            ApiError::ValidationFailed(_) => {
                ("validation_failed", StatusCode::UNPROCESSABLE_ENTITY)
            }
            ApiError::StoreUnavailable => {
                ("store_unavailable", StatusCode::SERVICE_UNAVAILABLE)
            }
            ApiError::Internal(_) => ("internal_error", StatusCode::INTERNAL_SERVER_ERROR),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, status) = self.code();
        let body = serde_json::json!({
            "code": code,
            "detail": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_round_trip() {
        let json = serde_json::to_string(&Family::Sanitize).unwrap();
        assert_eq!(json, "\"sanitize\"");
        let back: Family = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Family::Sanitize);
    }

    #[test]
    fn test_mode_serialization_uses_snake_case() {
        assert_eq!(
            serde_json::to_string(&Mode::FullQuarantine).unwrap(),
            "\"full_quarantine\""
        );
    }

    #[test]
    fn test_action_families() {
        assert_eq!(Action::Deny.family(), Family::Block);
        assert_eq!(Action::Clarify.family(), Family::Verify);
        assert_eq!(Action::Allow.family(), Family::Allow);
    }

    #[test]
    fn test_api_error_statuses() {
        let resp = ApiError::Conflict("in progress".into()).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let resp = ApiError::StoreUnavailable.into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
