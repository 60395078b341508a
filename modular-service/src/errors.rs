//! Typed errors for the whole facade.
//!
//! Every pipeline step and identity service returns these; they cross the
//! HTTP boundary exactly once, in the [`IntoResponse`] impl, which assigns
//! the status code and a stable machine-readable kind. The correlation id is
//! logged for every translation; only internal errors get a server-side
//! backtrace log, never the client.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::storage::StoreError;

#[derive(Debug, Error)]
pub enum ApiError {
    // Authentication
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("user {username:?} is blocked: {reason}")]
    BlockedUser { username: String, reason: String },
    #[error("token has been revoked")]
    TokenRevoked,
    #[error("client version {advertised} is below the minimum supported {minimum}")]
    UnsupportedClientVersion { advertised: String, minimum: String },

    // Throttling
    #[error("rate limit exceeded for {route}")]
    RateLimited { route: String, retry_after_secs: u64 },

    // Routing and authorization
    #[error("no command is mounted at {method} {path}")]
    NoSuchRoute { method: String, path: String },
    #[error("access denied: {reason}")]
    Denied { reason: String },

    // Validation
    #[error("invalid payload: {details}")]
    InvalidPayload { details: String },
    #[error("value {value:?} is not permitted for option {option:?}")]
    RestrictedValue { option: String, value: String },

    // Upstream
    #[error("backend call failed: {reason}")]
    UpstreamError { reason: String },
    #[error("backend call timed out after {timeout_secs}s")]
    UpstreamTimeout { timeout_secs: u64 },

    // Identity services (surfaced by the CLI, not mapped to module routes)
    #[error("{entity} {name:?} not found")]
    NotFound { entity: &'static str, name: String },
    #[error("{entity} {name:?} already exists")]
    AlreadyExists { entity: &'static str, name: String },
    #[error("{entity} {name:?} referenced by this operation does not exist")]
    ReferencedEntityMissing { entity: &'static str, name: String },
    #[error("{entity} {name:?} is in state {state:?}: {detail}")]
    InvalidState { entity: &'static str, name: String, state: String, detail: String },

    // Module registry (CLI only)
    #[error("invalid module descriptor: {reason}")]
    InvalidDescriptor { reason: String },
    #[error("module {module:?} requires {dependency:?} >= {required}, installed: {installed}")]
    DependencyMissing { module: String, dependency: String, required: String, installed: String },
    #[error("mount point {mount_point:?} already belongs to module {existing:?}")]
    MountPointConflict { mount_point: String, existing: String },
    #[error("module {0:?} is not installed")]
    NotInstalled(String),

    #[error("internal error")]
    Internal {
        correlation_id: Uuid,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn internal(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Internal { correlation_id: Uuid::new_v4(), source: source.into() }
    }

    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::AuthenticationFailed | Self::TokenRevoked => StatusCode::UNAUTHORIZED,
            Self::BlockedUser { .. } | Self::Denied { .. } | Self::RestrictedValue { .. } => {
                StatusCode::FORBIDDEN
            }
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::NoSuchRoute { .. } | Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::UnsupportedClientVersion { .. }
            | Self::InvalidPayload { .. }
            | Self::InvalidDescriptor { .. }
            | Self::DependencyMissing { .. }
            | Self::NotInstalled(_)
            | Self::ReferencedEntityMissing { .. } => StatusCode::BAD_REQUEST,
            Self::AlreadyExists { .. }
            | Self::MountPointConflict { .. }
            | Self::InvalidState { .. } => StatusCode::CONFLICT,
            Self::UpstreamError { .. } => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable kind, part of the client contract.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed => "authentication_failed",
            Self::BlockedUser { .. } => "blocked_user",
            Self::TokenRevoked => "token_revoked",
            Self::UnsupportedClientVersion { .. } => "unsupported_client_version",
            Self::RateLimited { .. } => "rate_limited",
            Self::NoSuchRoute { .. } => "no_such_route",
            Self::Denied { .. } => "denied",
            Self::InvalidPayload { .. } => "invalid_payload",
            Self::RestrictedValue { .. } => "restricted_value",
            Self::UpstreamError { .. } => "upstream_error",
            Self::UpstreamTimeout { .. } => "upstream_timeout",
            Self::NotFound { .. } => "not_found",
            Self::AlreadyExists { .. } => "already_exists",
            Self::ReferencedEntityMissing { .. } => "referenced_entity_missing",
            Self::InvalidState { .. } => "invalid_state",
            Self::InvalidDescriptor { .. } => "invalid_descriptor",
            Self::DependencyMissing { .. } => "dependency_missing",
            Self::MountPointConflict { .. } => "mount_point_conflict",
            Self::NotInstalled(_) => "not_installed",
            Self::Internal { .. } => "internal_error",
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(source: StoreError) -> Self {
        Self::internal(source)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let correlation_id = match &self {
            Self::Internal { correlation_id, source } => {
                tracing::error!(%correlation_id, error = ?source, "internal error");
                *correlation_id
            }
            _ => {
                let correlation_id = Uuid::new_v4();
                tracing::warn!(%correlation_id, kind = self.kind(), error = %self, "request failed");
                correlation_id
            }
        };

        // the client never sees the internal source chain
        let message = match &self {
            Self::Internal { .. } => "internal error".to_string(),
            other => other.to_string(),
        };
        let mut body = json!({
            "error": {
                "type": self.kind(),
                "message": message,
                "status": status.as_u16(),
                "correlation_id": correlation_id.to_string(),
            }
        });
        if let Self::RateLimited { retry_after_secs, .. } = &self {
            body["error"]["retry_after_secs"] = json!(retry_after_secs);
        }

        let mut response = (status, Json(body)).into_response();
        if let Self::RateLimited { retry_after_secs, .. } = &self {
            if let Ok(value) = retry_after_secs.to_string().parse() {
                response.headers_mut().insert(axum::http::header::RETRY_AFTER, value);
            }
        }
        response
    }
}
