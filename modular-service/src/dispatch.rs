//! The request pipeline.
//!
//! Nine ordered steps; each either passes a normalized request along or
//! short-circuits with a typed error that the HTTP boundary translates once:
//! version gate, authentication, rate check, route lookup, authorization,
//! parameter validation, backend invocation, audit, response. Describe-class
//! commands skip the audit step only.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use modular_core::policy::evaluate;
use semver::Version;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::errors::{ApiError, ApiResult};
use crate::meta;
use crate::models::UserItem;
use crate::params;
use crate::rate_limit::RateLimiter;
use crate::registry::ModuleRegistry;
use crate::services::{AuditService, TokenService, UserService};

pub const CLI_VERSION_HEADER: &str = "modular-cli-version";
pub const REQUEST_ID_HEADER: &str = "x-modular-request-id";
pub const SERVER_VERSION_HEADER: &str = "x-modular-version";
pub const FORWARDED_USER_HEADER: &str = "x-modular-user";

/// Credentials presented on ingress.
pub enum Credentials {
    Basic { username: String, password: String },
    Bearer(String),
}

pub fn parse_authorization(header: &str) -> ApiResult<Credentials> {
    if let Some(encoded) = header.strip_prefix("Basic ") {
        let decoded = BASE64.decode(encoded.trim()).map_err(|_| ApiError::AuthenticationFailed)?;
        let decoded = String::from_utf8(decoded).map_err(|_| ApiError::AuthenticationFailed)?;
        let (username, password) =
            decoded.split_once(':').ok_or(ApiError::AuthenticationFailed)?;
        return Ok(Credentials::Basic {
            username: username.to_string(),
            password: password.to_string(),
        });
    }
    if let Some(token) = header.strip_prefix("Bearer ") {
        return Ok(Credentials::Bearer(token.trim().to_string()));
    }
    Err(ApiError::AuthenticationFailed)
}

pub(crate) fn check_client_version(
    minimum: Option<&Version>,
    advertised: Option<&str>,
) -> ApiResult<()> {
    let Some(minimum) = minimum else {
        return Ok(());
    };
    let Some(advertised) = advertised else {
        return Ok(());
    };
    let version: Version = advertised.trim().parse().map_err(|_| ApiError::InvalidPayload {
        details: format!("cannot parse client version {advertised:?}"),
    })?;
    if version < *minimum {
        return Err(ApiError::UnsupportedClientVersion {
            advertised: version.to_string(),
            minimum: minimum.to_string(),
        });
    }
    Ok(())
}

pub struct DispatchRequest {
    pub method: String,
    pub path: String,
    pub authorization: Option<String>,
    pub cli_version: Option<String>,
    pub query: HashMap<String, String>,
    pub body: Option<Value>,
}

pub struct DispatchResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub request_id: Uuid,
}

pub struct Dispatcher {
    users: Arc<UserService>,
    tokens: Arc<TokenService>,
    registry: Arc<ModuleRegistry>,
    limiter: RateLimiter,
    audit: Arc<AuditService>,
    http: reqwest::Client,
    min_cli_version: Option<Version>,
    private_mode: bool,
    upstream_timeout: Duration,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        users: Arc<UserService>,
        tokens: Arc<TokenService>,
        registry: Arc<ModuleRegistry>,
        limiter: RateLimiter,
        audit: Arc<AuditService>,
        min_cli_version: Option<Version>,
        private_mode: bool,
        upstream_timeout: Duration,
    ) -> Self {
        Self {
            users,
            tokens,
            registry,
            limiter,
            audit,
            http: reqwest::Client::new(),
            min_cli_version,
            private_mode,
            upstream_timeout,
        }
    }

    pub async fn authenticate(&self, authorization: Option<&str>) -> ApiResult<UserItem> {
        let header = authorization.ok_or(ApiError::AuthenticationFailed)?;
        match parse_authorization(header)? {
            Credentials::Basic { username, password } => {
                self.users.verify_credentials(&username, &password).await
            }
            Credentials::Bearer(token) => {
                let username = self.tokens.validate_access(&token).await?;
                self.users.resolve_active(&username).await
            }
        }
    }

    pub async fn dispatch(&self, request: DispatchRequest) -> ApiResult<DispatchResponse> {
        let request_id = Uuid::new_v4();
        tracing::debug!(%request_id, method = %request.method, path = %request.path,
            "dispatch started");

        // 1. version gate
        check_client_version(self.min_cli_version.as_ref(), request.cli_version.as_deref())?;

        // 2. authentication
        let user = self.authenticate(request.authorization.as_deref()).await?;

        // 3. rate check
        self.limiter.check(&user.username, &request.path).await?;

        // 4. route lookup
        let catalog = self.registry.catalog();
        let entry = catalog.lookup(&request.method, &request.path).ok_or_else(|| {
            ApiError::NoSuchRoute { method: request.method.clone(), path: request.path.clone() }
        })?;
        let module = catalog.module(&entry.module).ok_or_else(|| {
            ApiError::internal(anyhow::anyhow!("route without module entry: {}", entry.module))
        })?;

        // 5. authorization
        let statements = self.users.effective_statements(&user).await?;
        let decision = evaluate(&statements, &entry.module, &entry.command_path);
        if !decision.is_allowed() {
            let reason = if self.private_mode {
                "access denied".to_string()
            } else {
                match decision.matched() {
                    Some(statement) => format!(
                        "denied for {}:{} by policy statement{}",
                        entry.module,
                        entry.command_path,
                        statement
                            .description
                            .as_deref()
                            .map(|d| format!(" ({d})"))
                            .unwrap_or_default()
                    ),
                    None => format!(
                        "no policy statement allows {}:{}",
                        entry.module, entry.command_path
                    ),
                }
            };
            return Err(ApiError::Denied { reason });
        }

        // 6. parameter validation and restriction
        let mut parameters =
            params::normalize(&entry.meta, &request.query, request.body.as_ref())?;
        let warnings = meta::enforce(&user.meta, &mut parameters)?;

        // 7. backend invocation
        let response = self
            .forward(&user, &module.base_url, entry, &parameters)
            .await?;

        // 8. audit (success only, describe-class skipped)
        if !entry.meta.describe_class {
            let group_label = if entry.command_path.groups.is_empty() {
                entry.module.clone()
            } else {
                format!("{}/{}", entry.module, entry.command_path.groups.join("/"))
            };
            self.audit
                .record(
                    &user.username,
                    &group_label,
                    &entry.command_path.command,
                    Value::Object(parameters),
                    &response.status.to_string(),
                    warnings,
                )
                .await?;
        }

        // 9. response, body and status forwarded unmodified
        Ok(DispatchResponse { request_id, ..response })
    }

    async fn forward(
        &self,
        user: &UserItem,
        base_url: &str,
        entry: &modular_core::catalog::RouteEntry,
        parameters: &Map<String, Value>,
    ) -> ApiResult<DispatchResponse> {
        let method = reqwest::Method::from_bytes(entry.meta.route.method.as_bytes())
            .map_err(|_| ApiError::InvalidPayload {
                details: format!("unsupported method {:?}", entry.meta.route.method),
            })?;
        let url = format!("{}{}", base_url.trim_end_matches('/'), entry.meta.route.path);

        let mut builder = self
            .http
            .request(method.clone(), &url)
            .timeout(self.upstream_timeout)
            .header(FORWARDED_USER_HEADER, &user.username);
        if entry.meta.route.auth_mode() == modular_core::catalog::AuthMode::Bearer {
            let service_token = self.tokens.issue_service_token(&user.username)?;
            builder = builder.bearer_auth(service_token);
        }
        builder = if method == reqwest::Method::GET || method == reqwest::Method::HEAD {
            let pairs: Vec<(String, String)> = parameters
                .iter()
                .map(|(key, value)| (key.clone(), query_repr(value)))
                .collect();
            builder.query(&pairs)
        } else {
            builder.json(parameters)
        };

        let response = builder.send().await.map_err(|error| {
            if error.is_timeout() {
                ApiError::UpstreamTimeout { timeout_secs: self.upstream_timeout.as_secs() }
            } else {
                ApiError::UpstreamError { reason: error.to_string() }
            }
        })?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());
        let body = response
            .bytes()
            .await
            .map_err(|error| ApiError::UpstreamError { reason: error.to_string() })?
            .to_vec();
        Ok(DispatchResponse { status, body, content_type, request_id: Uuid::nil() })
    }
}

fn query_repr(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => {
            items.iter().map(query_repr).collect::<Vec<_>>().join(",")
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_credentials_parse() {
        let header = format!("Basic {}", BASE64.encode("alice:s3cret:with:colons"));
        match parse_authorization(&header).unwrap() {
            Credentials::Basic { username, password } => {
                assert_eq!(username, "alice");
                assert_eq!(password, "s3cret:with:colons");
            }
            _ => panic!("expected basic credentials"),
        }
    }

    #[test]
    fn bearer_credentials_parse() {
        match parse_authorization("Bearer abc.def.ghi").unwrap() {
            Credentials::Bearer(token) => assert_eq!(token, "abc.def.ghi"),
            _ => panic!("expected bearer credentials"),
        }
    }

    #[test]
    fn unknown_scheme_fails() {
        assert!(parse_authorization("Digest xyz").is_err());
        assert!(parse_authorization("Basic !!!not-base64!!!").is_err());
    }

    #[test]
    fn version_gate() {
        let minimum: Version = "2.0.0".parse().unwrap();
        assert!(check_client_version(None, Some("0.1.0")).is_ok());
        assert!(check_client_version(Some(&minimum), None).is_ok());
        assert!(check_client_version(Some(&minimum), Some("2.0.0")).is_ok());
        assert!(check_client_version(Some(&minimum), Some("2.1.3")).is_ok());
        let err = check_client_version(Some(&minimum), Some("1.9.9")).unwrap_err();
        assert!(matches!(err, ApiError::UnsupportedClientVersion { .. }));
        let err = check_client_version(Some(&minimum), Some("bogus")).unwrap_err();
        assert!(matches!(err, ApiError::InvalidPayload { .. }));
    }

    #[test]
    fn query_representation_flattens_lists() {
        assert_eq!(query_repr(&serde_json::json!("plain")), "plain");
        assert_eq!(query_repr(&serde_json::json!(["a", "b"])), "a,b");
        assert_eq!(query_repr(&serde_json::json!(42)), "42");
        assert_eq!(query_repr(&serde_json::json!(true)), "true");
    }
}
