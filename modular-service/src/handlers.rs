//! HTTP handlers for the fixed surface, plus the fallback that feeds every
//! mounted module route into the dispatcher.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::app::AppContext;
use crate::dispatch::{
    check_client_version, parse_authorization, Credentials, DispatchRequest, CLI_VERSION_HEADER,
    REQUEST_ID_HEADER, SERVER_VERSION_HEADER,
};
use crate::errors::{ApiError, ApiResult};
use crate::models::UserItem;

pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Deserialize)]
pub struct LoginQuery {
    #[serde(default)]
    pub meta: bool,
}

#[derive(Debug, Deserialize)]
pub struct LoginBody {
    pub username: String,
    pub password: String,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

async fn login_user(
    context: &AppContext,
    headers: &HeaderMap,
    body: Option<&LoginBody>,
) -> ApiResult<UserItem> {
    if let Some(header) = header_str(headers, header::AUTHORIZATION.as_str()) {
        return match parse_authorization(header)? {
            Credentials::Basic { username, password } => {
                context.users.verify_credentials(&username, &password).await
            }
            Credentials::Bearer(_) => Err(ApiError::AuthenticationFailed),
        };
    }
    let body = body.ok_or(ApiError::AuthenticationFailed)?;
    context.users.verify_credentials(&body.username, &body.password).await
}

/// Reduce the full API meta to a nested name tree, the lightweight catalog
/// returned by every login.
fn command_names(meta: &Value) -> Value {
    fn reduce_items(items: &Value) -> Value {
        let mut out = Map::new();
        if let Value::Object(entries) = items {
            for (name, node) in entries {
                match node.get("kind").and_then(Value::as_str) {
                    Some("group") => {
                        out.insert(name.clone(), reduce_items(&node["items"]));
                    }
                    _ => {
                        out.insert(name.clone(), Value::String("command".to_string()));
                    }
                }
            }
        }
        Value::Object(out)
    }

    let mut out = Map::new();
    if let Value::Object(modules) = meta {
        for (module, node) in modules {
            out.insert(module.clone(), reduce_items(&node["items"]));
        }
    }
    Value::Object(out)
}

pub async fn login(
    State(context): State<Arc<AppContext>>,
    Query(query): Query<LoginQuery>,
    headers: HeaderMap,
    body: Option<Json<LoginBody>>,
) -> Result<Json<Value>, ApiError> {
    check_client_version(
        context.config.min_cli_version.as_ref(),
        header_str(&headers, CLI_VERSION_HEADER),
    )?;
    let user = login_user(&context, &headers, body.as_deref()).await?;
    let pair = context.tokens.issue_pair(&user.username).await?;
    let statements = context.users.effective_statements(&user).await?;
    let meta = context.registry.meta_for(&statements);

    let mut response = json!({
        "access_token": pair.access_token,
        "refresh_token": pair.refresh_token,
        "expires_in": pair.expires_in,
        "token_type": "Bearer",
        "available_commands": command_names(&meta),
    });
    if query.meta {
        response["meta"] = meta;
    }
    tracing::info!(username = %user.username, "login succeeded");
    Ok(Json(response))
}

pub async fn refresh(
    State(context): State<Arc<AppContext>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let token = body
        .get("refresh_token")
        .and_then(Value::as_str)
        .ok_or(ApiError::InvalidPayload { details: "refresh_token is required".to_string() })?;
    let pair = context.tokens.refresh(token).await?;
    Ok(Json(json!({
        "access_token": pair.access_token,
        "refresh_token": pair.refresh_token,
        "expires_in": pair.expires_in,
        "token_type": "Bearer",
    })))
}

pub async fn logout(
    State(context): State<Arc<AppContext>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let header =
        header_str(&headers, header::AUTHORIZATION.as_str()).ok_or(ApiError::AuthenticationFailed)?;
    let Credentials::Bearer(token) = parse_authorization(header)? else {
        return Err(ApiError::AuthenticationFailed);
    };
    let username = context.tokens.validate_access(&token).await?;
    context.tokens.revoke_all(&username).await?;
    Ok(Json(json!({"message": "logged out"})))
}

pub async fn health_check() -> Json<Value> {
    Json(json!({"status": "ok", "version": SERVER_VERSION}))
}

pub async fn swagger(
    State(context): State<Arc<AppContext>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let user = context
        .dispatcher
        .authenticate(header_str(&headers, header::AUTHORIZATION.as_str()))
        .await?;
    let statements = context.users.effective_statements(&user).await?;
    let document = crate::openapi::build_document(&context.registry.catalog(), &statements);
    serde_json::to_value(&document).map(Json).map_err(ApiError::internal)
}

/// Fallback handler: every request that is not part of the fixed surface is
/// a module command dispatch.
pub async fn dispatch_any(
    State(context): State<Arc<AppContext>>,
    method: Method,
    uri: Uri,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let body = if body.is_empty() {
        None
    } else {
        Some(serde_json::from_slice::<Value>(&body).map_err(|source| {
            ApiError::InvalidPayload { details: format!("request body is not valid JSON: {source}") }
        })?)
    };
    let request = DispatchRequest {
        method: method.to_string(),
        path: uri.path().to_string(),
        authorization: header_str(&headers, header::AUTHORIZATION.as_str())
            .map(|value| value.to_string()),
        cli_version: header_str(&headers, CLI_VERSION_HEADER).map(|value| value.to_string()),
        query,
        body,
    };

    let outcome = context.dispatcher.dispatch(request).await?;
    let mut response = Response::builder()
        .status(StatusCode::from_u16(outcome.status).map_err(ApiError::internal)?);
    if let Some(content_type) = &outcome.content_type {
        response = response.header(header::CONTENT_TYPE, content_type);
    }
    response = response
        .header(REQUEST_ID_HEADER, outcome.request_id.to_string())
        .header(SERVER_VERSION_HEADER, SERVER_VERSION);
    response
        .body(axum::body::Body::from(outcome.body))
        .map_err(ApiError::internal)
}
