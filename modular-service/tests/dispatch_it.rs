//! End-to-end scenarios against a live facade and a stub backend.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::http::Uri;
use axum::{Json, Router};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpListener;

use modular_core::policy::{Effect, Statement};
use modular_service::config::{Config, StoreMode};
use modular_service::services::MetaAttribute;
use modular_service::storage::{AuditQuery, MemoryStore, Store};
use modular_service::{app, AppContext};

fn statement(effect: Effect, module: &str, resources: &[&str]) -> Statement {
    Statement {
        effect,
        module: module.to_string(),
        resources: resources.iter().map(|r| r.parse().unwrap()).collect(),
        description: None,
    }
}

async fn spawn_stub_backend() -> String {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = Router::new().fallback(|uri: Uri, body: String| async move {
        Json(json!({"backend": uri.path(), "received": body}))
    });
    tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
    format!("http://{addr}")
}

async fn write_module_source(dir: &Path, base_url: &str) -> PathBuf {
    let source = dir.join("m3admin-src");
    tokio::fs::create_dir_all(&source).await.unwrap();
    tokio::fs::write(
        source.join("descriptor.json"),
        serde_json::to_vec_pretty(&json!({
            "module_name": "m3admin",
            "cli_path": "commands.json",
            "mount_point": "/m3admin",
            "dependencies": [],
            "version": "3.0.0",
        }))
        .unwrap(),
    )
    .await
    .unwrap();
    tokio::fs::write(
        source.join("commands.json"),
        serde_json::to_vec_pretty(&json!({
            "base_url": base_url,
            "commands": [
                {"kind": "command", "name": "aws",
                 "route": {"method": "POST", "path": "/m3admin/aws"}},
                {"kind": "command", "name": "azure",
                 "route": {"method": "POST", "path": "/m3admin/azure"}},
                {"kind": "group", "name": "tenant", "items": [
                    {"kind": "command", "name": "describe", "describe_class": true,
                     "parameters": [
                         {"name": "region", "type": "string", "required": false}
                     ],
                     "route": {"method": "POST", "path": "/m3admin/tenant/describe"}}
                ]}
            ]
        }))
        .unwrap(),
    )
    .await
    .unwrap();
    source.join("descriptor.json")
}

struct Harness {
    base: String,
    context: Arc<AppContext>,
    client: reqwest::Client,
    _workspace: TempDir,
}

async fn harness(calls_per_second_limit: Option<u32>) -> Harness {
    let workspace = tempfile::tempdir().unwrap();
    let config = Config {
        secret_key: "integration-test-secret-key".to_string(),
        mode: StoreMode::SelfHosted,
        calls_per_second_limit,
        min_cli_version: None,
        private_mode: false,
        server_log_level: "warn".to_string(),
        cli_log_level: "warn".to_string(),
        log_path: None,
        data_path: workspace.path().join("data"),
        modules_path: workspace.path().join("modules"),
        bind_addr: ([127, 0, 0, 1], 0).into(),
        upstream_timeout_secs: 5,
    };
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let context = AppContext::build(config, store).await.unwrap();

    let backend = spawn_stub_backend().await;
    let descriptor = write_module_source(workspace.path(), &backend).await;
    context.registry.install(&descriptor).await.unwrap();

    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app(context.clone());
    tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });

    Harness {
        base: format!("http://{addr}"),
        context,
        client: reqwest::Client::new(),
        _workspace: workspace,
    }
}

async fn seed_user(harness: &Harness, username: &str, resources: &[&str]) {
    let policy_name = format!("{username}-policy");
    let group_name = format!("{username}-group");
    harness
        .context
        .policies
        .create(&policy_name, vec![statement(Effect::Allow, "m3admin", resources)])
        .await
        .unwrap();
    harness.context.groups.create(&group_name, vec![policy_name]).await.unwrap();
    harness
        .context
        .users
        .create(username, Some("Pa55!word-here"), vec![group_name])
        .await
        .unwrap();
}

async fn login(harness: &Harness, username: &str) -> (String, Value) {
    let response = harness
        .client
        .post(format!("{}/login?meta=true", harness.base))
        .basic_auth(username, Some("Pa55!word-here"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    (body["access_token"].as_str().unwrap().to_string(), body)
}

async fn error_kind(response: reqwest::Response) -> (u16, String) {
    let status = response.status().as_u16();
    let body: Value = response.json().await.unwrap();
    (status, body["error"]["type"].as_str().unwrap_or_default().to_string())
}

#[tokio::test]
async fn health_check_is_unauthenticated() {
    let harness = harness(None).await;
    let response =
        harness.client.get(format!("{}/health_check", harness.base)).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn allowed_command_forwards_and_denied_command_is_rejected() {
    // seed: p1 allows only m3admin:aws; alice belongs to its group
    let harness = harness(None).await;
    seed_user(&harness, "alice", &["aws"]).await;
    let (token, login_body) = login(&harness, "alice").await;

    // the login catalog shows only the executable command
    assert_eq!(login_body["available_commands"]["m3admin"]["aws"], "command");
    assert!(login_body["available_commands"]["m3admin"].get("azure").is_none());
    assert!(login_body["meta"]["m3admin"]["items"].get("tenant").is_none());

    let response = harness
        .client
        .post(format!("{}/m3admin/aws", harness.base))
        .bearer_auth(&token)
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.headers().contains_key("x-modular-request-id"));
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["backend"], "/m3admin/aws");

    let response = harness
        .client
        .post(format!("{}/m3admin/azure", harness.base))
        .bearer_auth(&token)
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    let (status, kind) = error_kind(response).await;
    assert_eq!(status, 403);
    assert_eq!(kind, "denied");

    // the successful call is audited, with the caller and command recorded
    let records =
        harness.context.audit.query(&AuditQuery::default(), false).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].item.username, "alice");
    assert_eq!(records[0].item.command, "aws");
    assert!(records[0].consistency.is_ok());
}

#[tokio::test]
async fn deny_statement_wins_over_allow() {
    let harness = harness(None).await;
    seed_user(&harness, "alice", &["aws"]).await;
    let (token, _) = login(&harness, "alice").await;

    let response = harness
        .client
        .post(format!("{}/m3admin/aws", harness.base))
        .bearer_auth(&token)
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // add a Deny for the same command to the same policy
    harness
        .context
        .policies
        .update(
            "alice-policy",
            vec![
                statement(Effect::Allow, "m3admin", &["aws"]),
                statement(Effect::Deny, "m3admin", &["aws"]),
            ],
        )
        .await
        .unwrap();

    let response = harness
        .client
        .post(format!("{}/m3admin/aws", harness.base))
        .bearer_auth(&token)
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    let (status, kind) = error_kind(response).await;
    assert_eq!(status, 403);
    assert_eq!(kind, "denied");
}

#[tokio::test]
async fn restricted_values_guard_recognized_options() {
    let harness = harness(None).await;
    seed_user(&harness, "bob", &["tenant:*"]).await;
    harness
        .context
        .users
        .set_meta_attribute(
            "bob",
            "region",
            MetaAttribute::AllowedValues(BTreeSet::from([
                "eu-central-1".to_string(),
                "eu-west-1".to_string(),
            ])),
        )
        .await
        .unwrap();
    let (token, _) = login(&harness, "bob").await;

    let url = format!("{}/m3admin/tenant/describe", harness.base);
    let response = harness
        .client
        .post(&url)
        .bearer_auth(&token)
        .json(&json!({"region": "eu-central-1"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = harness
        .client
        .post(&url)
        .bearer_auth(&token)
        .json(&json!({"region": "us-east-1"}))
        .send()
        .await
        .unwrap();
    let (status, kind) = error_kind(response).await;
    assert_eq!(status, 403);
    assert_eq!(kind, "restricted_value");

    // describe-class commands are never audited
    let records =
        harness.context.audit.query(&AuditQuery::default(), false).await.unwrap();
    assert!(records.is_empty());
}

#[tokio::test]
async fn rate_limiter_caps_dispatches_per_second() {
    let harness = harness(Some(2)).await;
    seed_user(&harness, "carol", &["aws"]).await;
    let (token, _) = login(&harness, "carol").await;

    let url = format!("{}/m3admin/aws", harness.base);
    let mut responses = Vec::new();
    for _ in 0..5 {
        responses.push(
            harness
                .client
                .post(&url)
                .bearer_auth(&token)
                .json(&json!({}))
                .send()
                .await
                .unwrap(),
        );
    }

    let successes = responses.iter().filter(|r| r.status() == 200).count();
    let limited: Vec<&reqwest::Response> =
        responses.iter().filter(|r| r.status() == 429).collect();
    // ceiling 2 plus at most one window of fixed-window slack
    assert!(successes <= 4, "got {successes} successes");
    assert!(!limited.is_empty(), "expected at least one rate-limited call");
    assert!(limited[0].headers().contains_key("retry-after"));
}

#[tokio::test]
async fn blocking_a_user_revokes_their_token() {
    let harness = harness(None).await;
    seed_user(&harness, "dave", &["aws"]).await;
    let (token, _) = login(&harness, "dave").await;

    harness.context.users.block("dave", "off-boarded").await.unwrap();

    let response = harness
        .client
        .post(format!("{}/m3admin/aws", harness.base))
        .bearer_auth(&token)
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    let (status, kind) = error_kind(response).await;
    assert_eq!(status, 401);
    assert_eq!(kind, "token_revoked");
}

#[tokio::test]
async fn logout_revokes_the_presented_token() {
    let harness = harness(None).await;
    seed_user(&harness, "erin", &["aws"]).await;
    let (token, _) = login(&harness, "erin").await;

    let response = harness
        .client
        .post(format!("{}/logout", harness.base))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = harness
        .client
        .post(format!("{}/m3admin/aws", harness.base))
        .bearer_auth(&token)
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    let (status, kind) = error_kind(response).await;
    assert_eq!(status, 401);
    assert_eq!(kind, "token_revoked");
}

#[tokio::test]
async fn refresh_endpoint_rotates_tokens() {
    let harness = harness(None).await;
    seed_user(&harness, "frank", &["aws"]).await;
    let (_, login_body) = login(&harness, "frank").await;
    let refresh_token = login_body["refresh_token"].as_str().unwrap();

    let response = harness
        .client
        .post(format!("{}/refresh", harness.base))
        .json(&json!({"refresh_token": refresh_token}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    let fresh = body["access_token"].as_str().unwrap();

    let dispatch = harness
        .client
        .post(format!("{}/m3admin/aws", harness.base))
        .bearer_auth(fresh)
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(dispatch.status(), 200);

    // the superseded refresh token no longer works
    let replay = harness
        .client
        .post(format!("{}/refresh", harness.base))
        .json(&json!({"refresh_token": refresh_token}))
        .send()
        .await
        .unwrap();
    assert_eq!(replay.status(), 401);
}

#[tokio::test]
async fn unknown_route_is_a_404() {
    let harness = harness(None).await;
    seed_user(&harness, "gina", &["*"]).await;
    let (token, _) = login(&harness, "gina").await;

    let response = harness
        .client
        .post(format!("{}/m3admin/nope", harness.base))
        .bearer_auth(&token)
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    let (status, kind) = error_kind(response).await;
    assert_eq!(status, 404);
    assert_eq!(kind, "no_such_route");
}

#[tokio::test]
async fn swagger_document_reflects_the_caller() {
    let harness = harness(None).await;
    seed_user(&harness, "henry", &["aws"]).await;
    let (token, _) = login(&harness, "henry").await;

    let response = harness
        .client
        .get(format!("{}/swagger.json", harness.base))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert!(body["paths"]["/m3admin/aws"]["post"].is_object());
    assert!(body["paths"].get("/m3admin/azure").is_none());
}

#[tokio::test]
async fn bad_credentials_fail_authentication() {
    let harness = harness(None).await;
    seed_user(&harness, "iris", &["aws"]).await;

    let response = harness
        .client
        .post(format!("{}/login", harness.base))
        .basic_auth("iris", Some("wrong-password"))
        .send()
        .await
        .unwrap();
    let (status, kind) = error_kind(response).await;
    assert_eq!(status, 401);
    assert_eq!(kind, "authentication_failed");

    let response = harness
        .client
        .post(format!("{}/m3admin/aws", harness.base))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    let (status, _) = error_kind(response).await;
    assert_eq!(status, 401);
}
