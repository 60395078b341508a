//! Process-wide context and router assembly.
//!
//! One `AppContext` is built at startup and threaded into every handler via
//! axum state; there are no globals.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::errors::ApiResult;
use crate::handlers;
use crate::integrity::IntegrityService;
use crate::rate_limit::RateLimiter;
use crate::registry::ModuleRegistry;
use crate::services::{AuditService, GroupService, PolicyService, TokenService, UserService};
use crate::storage::Store;

pub struct AppContext {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub integrity: Arc<IntegrityService>,
    pub policies: Arc<PolicyService>,
    pub groups: Arc<GroupService>,
    pub users: Arc<UserService>,
    pub tokens: Arc<TokenService>,
    pub audit: Arc<AuditService>,
    pub registry: Arc<ModuleRegistry>,
    pub dispatcher: Dispatcher,
}

impl AppContext {
    pub async fn build(config: Config, store: Arc<dyn Store>) -> ApiResult<Arc<Self>> {
        let integrity = Arc::new(IntegrityService::new(&config.secret_key));
        let tokens = Arc::new(TokenService::new(store.clone(), &config.secret_key));
        let policies = Arc::new(PolicyService::new(store.clone(), integrity.clone()));
        let groups = Arc::new(GroupService::new(store.clone(), integrity.clone()));
        let users =
            Arc::new(UserService::new(store.clone(), integrity.clone(), tokens.clone()));
        let audit = Arc::new(AuditService::new(store.clone(), integrity.clone()));
        let registry = Arc::new(ModuleRegistry::open(config.modules_path.clone()).await?);
        let limiter = RateLimiter::new(store.clone(), config.calls_per_second_limit);
        let dispatcher = Dispatcher::new(
            users.clone(),
            tokens.clone(),
            registry.clone(),
            limiter,
            audit.clone(),
            config.min_cli_version.clone(),
            config.private_mode,
            Duration::from_secs(config.upstream_timeout_secs),
        );
        Ok(Arc::new(Self {
            config,
            store,
            integrity,
            policies,
            groups,
            users,
            tokens,
            audit,
            registry,
            dispatcher,
        }))
    }
}

/// Bind the configured address and serve until shutdown.
pub async fn serve(context: Arc<AppContext>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(context.config.bind_addr).await?;
    tracing::info!("modular-api listening on {}", context.config.bind_addr);
    axum::serve(listener, app(context)).await?;
    Ok(())
}

/// Build the router: the fixed surface plus a fallback that dispatches any
/// mounted module route.
pub fn app(context: Arc<AppContext>) -> Router {
    Router::new()
        .route("/login", post(handlers::login))
        .route("/logout", post(handlers::logout))
        .route("/refresh", post(handlers::refresh))
        .route("/health_check", get(handlers::health_check))
        .route("/swagger.json", get(handlers::swagger))
        .fallback(handlers::dispatch_any)
        .layer(TraceLayer::new_for_http())
        .with_state(context)
}
