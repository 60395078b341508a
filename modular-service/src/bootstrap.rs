//! Idempotent first-start seeding: the admin policy, group, and user.
//!
//! Safe to run on every start; existing entities are left untouched. The
//! admin password comes from `MODULAR_API_INIT_PASSWORD` when set, otherwise
//! it is generated and surfaced exactly once through the outcome.

use modular_core::policy::{Effect, Statement};

use crate::errors::{ApiError, ApiResult};
use crate::services::{GroupService, PolicyService, UserService};

pub const ADMIN_POLICY: &str = "admin_policy";
pub const ADMIN_GROUP: &str = "admin_group";
pub const ADMIN_USER: &str = "admin";

#[derive(Debug, Default)]
pub struct InitOutcome {
    pub created_policy: bool,
    pub created_group: bool,
    pub created_user: bool,
    /// Set only when the admin user was created with a generated password.
    pub admin_password: Option<String>,
}

fn admin_statements() -> Vec<Statement> {
    vec![Statement {
        effect: Effect::Allow,
        module: "*".to_string(),
        resources: vec!["*".parse().expect("valid pattern")],
        description: Some("Admin policy".to_string()),
    }]
}

pub async fn init(
    policies: &PolicyService,
    groups: &GroupService,
    users: &UserService,
) -> ApiResult<InitOutcome> {
    let mut outcome = InitOutcome::default();

    match policies.describe(ADMIN_POLICY).await {
        Ok(_) => tracing::info!("admin policy already exists, skipping"),
        Err(ApiError::NotFound { .. }) => {
            policies.create(ADMIN_POLICY, admin_statements()).await?;
            outcome.created_policy = true;
        }
        Err(error) => return Err(error),
    }

    match groups.describe(ADMIN_GROUP).await {
        Ok(_) => tracing::info!("admin group already exists, skipping"),
        Err(ApiError::NotFound { .. }) => {
            groups.create(ADMIN_GROUP, vec![ADMIN_POLICY.to_string()]).await?;
            outcome.created_group = true;
        }
        Err(error) => return Err(error),
    }

    match users.describe(ADMIN_USER).await {
        Ok(_) => tracing::info!("admin user already exists, skipping"),
        Err(ApiError::NotFound { .. }) => {
            let configured = std::env::var("MODULAR_API_INIT_PASSWORD").ok();
            let (_, generated) = users
                .create(ADMIN_USER, configured.as_deref(), vec![ADMIN_GROUP.to_string()])
                .await?;
            outcome.created_user = true;
            outcome.admin_password = generated;
        }
        Err(error) => return Err(error),
    }

    tracing::debug!("initialization finished");
    Ok(outcome)
}
