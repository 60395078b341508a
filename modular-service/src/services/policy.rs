//! Policy CRUD.

use std::sync::Arc;

use chrono::Utc;
use modular_core::Statement;

use crate::errors::{ApiError, ApiResult};
use crate::integrity::IntegrityService;
use crate::models::{Checked, EntityState, PolicyItem};
use crate::storage::Store;

use super::validate_entity_name;

pub struct PolicyService {
    store: Arc<dyn Store>,
    integrity: Arc<IntegrityService>,
}

impl PolicyService {
    pub fn new(store: Arc<dyn Store>, integrity: Arc<IntegrityService>) -> Self {
        Self { store, integrity }
    }

    fn validate_statements(statements: &[Statement]) -> ApiResult<()> {
        if statements.is_empty() {
            return Err(ApiError::InvalidPayload {
                details: "a policy requires at least one statement".to_string(),
            });
        }
        for statement in statements {
            if statement.module.is_empty() {
                return Err(ApiError::InvalidPayload {
                    details: "statement Module must be non-empty".to_string(),
                });
            }
            if statement.resources.is_empty() {
                return Err(ApiError::InvalidPayload {
                    details: "statement Resources must be non-empty".to_string(),
                });
            }
        }
        Ok(())
    }

    fn stamp(&self, policy: &mut PolicyItem) -> ApiResult<()> {
        policy.hash = self.integrity.fingerprint(policy).map_err(ApiError::internal)?;
        Ok(())
    }

    pub async fn create(&self, name: &str, statements: Vec<Statement>) -> ApiResult<PolicyItem> {
        validate_entity_name("policy", name)?;
        Self::validate_statements(&statements)?;
        if self.store.get_policy(name).await?.is_some() {
            return Err(ApiError::AlreadyExists { entity: "policy", name: name.to_string() });
        }
        let now = Utc::now();
        let mut policy = PolicyItem {
            policy_name: name.to_string(),
            statements,
            state: EntityState::Activated,
            creation_date: now,
            last_modification_date: now,
            hash: String::new(),
        };
        self.stamp(&mut policy)?;
        self.store.put_policy(&policy).await?;
        tracing::info!(policy = name, "policy created");
        Ok(policy)
    }

    /// Replace the statement list wholesale; order is preserved as given.
    pub async fn update(&self, name: &str, statements: Vec<Statement>) -> ApiResult<PolicyItem> {
        Self::validate_statements(&statements)?;
        let mut policy = self
            .store
            .get_policy(name)
            .await?
            .ok_or_else(|| ApiError::NotFound { entity: "policy", name: name.to_string() })?;
        policy.statements = statements;
        policy.last_modification_date = Utc::now();
        self.stamp(&mut policy)?;
        self.store.put_policy(&policy).await?;
        tracing::info!(policy = name, "policy updated");
        Ok(policy)
    }

    pub async fn describe(&self, name: &str) -> ApiResult<Checked<PolicyItem>> {
        let policy = self
            .store
            .get_policy(name)
            .await?
            .ok_or_else(|| ApiError::NotFound { entity: "policy", name: name.to_string() })?;
        let consistency = self.integrity.verify(&policy, &policy.hash);
        Ok(Checked::new(policy, consistency))
    }

    pub async fn list(&self) -> ApiResult<Vec<Checked<PolicyItem>>> {
        let policies = self.store.list_policies().await?;
        Ok(policies
            .into_iter()
            .map(|policy| {
                let consistency = self.integrity.verify(&policy, &policy.hash);
                Checked::new(policy, consistency)
            })
            .collect())
    }

    /// Groups currently referencing the policy. Callers are expected to run
    /// this check before `delete`.
    pub async fn referencing_groups(&self, name: &str) -> ApiResult<Vec<String>> {
        let groups = self.store.list_groups().await?;
        Ok(groups
            .into_iter()
            .filter(|group| group.policies.contains(name))
            .map(|group| group.group_name)
            .collect())
    }

    pub async fn delete(&self, name: &str) -> ApiResult<()> {
        if !self.store.delete_policy(name).await? {
            return Err(ApiError::NotFound { entity: "policy", name: name.to_string() });
        }
        tracing::info!(policy = name, "policy deleted");
        Ok(())
    }
}
