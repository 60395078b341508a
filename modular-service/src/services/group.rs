//! Group CRUD. A group is a named bundle of policies; attaching a policy
//! requires it to exist and be activated at that moment.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;

use crate::errors::{ApiError, ApiResult};
use crate::integrity::IntegrityService;
use crate::models::{Checked, EntityState, GroupItem};
use crate::storage::Store;

use super::validate_entity_name;

pub struct GroupService {
    store: Arc<dyn Store>,
    integrity: Arc<IntegrityService>,
}

impl GroupService {
    pub fn new(store: Arc<dyn Store>, integrity: Arc<IntegrityService>) -> Self {
        Self { store, integrity }
    }

    fn stamp(&self, group: &mut GroupItem) -> ApiResult<()> {
        group.hash = self.integrity.fingerprint(group).map_err(ApiError::internal)?;
        Ok(())
    }

    async fn require_activated_policy(&self, policy_name: &str) -> ApiResult<()> {
        let policy = self.store.get_policy(policy_name).await?.ok_or(
            ApiError::ReferencedEntityMissing { entity: "policy", name: policy_name.to_string() },
        )?;
        if policy.state != EntityState::Activated {
            return Err(ApiError::InvalidState {
                entity: "policy",
                name: policy_name.to_string(),
                state: "blocked".to_string(),
                detail: "only activated policies can be attached to a group".to_string(),
            });
        }
        Ok(())
    }

    pub async fn create(&self, name: &str, policies: Vec<String>) -> ApiResult<GroupItem> {
        validate_entity_name("group", name)?;
        if self.store.get_group(name).await?.is_some() {
            return Err(ApiError::AlreadyExists { entity: "group", name: name.to_string() });
        }
        let mut attached = BTreeSet::new();
        for policy_name in policies {
            self.require_activated_policy(&policy_name).await?;
            if !attached.insert(policy_name.clone()) {
                return Err(ApiError::InvalidPayload {
                    details: format!("policy {policy_name:?} listed twice"),
                });
            }
        }
        let now = Utc::now();
        let mut group = GroupItem {
            group_name: name.to_string(),
            policies: attached,
            state: EntityState::Activated,
            creation_date: now,
            last_modification_date: now,
            hash: String::new(),
        };
        self.stamp(&mut group)?;
        self.store.put_group(&group).await?;
        tracing::info!(group = name, "group created");
        Ok(group)
    }

    pub async fn add_policy(&self, name: &str, policy_name: &str) -> ApiResult<GroupItem> {
        let mut group = self
            .store
            .get_group(name)
            .await?
            .ok_or_else(|| ApiError::NotFound { entity: "group", name: name.to_string() })?;
        self.require_activated_policy(policy_name).await?;
        if !group.policies.insert(policy_name.to_string()) {
            return Err(ApiError::AlreadyExists { entity: "policy", name: policy_name.to_string() });
        }
        group.last_modification_date = Utc::now();
        self.stamp(&mut group)?;
        self.store.put_group(&group).await?;
        tracing::info!(group = name, policy = policy_name, "policy attached to group");
        Ok(group)
    }

    pub async fn delete_policy(&self, name: &str, policy_name: &str) -> ApiResult<GroupItem> {
        let mut group = self
            .store
            .get_group(name)
            .await?
            .ok_or_else(|| ApiError::NotFound { entity: "group", name: name.to_string() })?;
        if !group.policies.remove(policy_name) {
            return Err(ApiError::NotFound { entity: "policy", name: policy_name.to_string() });
        }
        group.last_modification_date = Utc::now();
        self.stamp(&mut group)?;
        self.store.put_group(&group).await?;
        tracing::info!(group = name, policy = policy_name, "policy detached from group");
        Ok(group)
    }

    pub async fn describe(&self, name: &str) -> ApiResult<Checked<GroupItem>> {
        let group = self
            .store
            .get_group(name)
            .await?
            .ok_or_else(|| ApiError::NotFound { entity: "group", name: name.to_string() })?;
        let consistency = self.integrity.verify(&group, &group.hash);
        Ok(Checked::new(group, consistency))
    }

    pub async fn list(&self) -> ApiResult<Vec<Checked<GroupItem>>> {
        let groups = self.store.list_groups().await?;
        Ok(groups
            .into_iter()
            .map(|group| {
                let consistency = self.integrity.verify(&group, &group.hash);
                Checked::new(group, consistency)
            })
            .collect())
    }

    /// Deletion is immediate; users referencing the group simply lose the
    /// permissions it granted.
    pub async fn delete(&self, name: &str) -> ApiResult<()> {
        if !self.store.delete_group(name).await? {
            return Err(ApiError::NotFound { entity: "group", name: name.to_string() });
        }
        tracing::info!(group = name, "group deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::PolicyService;
    use crate::storage::MemoryStore;
    use modular_core::policy::{Effect, Statement};

    fn services() -> (GroupService, PolicyService) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let integrity = Arc::new(IntegrityService::new("0123456789abcdef"));
        (
            GroupService::new(store.clone(), integrity.clone()),
            PolicyService::new(store, integrity),
        )
    }

    async fn seed_policy(policies: &PolicyService, name: &str) {
        policies
            .create(
                name,
                vec![Statement {
                    effect: Effect::Allow,
                    module: "*".to_string(),
                    resources: vec!["*".parse().unwrap()],
                    description: None,
                }],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn create_requires_existing_policies() {
        let (groups, _) = services();
        let err = groups.create("g1", vec!["missing".to_string()]).await.unwrap_err();
        assert!(matches!(err, ApiError::ReferencedEntityMissing { .. }));
    }

    #[tokio::test]
    async fn attach_and_detach_policies() {
        let (groups, policies) = services();
        seed_policy(&policies, "p1").await;
        seed_policy(&policies, "p2").await;

        let group = groups.create("g1", vec!["p1".to_string()]).await.unwrap();
        let first_hash = group.hash.clone();

        let group = groups.add_policy("g1", "p2").await.unwrap();
        assert_ne!(group.hash, first_hash);
        assert_eq!(group.policies.len(), 2);

        let group = groups.delete_policy("g1", "p1").await.unwrap();
        assert_eq!(group.policies.len(), 1);
        assert!(groups.describe("g1").await.unwrap().consistency.is_ok());

        let err = groups.delete_policy("g1", "p1").await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound { .. }));
    }

    #[tokio::test]
    async fn duplicate_attachment_is_rejected() {
        let (groups, policies) = services();
        seed_policy(&policies, "p1").await;
        groups.create("g1", vec!["p1".to_string()]).await.unwrap();
        let err = groups.add_policy("g1", "p1").await.unwrap_err();
        assert!(matches!(err, ApiError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn delete_is_immediate() {
        let (groups, policies) = services();
        seed_policy(&policies, "p1").await;
        groups.create("g1", vec!["p1".to_string()]).await.unwrap();
        groups.delete("g1").await.unwrap();
        assert!(matches!(
            groups.describe("g1").await.unwrap_err(),
            ApiError::NotFound { .. }
        ));
    }
}
