//! User CRUD, credential checks, meta attributes, and the resolution of a
//! user's effective policy statements.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use modular_core::Statement;
use serde_json::Value;

use crate::errors::{ApiError, ApiResult};
use crate::integrity::IntegrityService;
use crate::models::{Checked, EntityState, UserItem, UserMeta};
use crate::password;
use crate::storage::Store;

use super::{validate_entity_name, TokenService};

/// A meta attribute is either a value allow-list or injected aux data.
#[derive(Debug, Clone)]
pub enum MetaAttribute {
    AllowedValues(BTreeSet<String>),
    AuxData(Value),
}

pub struct UserService {
    store: Arc<dyn Store>,
    integrity: Arc<IntegrityService>,
    tokens: Arc<TokenService>,
}

impl UserService {
    pub fn new(
        store: Arc<dyn Store>,
        integrity: Arc<IntegrityService>,
        tokens: Arc<TokenService>,
    ) -> Self {
        Self { store, integrity, tokens }
    }

    fn stamp(&self, user: &mut UserItem) -> ApiResult<()> {
        user.hash = self.integrity.fingerprint(user).map_err(ApiError::internal)?;
        Ok(())
    }

    async fn fetch(&self, username: &str) -> ApiResult<UserItem> {
        self.store
            .get_user(username)
            .await?
            .ok_or_else(|| ApiError::NotFound { entity: "user", name: username.to_string() })
    }

    async fn persist(&self, user: &mut UserItem) -> ApiResult<()> {
        user.last_modification_date = Utc::now();
        self.stamp(user)?;
        self.store.put_user(user).await?;
        Ok(())
    }

    /// Create a user; when no password is given, a strong one is generated
    /// and returned exactly once.
    pub async fn create(
        &self,
        username: &str,
        password: Option<&str>,
        groups: Vec<String>,
    ) -> ApiResult<(UserItem, Option<String>)> {
        validate_entity_name("user", username)?;
        if self.store.get_user(username).await?.is_some() {
            return Err(ApiError::AlreadyExists { entity: "user", name: username.to_string() });
        }
        let mut members = BTreeSet::new();
        for group_name in groups {
            if self.store.get_group(&group_name).await?.is_none() {
                return Err(ApiError::ReferencedEntityMissing {
                    entity: "group",
                    name: group_name,
                });
            }
            members.insert(group_name);
        }
        let generated = match password {
            Some(_) => None,
            None => Some(password::generate_password()),
        };
        let effective = password.unwrap_or_else(|| generated.as_deref().expect("generated"));
        let now = Utc::now();
        let mut user = UserItem {
            username: username.to_string(),
            password_hash: password::hash_password(effective).map_err(ApiError::internal)?,
            groups: members,
            state: EntityState::Activated,
            state_reason: None,
            meta: UserMeta::default(),
            creation_date: now,
            last_modification_date: now,
            hash: String::new(),
        };
        self.stamp(&mut user)?;
        self.store.put_user(&user).await?;
        tracing::info!(username, "user created");
        Ok((user, generated))
    }

    /// Fetch a user fit for authorization: present, integrity-intact, and
    /// activated.
    pub async fn resolve_active(&self, username: &str) -> ApiResult<UserItem> {
        let user = self
            .store
            .get_user(username)
            .await?
            .ok_or(ApiError::AuthenticationFailed)?;
        if !self.integrity.verify(&user, &user.hash).is_ok() {
            return Err(ApiError::Denied {
                reason: format!("integrity check failed for user {username:?}"),
            });
        }
        if user.state == EntityState::Blocked {
            return Err(ApiError::BlockedUser {
                username: username.to_string(),
                reason: user.state_reason.clone().unwrap_or_else(|| "blocked".to_string()),
            });
        }
        Ok(user)
    }

    pub async fn verify_credentials(&self, username: &str, supplied: &str) -> ApiResult<UserItem> {
        let user = self
            .store
            .get_user(username)
            .await?
            .ok_or(ApiError::AuthenticationFailed)?;
        let valid = password::verify_password(supplied, &user.password_hash)
            .map_err(ApiError::internal)?;
        if !valid {
            return Err(ApiError::AuthenticationFailed);
        }
        self.resolve_active(username).await
    }

    pub async fn describe(&self, username: &str) -> ApiResult<Checked<UserItem>> {
        let user = self.fetch(username).await?;
        let consistency = self.integrity.verify(&user, &user.hash);
        Ok(Checked::new(user, consistency))
    }

    pub async fn list(&self) -> ApiResult<Vec<Checked<UserItem>>> {
        let users = self.store.list_users().await?;
        Ok(users
            .into_iter()
            .map(|user| {
                let consistency = self.integrity.verify(&user, &user.hash);
                Checked::new(user, consistency)
            })
            .collect())
    }

    pub async fn delete(&self, username: &str) -> ApiResult<()> {
        if !self.store.delete_user(username).await? {
            return Err(ApiError::NotFound { entity: "user", name: username.to_string() });
        }
        self.tokens.revoke_all(username).await?;
        tracing::info!(username, "user deleted");
        Ok(())
    }

    pub async fn block(&self, username: &str, reason: &str) -> ApiResult<UserItem> {
        let mut user = self.fetch(username).await?;
        user.state = EntityState::Blocked;
        user.state_reason = Some(reason.to_string());
        self.persist(&mut user).await?;
        self.tokens.revoke_all(username).await?;
        tracing::info!(username, reason, "user blocked");
        Ok(user)
    }

    pub async fn unblock(&self, username: &str) -> ApiResult<UserItem> {
        let mut user = self.fetch(username).await?;
        user.state = EntityState::Activated;
        user.state_reason = None;
        self.persist(&mut user).await?;
        tracing::info!(username, "user unblocked");
        Ok(user)
    }

    pub async fn change_password(&self, username: &str, new_password: &str) -> ApiResult<()> {
        let mut user = self.fetch(username).await?;
        user.password_hash = password::hash_password(new_password).map_err(ApiError::internal)?;
        self.persist(&mut user).await?;
        self.tokens.revoke_all(username).await?;
        tracing::info!(username, "password changed");
        Ok(())
    }

    pub async fn change_username(&self, username: &str, new_username: &str) -> ApiResult<UserItem> {
        validate_entity_name("user", new_username)?;
        if self.store.get_user(new_username).await?.is_some() {
            return Err(ApiError::AlreadyExists { entity: "user", name: new_username.to_string() });
        }
        let mut user = self.fetch(username).await?;
        user.username = new_username.to_string();
        self.persist(&mut user).await?;
        self.store.delete_user(username).await?;
        self.tokens.revoke_all(username).await?;
        tracing::info!(from = username, to = new_username, "username changed");
        Ok(user)
    }

    pub async fn add_to_group(&self, username: &str, group_name: &str) -> ApiResult<UserItem> {
        if self.store.get_group(group_name).await?.is_none() {
            return Err(ApiError::ReferencedEntityMissing {
                entity: "group",
                name: group_name.to_string(),
            });
        }
        let mut user = self.fetch(username).await?;
        if !user.groups.insert(group_name.to_string()) {
            return Err(ApiError::AlreadyExists { entity: "group", name: group_name.to_string() });
        }
        self.persist(&mut user).await?;
        Ok(user)
    }

    pub async fn remove_from_group(&self, username: &str, group_name: &str) -> ApiResult<UserItem> {
        let mut user = self.fetch(username).await?;
        if !user.groups.remove(group_name) {
            return Err(ApiError::NotFound { entity: "group", name: group_name.to_string() });
        }
        self.persist(&mut user).await?;
        Ok(user)
    }

    pub async fn set_meta_attribute(
        &self,
        username: &str,
        key: &str,
        attribute: MetaAttribute,
    ) -> ApiResult<UserItem> {
        let mut user = self.fetch(username).await?;
        let exists = user.meta.allowed_values.contains_key(key)
            || user.meta.aux_data.contains_key(key);
        if exists {
            return Err(ApiError::AlreadyExists { entity: "meta attribute", name: key.to_string() });
        }
        apply_meta(&mut user.meta, key, attribute);
        self.persist(&mut user).await?;
        Ok(user)
    }

    pub async fn update_meta_attribute(
        &self,
        username: &str,
        key: &str,
        attribute: MetaAttribute,
    ) -> ApiResult<UserItem> {
        let mut user = self.fetch(username).await?;
        let exists = user.meta.allowed_values.contains_key(key)
            || user.meta.aux_data.contains_key(key);
        if !exists {
            return Err(ApiError::NotFound { entity: "meta attribute", name: key.to_string() });
        }
        user.meta.allowed_values.remove(key);
        user.meta.aux_data.remove(key);
        apply_meta(&mut user.meta, key, attribute);
        self.persist(&mut user).await?;
        Ok(user)
    }

    pub async fn delete_meta_attribute(&self, username: &str, key: &str) -> ApiResult<UserItem> {
        let mut user = self.fetch(username).await?;
        let removed = user.meta.allowed_values.remove(key).is_some()
            | user.meta.aux_data.remove(key).is_some();
        if !removed {
            return Err(ApiError::NotFound { entity: "meta attribute", name: key.to_string() });
        }
        self.persist(&mut user).await?;
        Ok(user)
    }

    pub async fn reset_meta(&self, username: &str) -> ApiResult<UserItem> {
        let mut user = self.fetch(username).await?;
        user.meta = UserMeta::default();
        self.persist(&mut user).await?;
        Ok(user)
    }

    pub async fn get_meta(&self, username: &str) -> ApiResult<UserMeta> {
        Ok(self.fetch(username).await?.meta)
    }

    /// The union of statements across all policies of all of the user's
    /// groups. Blocked groups and policies contribute nothing; a record that
    /// fails its integrity check poisons the whole resolution, because a
    /// tampered record must not feed an authorization decision.
    pub async fn effective_statements(&self, user: &UserItem) -> ApiResult<Vec<Statement>> {
        let mut statements = Vec::new();
        for group_name in &user.groups {
            let Some(group) = self.store.get_group(group_name).await? else {
                // deleted groups drop their permissions transitively
                continue;
            };
            if !self.integrity.verify(&group, &group.hash).is_ok() {
                return Err(ApiError::Denied {
                    reason: format!("integrity check failed for group {group_name:?}"),
                });
            }
            if group.state == EntityState::Blocked {
                continue;
            }
            for policy_name in &group.policies {
                let Some(policy) = self.store.get_policy(policy_name).await? else {
                    tracing::warn!(group = %group_name, policy = %policy_name,
                        "group references a missing policy");
                    continue;
                };
                if !self.integrity.verify(&policy, &policy.hash).is_ok() {
                    return Err(ApiError::Denied {
                        reason: format!("integrity check failed for policy {policy_name:?}"),
                    });
                }
                if policy.state == EntityState::Blocked {
                    continue;
                }
                statements.extend(policy.statements.iter().cloned());
            }
        }
        Ok(statements)
    }
}

fn apply_meta(meta: &mut UserMeta, key: &str, attribute: MetaAttribute) {
    match attribute {
        MetaAttribute::AllowedValues(values) => {
            meta.allowed_values.insert(key.to_string(), values);
        }
        MetaAttribute::AuxData(value) => {
            meta.aux_data.insert(key.to_string(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{GroupService, PolicyService};
    use crate::storage::MemoryStore;
    use modular_core::policy::Effect;

    struct Fixture {
        users: UserService,
        groups: GroupService,
        policies: PolicyService,
        store: Arc<dyn Store>,
    }

    fn fixture() -> Fixture {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let integrity = Arc::new(IntegrityService::new("0123456789abcdef"));
        let tokens = Arc::new(TokenService::new(store.clone(), "0123456789abcdef"));
        Fixture {
            users: UserService::new(store.clone(), integrity.clone(), tokens),
            groups: GroupService::new(store.clone(), integrity.clone()),
            policies: PolicyService::new(store.clone(), integrity),
            store,
        }
    }

    fn allow_all() -> Statement {
        Statement {
            effect: Effect::Allow,
            module: "*".to_string(),
            resources: vec!["*".parse().unwrap()],
            description: None,
        }
    }

    #[tokio::test]
    async fn create_with_generated_password() {
        let f = fixture();
        let (user, generated) = f.users.create("alice", None, vec![]).await.unwrap();
        let generated = generated.expect("password generated");
        assert!(user.password_hash.starts_with("$argon2"));
        assert!(f.users.verify_credentials("alice", &generated).await.is_ok());
    }

    #[tokio::test]
    async fn wrong_password_fails_before_state_checks() {
        let f = fixture();
        f.users.create("alice", Some("Pa55!word-here"), vec![]).await.unwrap();
        f.users.block("alice", "policy violation").await.unwrap();
        let err = f.users.verify_credentials("alice", "wrong").await.unwrap_err();
        assert!(matches!(err, ApiError::AuthenticationFailed));
        let err = f.users.verify_credentials("alice", "Pa55!word-here").await.unwrap_err();
        assert!(matches!(err, ApiError::BlockedUser { .. }));
    }

    #[tokio::test]
    async fn unknown_group_is_a_missing_reference() {
        let f = fixture();
        let err = f
            .users
            .create("alice", Some("Pa55!word-here"), vec!["ghost".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::ReferencedEntityMissing { .. }));
    }

    #[tokio::test]
    async fn delete_then_describe_is_not_found() {
        let f = fixture();
        f.users.create("alice", Some("Pa55!word-here"), vec![]).await.unwrap();
        f.users.delete("alice").await.unwrap();
        assert!(matches!(
            f.users.describe("alice").await.unwrap_err(),
            ApiError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn meta_attribute_lifecycle() {
        let f = fixture();
        f.users.create("bob", Some("Pa55!word-here"), vec![]).await.unwrap();

        let values: BTreeSet<String> =
            ["eu-central-1".to_string(), "eu-west-1".to_string()].into();
        f.users
            .set_meta_attribute("bob", "region", MetaAttribute::AllowedValues(values.clone()))
            .await
            .unwrap();
        let err = f
            .users
            .set_meta_attribute("bob", "region", MetaAttribute::AllowedValues(values))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::AlreadyExists { .. }));

        let narrowed: BTreeSet<String> = ["eu-west-1".to_string()].into();
        f.users
            .update_meta_attribute("bob", "region", MetaAttribute::AllowedValues(narrowed))
            .await
            .unwrap();
        let meta = f.users.get_meta("bob").await.unwrap();
        assert_eq!(meta.allowed_values["region"].len(), 1);

        f.users
            .set_meta_attribute(
                "bob",
                "tenant",
                MetaAttribute::AuxData(serde_json::json!("acme")),
            )
            .await
            .unwrap();
        f.users.delete_meta_attribute("bob", "region").await.unwrap();
        f.users.reset_meta("bob").await.unwrap();
        assert!(f.users.get_meta("bob").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn effective_statements_union_over_groups() {
        let f = fixture();
        f.policies.create("p1", vec![allow_all()]).await.unwrap();
        f.policies
            .create(
                "p2",
                vec![Statement {
                    effect: Effect::Deny,
                    module: "m3admin".to_string(),
                    resources: vec!["aws".parse().unwrap()],
                    description: None,
                }],
            )
            .await
            .unwrap();
        f.groups.create("g1", vec!["p1".to_string()]).await.unwrap();
        f.groups.create("g2", vec!["p2".to_string()]).await.unwrap();
        let (user, _) = f
            .users
            .create("alice", Some("Pa55!word-here"), vec!["g1".to_string(), "g2".to_string()])
            .await
            .unwrap();
        let statements = f.users.effective_statements(&user).await.unwrap();
        assert_eq!(statements.len(), 2);
    }

    #[tokio::test]
    async fn tampered_group_poisons_resolution() {
        let f = fixture();
        f.policies.create("p1", vec![allow_all()]).await.unwrap();
        f.groups.create("g1", vec!["p1".to_string()]).await.unwrap();
        let (user, _) = f
            .users
            .create("alice", Some("Pa55!word-here"), vec!["g1".to_string()])
            .await
            .unwrap();

        // out-of-band mutation without re-stamping the hash
        let mut tampered = f.store.get_group("g1").await.unwrap().unwrap();
        tampered.policies.insert("p2".to_string());
        f.store.put_group(&tampered).await.unwrap();

        let err = f.users.effective_statements(&user).await.unwrap_err();
        assert!(matches!(err, ApiError::Denied { .. }));
    }

    #[tokio::test]
    async fn change_username_moves_the_record() {
        let f = fixture();
        f.users.create("alice", Some("Pa55!word-here"), vec![]).await.unwrap();
        f.users.change_username("alice", "alicia").await.unwrap();
        assert!(matches!(
            f.users.describe("alice").await.unwrap_err(),
            ApiError::NotFound { .. }
        ));
        let described = f.users.describe("alicia").await.unwrap();
        assert!(described.consistency.is_ok());
    }
}
