//! In-memory store, the test and development backend.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::models::{AuditRecord, GroupItem, PolicyItem, RefreshTokenRecord, TokenRecord, UserItem};

use super::{AuditQuery, Store, StoreResult};

#[derive(Default)]
struct State {
    users: HashMap<String, UserItem>,
    groups: HashMap<String, GroupItem>,
    policies: HashMap<String, PolicyItem>,
    audit: Vec<AuditRecord>,
    // username -> jti -> record
    tokens: HashMap<String, HashMap<String, TokenRecord>>,
    refresh_tokens: HashMap<String, RefreshTokenRecord>,
    // "user|route|second" -> count
    counters: HashMap<String, u64>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn counter_key(username: &str, route: &str, second: u64) -> String {
    format!("{username}|{route}|{second}")
}

pub(super) fn counter_second(key: &str) -> Option<u64> {
    key.rsplit('|').next()?.parse().ok()
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_user(&self, username: &str) -> StoreResult<Option<UserItem>> {
        Ok(self.state.read().await.users.get(username).cloned())
    }

    async fn put_user(&self, user: &UserItem) -> StoreResult<()> {
        self.state.write().await.users.insert(user.username.clone(), user.clone());
        Ok(())
    }

    async fn delete_user(&self, username: &str) -> StoreResult<bool> {
        Ok(self.state.write().await.users.remove(username).is_some())
    }

    async fn list_users(&self) -> StoreResult<Vec<UserItem>> {
        let mut users: Vec<UserItem> = self.state.read().await.users.values().cloned().collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(users)
    }

    async fn get_group(&self, group_name: &str) -> StoreResult<Option<GroupItem>> {
        Ok(self.state.read().await.groups.get(group_name).cloned())
    }

    async fn put_group(&self, group: &GroupItem) -> StoreResult<()> {
        self.state.write().await.groups.insert(group.group_name.clone(), group.clone());
        Ok(())
    }

    async fn delete_group(&self, group_name: &str) -> StoreResult<bool> {
        Ok(self.state.write().await.groups.remove(group_name).is_some())
    }

    async fn list_groups(&self) -> StoreResult<Vec<GroupItem>> {
        let mut groups: Vec<GroupItem> = self.state.read().await.groups.values().cloned().collect();
        groups.sort_by(|a, b| a.group_name.cmp(&b.group_name));
        Ok(groups)
    }

    async fn get_policy(&self, policy_name: &str) -> StoreResult<Option<PolicyItem>> {
        Ok(self.state.read().await.policies.get(policy_name).cloned())
    }

    async fn put_policy(&self, policy: &PolicyItem) -> StoreResult<()> {
        self.state.write().await.policies.insert(policy.policy_name.clone(), policy.clone());
        Ok(())
    }

    async fn delete_policy(&self, policy_name: &str) -> StoreResult<bool> {
        Ok(self.state.write().await.policies.remove(policy_name).is_some())
    }

    async fn list_policies(&self) -> StoreResult<Vec<PolicyItem>> {
        let mut policies: Vec<PolicyItem> =
            self.state.read().await.policies.values().cloned().collect();
        policies.sort_by(|a, b| a.policy_name.cmp(&b.policy_name));
        Ok(policies)
    }

    async fn append_audit(&self, record: &AuditRecord) -> StoreResult<()> {
        self.state.write().await.audit.push(record.clone());
        Ok(())
    }

    async fn query_audit(&self, query: &AuditQuery) -> StoreResult<Vec<AuditRecord>> {
        Ok(self
            .state
            .read()
            .await
            .audit
            .iter()
            .filter(|record| query.matches(record))
            .cloned()
            .collect())
    }

    async fn put_token(&self, token: &TokenRecord) -> StoreResult<()> {
        self.state
            .write()
            .await
            .tokens
            .entry(token.username.clone())
            .or_default()
            .insert(token.jti.clone(), token.clone());
        Ok(())
    }

    async fn get_token(&self, username: &str, jti: &str) -> StoreResult<Option<TokenRecord>> {
        Ok(self
            .state
            .read()
            .await
            .tokens
            .get(username)
            .and_then(|by_jti| by_jti.get(jti))
            .cloned())
    }

    async fn delete_user_tokens(&self, username: &str) -> StoreResult<u64> {
        Ok(self
            .state
            .write()
            .await
            .tokens
            .remove(username)
            .map(|by_jti| by_jti.len() as u64)
            .unwrap_or(0))
    }

    async fn get_refresh_token(&self, username: &str) -> StoreResult<Option<RefreshTokenRecord>> {
        Ok(self.state.read().await.refresh_tokens.get(username).cloned())
    }

    async fn put_refresh_token(&self, record: &RefreshTokenRecord) -> StoreResult<()> {
        self.state
            .write()
            .await
            .refresh_tokens
            .insert(record.username.clone(), record.clone());
        Ok(())
    }

    async fn delete_refresh_token(&self, username: &str) -> StoreResult<bool> {
        Ok(self.state.write().await.refresh_tokens.remove(username).is_some())
    }

    async fn increment_usage(
        &self,
        username: &str,
        route: &str,
        second: u64,
    ) -> StoreResult<u64> {
        let mut state = self.state.write().await;
        let horizon = second.saturating_sub(2);
        state
            .counters
            .retain(|key, _| counter_second(key).map_or(true, |s| s >= horizon));
        let count = state
            .counters
            .entry(counter_key(username, route, second))
            .and_modify(|count| *count += 1)
            .or_insert(1);
        Ok(*count)
    }
}
