//! File-backed store: one JSON document set per collection under a data
//! directory. This is the default backend for single-node deployments, and
//! it is what lets the server and the admin CLI operate on the same state.
//!
//! Writes go through a temp file plus rename, and happen while the state
//! lock is held, so a collection file always contains a complete snapshot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::RwLock;

use crate::models::{
    AuditRecord, GroupItem, PolicyItem, RefreshTokenRecord, TokenRecord, UsageCounter, UserItem,
};

use super::memory::counter_second;
use super::{collections, AuditQuery, Store, StoreError, StoreResult};

#[derive(Default)]
struct State {
    users: HashMap<String, UserItem>,
    groups: HashMap<String, GroupItem>,
    policies: HashMap<String, PolicyItem>,
    audit: Vec<AuditRecord>,
    tokens: Vec<TokenRecord>,
    refresh_tokens: HashMap<String, RefreshTokenRecord>,
    counters: HashMap<String, u64>,
}

pub struct FileStore {
    dir: PathBuf,
    state: RwLock<State>,
}

impl FileStore {
    pub async fn open(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await.map_err(|source| StoreError::Io {
            path: dir.display().to_string(),
            source,
        })?;

        let users: Vec<UserItem> = read_collection(&dir, collections::USERS).await?;
        let groups: Vec<GroupItem> = read_collection(&dir, collections::GROUPS).await?;
        let policies: Vec<PolicyItem> = read_collection(&dir, collections::POLICIES).await?;
        let audit: Vec<AuditRecord> = read_collection(&dir, collections::AUDIT).await?;
        let tokens: Vec<TokenRecord> = read_collection(&dir, collections::TOKENS).await?;
        let refresh: Vec<RefreshTokenRecord> =
            read_collection(&dir, collections::REFRESH_TOKENS).await?;
        let counters: Vec<UsageCounter> =
            read_collection(&dir, collections::USAGE_COUNTERS).await?;

        let state = State {
            users: users.into_iter().map(|u| (u.username.clone(), u)).collect(),
            groups: groups.into_iter().map(|g| (g.group_name.clone(), g)).collect(),
            policies: policies.into_iter().map(|p| (p.policy_name.clone(), p)).collect(),
            audit,
            tokens,
            refresh_tokens: refresh.into_iter().map(|r| (r.username.clone(), r)).collect(),
            counters: counters.into_iter().map(|c| (c.key, c.count)).collect(),
        };
        Ok(Self { dir, state: RwLock::new(state) })
    }

    async fn save_users(&self, state: &State) -> StoreResult<()> {
        let mut items: Vec<&UserItem> = state.users.values().collect();
        items.sort_by(|a, b| a.username.cmp(&b.username));
        write_collection(&self.dir, collections::USERS, &items).await
    }

    async fn save_groups(&self, state: &State) -> StoreResult<()> {
        let mut items: Vec<&GroupItem> = state.groups.values().collect();
        items.sort_by(|a, b| a.group_name.cmp(&b.group_name));
        write_collection(&self.dir, collections::GROUPS, &items).await
    }

    async fn save_policies(&self, state: &State) -> StoreResult<()> {
        let mut items: Vec<&PolicyItem> = state.policies.values().collect();
        items.sort_by(|a, b| a.policy_name.cmp(&b.policy_name));
        write_collection(&self.dir, collections::POLICIES, &items).await
    }

    async fn save_tokens(&self, state: &State) -> StoreResult<()> {
        write_collection(&self.dir, collections::TOKENS, &state.tokens).await
    }

    async fn save_refresh_tokens(&self, state: &State) -> StoreResult<()> {
        let mut items: Vec<&RefreshTokenRecord> = state.refresh_tokens.values().collect();
        items.sort_by(|a, b| a.username.cmp(&b.username));
        write_collection(&self.dir, collections::REFRESH_TOKENS, &items).await
    }

    async fn save_counters(&self, state: &State) -> StoreResult<()> {
        let items: Vec<UsageCounter> = state
            .counters
            .iter()
            .map(|(key, count)| UsageCounter { key: key.clone(), count: *count })
            .collect();
        write_collection(&self.dir, collections::USAGE_COUNTERS, &items).await
    }
}

async fn read_collection<T: DeserializeOwned>(dir: &Path, name: &str) -> StoreResult<Vec<T>> {
    let path = dir.join(format!("{name}.json"));
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(source) => Err(StoreError::Io { path: path.display().to_string(), source }),
    }
}

async fn write_collection<T: Serialize>(dir: &Path, name: &str, items: &T) -> StoreResult<()> {
    let path = dir.join(format!("{name}.json"));
    let tmp = dir.join(format!(".{name}.json.tmp"));
    let bytes = serde_json::to_vec_pretty(items)?;
    tokio::fs::write(&tmp, bytes).await.map_err(|source| StoreError::Io {
        path: tmp.display().to_string(),
        source,
    })?;
    tokio::fs::rename(&tmp, &path).await.map_err(|source| StoreError::Io {
        path: path.display().to_string(),
        source,
    })
}

#[async_trait]
impl Store for FileStore {
    async fn get_user(&self, username: &str) -> StoreResult<Option<UserItem>> {
        Ok(self.state.read().await.users.get(username).cloned())
    }

    async fn put_user(&self, user: &UserItem) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.users.insert(user.username.clone(), user.clone());
        self.save_users(&state).await
    }

    async fn delete_user(&self, username: &str) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let removed = state.users.remove(username).is_some();
        if removed {
            self.save_users(&state).await?;
        }
        Ok(removed)
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
        let mut state = self.state.write().await;
        state.groups.insert(group.group_name.clone(), group.clone());
        self.save_groups(&state).await
    }

    async fn delete_group(&self, group_name: &str) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let removed = state.groups.remove(group_name).is_some();
        if removed {
            self.save_groups(&state).await?;
        }
        Ok(removed)
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
        let mut state = self.state.write().await;
        state.policies.insert(policy.policy_name.clone(), policy.clone());
        self.save_policies(&state).await
    }

    async fn delete_policy(&self, policy_name: &str) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let removed = state.policies.remove(policy_name).is_some();
        if removed {
            self.save_policies(&state).await?;
        }
        Ok(removed)
    }

    async fn list_policies(&self) -> StoreResult<Vec<PolicyItem>> {
        let mut policies: Vec<PolicyItem> =
            self.state.read().await.policies.values().cloned().collect();
        policies.sort_by(|a, b| a.policy_name.cmp(&b.policy_name));
        Ok(policies)
    }

    async fn append_audit(&self, record: &AuditRecord) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.audit.push(record.clone());
        write_collection(&self.dir, collections::AUDIT, &state.audit).await
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
        let mut state = self.state.write().await;
        state.tokens.push(token.clone());
        self.save_tokens(&state).await
    }

    async fn get_token(&self, username: &str, jti: &str) -> StoreResult<Option<TokenRecord>> {
        Ok(self
            .state
            .read()
            .await
            .tokens
            .iter()
            .find(|token| token.username == username && token.jti == jti)
            .cloned())
    }

    async fn delete_user_tokens(&self, username: &str) -> StoreResult<u64> {
        let mut state = self.state.write().await;
        let before = state.tokens.len();
        state.tokens.retain(|token| token.username != username);
        let removed = (before - state.tokens.len()) as u64;
        if removed > 0 {
            self.save_tokens(&state).await?;
        }
        Ok(removed)
    }

    async fn get_refresh_token(&self, username: &str) -> StoreResult<Option<RefreshTokenRecord>> {
        Ok(self.state.read().await.refresh_tokens.get(username).cloned())
    }

    async fn put_refresh_token(&self, record: &RefreshTokenRecord) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.refresh_tokens.insert(record.username.clone(), record.clone());
        self.save_refresh_tokens(&state).await
    }

    async fn delete_refresh_token(&self, username: &str) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let removed = state.refresh_tokens.remove(username).is_some();
        if removed {
            self.save_refresh_tokens(&state).await?;
        }
        Ok(removed)
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
        let key = format!("{username}|{route}|{second}");
        let count = *state
            .counters
            .entry(key)
            .and_modify(|count| *count += 1)
            .or_insert(1);
        self.save_counters(&state).await?;
        Ok(count)
    }
}
