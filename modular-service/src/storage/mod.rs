//! The repository seam.
//!
//! Six logical collections (`Users`, `Groups`, `Policies`, `Audit`,
//! `Tokens` plus `RefreshTokens`, `UsageCounters`) behind one narrow trait.
//! Services never see a backend type; the hosted and self-hosted document
//! databases implement this trait outside this tree, the bundled backends
//! below cover single-node deployments and tests.
//!
//! Every operation is an independent document read or write; nothing here
//! needs a multi-document transaction.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{AuditRecord, GroupItem, PolicyItem, RefreshTokenRecord, TokenRecord, UserItem};

pub mod collections {
    pub const USERS: &str = "Users";
    pub const GROUPS: &str = "Groups";
    pub const POLICIES: &str = "Policies";
    pub const AUDIT: &str = "Audit";
    pub const TOKENS: &str = "Tokens";
    pub const REFRESH_TOKENS: &str = "RefreshTokens";
    pub const USAGE_COUNTERS: &str = "UsageCounters";
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o failure on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("document serialization failed")]
    Serde(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Range-and-equality predicate for audit queries. The timestamp range is
/// inclusive on both ends.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub group: Option<String>,
    pub command: Option<String>,
}

impl AuditQuery {
    pub(crate) fn matches(&self, record: &AuditRecord) -> bool {
        if self.from.is_some_and(|from| record.timestamp < from) {
            return false;
        }
        if self.to.is_some_and(|to| record.timestamp > to) {
            return false;
        }
        if self.group.as_ref().is_some_and(|group| &record.group != group) {
            return false;
        }
        if self.command.as_ref().is_some_and(|command| &record.command != command) {
            return false;
        }
        true
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    // === Users ===
    async fn get_user(&self, username: &str) -> StoreResult<Option<UserItem>>;
    async fn put_user(&self, user: &UserItem) -> StoreResult<()>;
    async fn delete_user(&self, username: &str) -> StoreResult<bool>;
    async fn list_users(&self) -> StoreResult<Vec<UserItem>>;

    // === Groups ===
    async fn get_group(&self, group_name: &str) -> StoreResult<Option<GroupItem>>;
    async fn put_group(&self, group: &GroupItem) -> StoreResult<()>;
    async fn delete_group(&self, group_name: &str) -> StoreResult<bool>;
    async fn list_groups(&self) -> StoreResult<Vec<GroupItem>>;

    // === Policies ===
    async fn get_policy(&self, policy_name: &str) -> StoreResult<Option<PolicyItem>>;
    async fn put_policy(&self, policy: &PolicyItem) -> StoreResult<()>;
    async fn delete_policy(&self, policy_name: &str) -> StoreResult<bool>;
    async fn list_policies(&self) -> StoreResult<Vec<PolicyItem>>;

    // === Audit (append-only) ===
    async fn append_audit(&self, record: &AuditRecord) -> StoreResult<()>;
    async fn query_audit(&self, query: &AuditQuery) -> StoreResult<Vec<AuditRecord>>;

    // === Access-token allowlist ===
    async fn put_token(&self, token: &TokenRecord) -> StoreResult<()>;
    async fn get_token(&self, username: &str, jti: &str) -> StoreResult<Option<TokenRecord>>;
    async fn delete_user_tokens(&self, username: &str) -> StoreResult<u64>;

    // === Refresh tokens (one per username) ===
    async fn get_refresh_token(&self, username: &str) -> StoreResult<Option<RefreshTokenRecord>>;
    async fn put_refresh_token(&self, record: &RefreshTokenRecord) -> StoreResult<()>;
    async fn delete_refresh_token(&self, username: &str) -> StoreResult<bool>;

    // === Usage counters (fixed window) ===
    /// Increment the counter for `(username, route)` in the window
    /// `second`, returning the incremented value. Implementations drop
    /// windows older than a couple of seconds while they are here.
    async fn increment_usage(&self, username: &str, route: &str, second: u64)
        -> StoreResult<u64>;
}
