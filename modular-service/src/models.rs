//! Persisted document shapes for the six logical collections.
//!
//! Field names are part of the external contract; both document backends and
//! the audit tooling rely on them staying put.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use modular_core::Statement;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityState {
    Activated,
    Blocked,
}

/// Result of recomputing a record's integrity fingerprint on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyStatus {
    Ok,
    Compromised,
}

impl ConsistencyStatus {
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyItem {
    pub policy_name: String,
    pub statements: Vec<Statement>,
    pub state: EntityState,
    pub creation_date: DateTime<Utc>,
    pub last_modification_date: DateTime<Utc>,
    #[serde(default)]
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupItem {
    pub group_name: String,
    pub policies: BTreeSet<String>,
    pub state: EntityState,
    pub creation_date: DateTime<Utc>,
    pub last_modification_date: DateTime<Utc>,
    #[serde(default)]
    pub hash: String,
}

/// Per-user parameter restrictions and injected data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserMeta {
    /// option name -> permitted literal values
    #[serde(default)]
    pub allowed_values: BTreeMap<String, BTreeSet<String>>,
    /// option name -> value injected into outgoing backend requests
    #[serde(default)]
    pub aux_data: BTreeMap<String, Value>,
}

impl UserMeta {
    pub fn is_empty(&self) -> bool {
        self.allowed_values.is_empty() && self.aux_data.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserItem {
    pub username: String,
    /// Argon2id PHC string; never leaves the service layer.
    pub password_hash: String,
    pub groups: BTreeSet<String>,
    pub state: EntityState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_reason: Option<String>,
    #[serde(default)]
    pub meta: UserMeta,
    pub creation_date: DateTime<Utc>,
    pub last_modification_date: DateTime<Utc>,
    #[serde(default)]
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Initiator of the call.
    pub username: String,
    /// `module/group` path of the command, `module` alone for root commands.
    pub group: String,
    pub command: String,
    /// Parameters as sent to the backend, sensitive values masked.
    pub parameters: Value,
    pub result: String,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub hash: String,
}

/// Server-side allowlist record for one issued access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub username: String,
    pub jti: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// One refresh-token version per username; rotation replaces it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshTokenRecord {
    pub username: String,
    pub version: String,
    pub issued_at: DateTime<Utc>,
}

/// Fixed-window usage counter document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageCounter {
    pub key: String,
    pub count: u64,
}

/// An entity paired with the verdict of its read-time integrity check.
#[derive(Debug, Clone, Serialize)]
pub struct Checked<T> {
    #[serde(flatten)]
    pub item: T,
    pub consistency: ConsistencyStatus,
}

impl<T> Checked<T> {
    pub fn new(item: T, consistency: ConsistencyStatus) -> Self {
        Self { item, consistency }
    }
}
