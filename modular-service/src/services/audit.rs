//! Append-only audit log.
//!
//! Records are masked before they are hashed and persisted, so sensitive
//! values never reach the store in the clear. No update or delete path
//! exists; queries recompute each record's fingerprint and surface failures
//! as consistency flags without hiding the record.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::errors::{ApiError, ApiResult};
use crate::integrity::IntegrityService;
use crate::models::{AuditRecord, Checked, ConsistencyStatus};
use crate::storage::{AuditQuery, Store};

const MASK: &str = "****";
const SENSITIVE_MARKERS: [&str; 4] = ["password", "secret", "token", "credential"];

pub struct AuditService {
    store: Arc<dyn Store>,
    integrity: Arc<IntegrityService>,
}

impl AuditService {
    pub fn new(store: Arc<dyn Store>, integrity: Arc<IntegrityService>) -> Self {
        Self { store, integrity }
    }

    pub async fn record(
        &self,
        username: &str,
        group: &str,
        command: &str,
        mut parameters: Value,
        result: &str,
        warnings: Vec<String>,
    ) -> ApiResult<()> {
        mask_sensitive(&mut parameters);
        let mut record = AuditRecord {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            username: username.to_string(),
            group: group.to_string(),
            command: command.to_string(),
            parameters,
            result: result.to_string(),
            warnings,
            hash: String::new(),
        };
        record.hash = self.integrity.fingerprint(&record).map_err(ApiError::internal)?;
        self.store.append_audit(&record).await?;
        Ok(())
    }

    pub async fn query(
        &self,
        query: &AuditQuery,
        invalid_only: bool,
    ) -> ApiResult<Vec<Checked<AuditRecord>>> {
        let records = self.store.query_audit(query).await?;
        let mut checked: Vec<Checked<AuditRecord>> = records
            .into_iter()
            .map(|record| {
                let consistency = self.integrity.verify(&record, &record.hash);
                Checked::new(record, consistency)
            })
            .collect();
        if invalid_only {
            checked.retain(|entry| entry.consistency == ConsistencyStatus::Compromised);
        }
        Ok(checked)
    }
}

fn is_sensitive(key: &str) -> bool {
    let lowered = key.to_ascii_lowercase();
    SENSITIVE_MARKERS.iter().any(|marker| lowered.contains(marker))
}

/// Replace the values of password-like fields, recursively.
fn mask_sensitive(value: &mut Value) {
    match value {
        Value::Object(fields) => {
            for (key, entry) in fields.iter_mut() {
                if is_sensitive(key) {
                    *entry = Value::String(MASK.to_string());
                } else {
                    mask_sensitive(entry);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                mask_sensitive(item);
            }
        }
        _ => {}
    }
}
