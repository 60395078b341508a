//! Per-user parameter restriction and aux-data injection.
//!
//! Runs after normalization, so defaults have already been applied: a
//! command default that lands outside the caller's allow-list is rejected
//! exactly like an explicit value. Aux data is injected under its declared
//! option name unless the caller supplied an override, which is itself
//! subject to the same allow-list rules.

use serde_json::{Map, Value};

use crate::errors::{ApiError, ApiResult};
use crate::models::UserMeta;

/// Enforce the user's allow-lists over normalized parameters, then inject
/// aux data. Returns human-readable warnings for the audit trail.
pub fn enforce(meta: &UserMeta, parameters: &mut Map<String, Value>) -> ApiResult<Vec<String>> {
    for (option, allowed) in &meta.allowed_values {
        let Some(value) = parameters.get(option) else {
            continue;
        };
        for literal in value_literals(value) {
            if !allowed.contains(&literal) {
                return Err(ApiError::RestrictedValue {
                    option: option.clone(),
                    value: literal,
                });
            }
        }
    }

    let mut warnings = Vec::new();
    for (option, value) in &meta.aux_data {
        if parameters.contains_key(option) {
            warnings.push(format!("option {option:?} overrides the configured value"));
            continue;
        }
        parameters.insert(option.clone(), value.clone());
    }
    Ok(warnings)
}

/// The literal forms a value is compared against: strings compare as-is,
/// scalars by their JSON rendering, lists element-wise.
fn value_literals(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items.iter().flat_map(value_literals).collect(),
        other => vec![other.to_string()],
    }
}
