//! Parameter normalization: merge query and body values, enforce declared
//! types and required-ness, apply defaults. The output is the canonical
//! parameter object handed to the restriction engine and then to the
//! backend.

use std::collections::HashMap;

use modular_core::catalog::{CommandMeta, Parameter, ParamType};
use serde_json::{Map, Value};

use crate::errors::{ApiError, ApiResult};

fn invalid(details: impl Into<String>) -> ApiError {
    ApiError::InvalidPayload { details: details.into() }
}

/// Merge raw inputs and normalize them against the command's declaration.
/// Query values win over body values of the same name.
pub fn normalize(
    command: &CommandMeta,
    query: &HashMap<String, String>,
    body: Option<&Value>,
) -> ApiResult<Map<String, Value>> {
    let mut raw: Map<String, Value> = match body {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(fields)) => fields.clone(),
        Some(_) => return Err(invalid("request body must be a JSON object")),
    };
    for (key, value) in query {
        raw.insert(key.clone(), Value::String(value.clone()));
    }

    for key in raw.keys() {
        if !command.parameters.iter().any(|parameter| &parameter.name == key) {
            return Err(invalid(format!("unknown option {key:?}")));
        }
    }

    let mut normalized = Map::with_capacity(command.parameters.len());
    for parameter in &command.parameters {
        match raw.remove(&parameter.name) {
            Some(value) => {
                normalized.insert(parameter.name.clone(), coerce(parameter, value)?);
            }
            None => match &parameter.default {
                Some(default) => {
                    normalized
                        .insert(parameter.name.clone(), coerce(parameter, default.clone())?);
                }
                None if parameter.required => {
                    return Err(invalid(format!(
                        "required option {:?} is missing",
                        parameter.name
                    )));
                }
                None => {}
            },
        }
    }
    Ok(normalized)
}

fn coerce(parameter: &Parameter, value: Value) -> ApiResult<Value> {
    let name = &parameter.name;
    match parameter.param_type {
        ParamType::String => match value {
            Value::String(s) => Ok(Value::String(s)),
            other => Err(invalid(format!("option {name:?} must be a string, got {other}"))),
        },
        ParamType::Integer => match value {
            Value::Number(n) if n.is_i64() => Ok(Value::Number(n)),
            Value::String(s) => s
                .parse::<i64>()
                .map(|n| Value::Number(n.into()))
                .map_err(|_| invalid(format!("option {name:?} must be an integer, got {s:?}"))),
            other => Err(invalid(format!("option {name:?} must be an integer, got {other}"))),
        },
        ParamType::Boolean => match value {
            Value::Bool(b) => Ok(Value::Bool(b)),
            Value::String(s) => match s.as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(invalid(format!("option {name:?} must be a boolean, got {s:?}"))),
            },
            other => Err(invalid(format!("option {name:?} must be a boolean, got {other}"))),
        },
        ParamType::StringList => match value {
            Value::Array(items) => {
                let mut list = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::String(s) => list.push(Value::String(s)),
                        other => {
                            return Err(invalid(format!(
                                "option {name:?} must be a list of strings, got element {other}"
                            )))
                        }
                    }
                }
                Ok(Value::Array(list))
            }
            // query strings carry lists comma-separated
            Value::String(s) => Ok(Value::Array(
                s.split(',')
                    .filter(|part| !part.is_empty())
                    .map(|part| Value::String(part.to_string()))
                    .collect(),
            )),
            other => {
                Err(invalid(format!("option {name:?} must be a list of strings, got {other}")))
            }
        },
    }
}
