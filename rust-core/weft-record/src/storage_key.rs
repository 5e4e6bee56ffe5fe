// SPDX-License-Identifier: PMPL-1.0-or-later
//! Storage keys: `name(arg:json,...)` with arguments sorted and nulls dropped.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::selection::{Argument, ArgumentValue};
use crate::variables::Variables;

/// Resolve field arguments against `variables`. Unbound variables become null.
pub fn get_argument_values(args: &[Argument], variables: &Variables) -> BTreeMap<String, Value> {
    args.iter()
        .map(|arg| {
            let value = match &arg.value {
                ArgumentValue::Literal(value) => value.clone(),
                ArgumentValue::Variable(name) => variables.get(name).cloned().unwrap_or(Value::Null),
            };
            (arg.name.clone(), value)
        })
        .collect()
}

pub fn format_storage_key(name: &str, values: &BTreeMap<String, Value>) -> String {
    let parts: Vec<String> = values
        .iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(key, value)| format!("{key}:{value}"))
        .collect();
    if parts.is_empty() {
        name.to_string()
    } else {
        format!("{name}({})", parts.join(","))
    }
}

pub fn get_storage_key(name: &str, args: &[Argument], variables: &Variables) -> String {
    if args.is_empty() {
        return name.to_string();
    }
    format_storage_key(name, &get_argument_values(args, variables))
}

/// Storage key a field handler writes its output under.
pub fn get_handle_storage_key(handle: &str, field_name: &str, args: &[Argument], variables: &Variables) -> String {
    let name = format!("__{field_name}_{handle}");
    format_storage_key(&name, &get_argument_values(args, variables))
}
