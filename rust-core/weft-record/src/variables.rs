// SPDX-License-Identifier: PMPL-1.0-or-later
//! Operation variables.

use serde_json::Value;

use crate::selection::{Argument, ArgumentDefinition};
use crate::storage_key::get_argument_values;

/// Variables keyed by name. Backed by an ordered map, so serializing yields a
/// stable form.
pub type Variables = serde_json::Map<String, Value>;

/// Variables for a split operation: the parent's variables, overridden by the
/// operation's local argument defaults and then by the call-site arguments.
pub fn get_local_variables(
    parent: &Variables,
    definitions: &[ArgumentDefinition],
    args: Option<&Variables>,
) -> Variables {
    if definitions.is_empty() {
        return parent.clone();
    }
    let mut variables = parent.clone();
    for definition in definitions {
        let value = args
            .and_then(|args| args.get(&definition.name))
            .cloned()
            .unwrap_or_else(|| definition.default_value.clone());
        variables.insert(definition.name.clone(), value);
    }
    variables
}

/// Resolve call-site arguments into a variables map.
pub fn arguments_to_variables(args: &[Argument], variables: &Variables) -> Variables {
    get_argument_values(args, variables).into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_local_variables_override_parent() {
        let mut parent = Variables::new();
        parent.insert("id".into(), json!("1"));
        parent.insert("size".into(), json!(10));

        let definitions = vec![
            ArgumentDefinition { name: "size".into(), default_value: json!(32) },
            ArgumentDefinition { name: "scale".into(), default_value: json!(1) },
        ];
        let mut args = Variables::new();
        args.insert("scale".into(), json!(2));

        let local = get_local_variables(&parent, &definitions, Some(&args));
        assert_eq!(local.get("id"), Some(&json!("1")));
        assert_eq!(local.get("size"), Some(&json!(32)));
        assert_eq!(local.get("scale"), Some(&json!(2)));
    }
}
