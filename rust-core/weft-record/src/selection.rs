// SPDX-License-Identifier: PMPL-1.0-or-later
//! Normalization AST.
//!
//! Describes the shape of a response so the normalizer can flatten it into
//! records, and so the reader and checker can walk the same shape back out of
//! a record source. Nodes are plain data and deserialize from JSON fixtures.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage_key::get_storage_key;
use crate::variables::Variables;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgumentValue {
    Literal(Value),
    Variable(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Argument {
    pub name: String,
    pub value: ArgumentValue,
}

impl Argument {
    pub fn literal(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value: ArgumentValue::Literal(value),
        }
    }

    pub fn variable(name: impl Into<String>, variable: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: ArgumentValue::Variable(variable.into()),
        }
    }
}

/// A leaf field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarField {
    pub name: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub args: Vec<Argument>,
    /// Name of the field handler run against this field at commit time.
    #[serde(default)]
    pub handle: Option<String>,
}

impl ScalarField {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            args: Vec::new(),
            handle: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_args(mut self, args: Vec<Argument>) -> Self {
        self.args = args;
        self
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.handle = Some(handle.into());
        self
    }

    /// Key of this field in a response object.
    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    pub fn storage_key(&self, variables: &Variables) -> String {
        get_storage_key(&self.name, &self.args, variables)
    }
}

/// A field whose value is one record or a list of records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkedField {
    pub name: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub args: Vec<Argument>,
    /// Statically known typename of the linked records, if any.
    #[serde(default)]
    pub concrete_type: Option<String>,
    #[serde(default)]
    pub plural: bool,
    #[serde(default)]
    pub selections: Vec<Selection>,
    #[serde(default)]
    pub handle: Option<String>,
}

impl LinkedField {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            args: Vec::new(),
            concrete_type: None,
            plural: false,
            selections: Vec::new(),
            handle: None,
        }
    }

    pub fn plural(mut self) -> Self {
        self.plural = true;
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_args(mut self, args: Vec<Argument>) -> Self {
        self.args = args;
        self
    }

    pub fn with_concrete_type(mut self, typename: impl Into<String>) -> Self {
        self.concrete_type = Some(typename.into());
        self
    }

    pub fn with_selections(mut self, selections: Vec<Selection>) -> Self {
        self.selections = selections;
        self
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.handle = Some(handle.into());
        self
    }

    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    pub fn storage_key(&self, variables: &Variables) -> String {
        get_storage_key(&self.name, &self.args, variables)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InlineFragment {
    pub type_condition: String,
    pub selections: Vec<Selection>,
}

/// Selections whose data may arrive in a later incremental response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Defer {
    pub label: String,
    /// Boolean variable that disables deferral when false.
    #[serde(default)]
    pub if_variable: Option<String>,
    pub selections: Vec<Selection>,
}

/// A plural linked field whose items may arrive one response at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stream {
    pub label: String,
    #[serde(default)]
    pub if_variable: Option<String>,
    pub field: LinkedField,
}

/// Split-operation reference resolved through an operation loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleImport {
    /// Call-site arguments for the split operation's local variables.
    #[serde(default)]
    pub args: Vec<Argument>,
    pub document_name: String,
    pub fragment_name: String,
    pub fragment_prop_name: String,
}

impl ModuleImport {
    pub fn operation_key(&self) -> String {
        format!("__module_operation_{}", self.document_name)
    }

    pub fn component_key(&self) -> String {
        format!("__module_component_{}", self.document_name)
    }
}

/// A linked field whose record belongs to the partition named in the
/// response's `actor_key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorChange {
    pub field: LinkedField,
}

/// Selections of a client-rendered component, only normalized and checked
/// when client components are processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientComponent {
    pub fragment_name: String,
    pub selections: Vec<Selection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Selection {
    Scalar(ScalarField),
    Linked(LinkedField),
    InlineFragment(InlineFragment),
    Defer(Defer),
    Stream(Stream),
    ModuleImport(ModuleImport),
    ActorChange(ActorChange),
    ClientComponent(ClientComponent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Operation,
    /// Split operation loaded for a module import; declares local arguments.
    SplitOperation,
    /// Sub-selection lifted out of a larger node (deferred or streamed data).
    Fragment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgumentDefinition {
    pub name: String,
    #[serde(default)]
    pub default_value: Value,
}

/// Root of a normalization AST.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationNode {
    pub name: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub argument_definitions: Vec<ArgumentDefinition>,
    pub selections: Vec<Selection>,
}

impl NormalizationNode {
    pub fn operation(name: impl Into<String>, selections: Vec<Selection>) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Operation,
            argument_definitions: Vec::new(),
            selections,
        }
    }

    pub fn split_operation(
        name: impl Into<String>,
        argument_definitions: Vec<ArgumentDefinition>,
        selections: Vec<Selection>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::SplitOperation,
            argument_definitions,
            selections,
        }
    }

    pub fn fragment(name: impl Into<String>, selections: Vec<Selection>) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Fragment,
            argument_definitions: Vec::new(),
            selections,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_response_key_prefers_alias() {
        let field = ScalarField::new("name").with_alias("displayName");
        assert_eq!(field.response_key(), "displayName");
    }

    #[test]
    fn test_linked_storage_key_uses_variables() {
        let field = LinkedField::new("friends")
            .plural()
            .with_args(vec![Argument::variable("first", "count")]);
        let mut variables = Variables::new();
        variables.insert("count".into(), json!(10));
        assert_eq!(field.storage_key(&variables), "friends(first:10)");
    }

    #[test]
    fn test_node_deserializes_from_json() {
        let node: NormalizationNode = serde_json::from_value(json!({
            "name": "ViewerQuery",
            "kind": "operation",
            "selections": [
                {"kind": "linked", "name": "viewer", "selections": [
                    {"kind": "scalar", "name": "id"}
                ]}
            ]
        }))
        .unwrap();
        assert_eq!(node.kind, NodeKind::Operation);
        assert!(matches!(node.selections[0], Selection::Linked(_)));
    }
}
