//! Layered variable scopes.
//!
//! Lookups walk from the most specific layer to the least specific one, so a
//! workload definition shadows an application definition, which shadows the
//! root `variables` block, and so on.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::errors::ConfigError;

/// Declaration scopes, ordered from least to most specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Engine defaults and derived reserved variables.
    Defaults,
    Root,
    Application,
    Workload,
    Experiment,
    /// One element of each vector, chosen by the combinator.
    Assignment,
    Modifier,
    /// `variables` of a chained-experiment entry.
    Chain,
    /// Values pulled from a chain root through `inherit_variables`.
    Inherited,
    /// Names, paths and rendered commands computed by the engine.
    Generated,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Defaults => "defaults",
            Scope::Root => "root",
            Scope::Application => "application",
            Scope::Workload => "workload",
            Scope::Experiment => "experiment",
            Scope::Assignment => "assignment",
            Scope::Modifier => "modifier",
            Scope::Chain => "chain",
            Scope::Inherited => "inherited",
            Scope::Generated => "generated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VarValue {
    Scalar(String),
    List(Vec<String>),
}

impl VarValue {
    pub fn scalar(value: impl Into<String>) -> Self {
        VarValue::Scalar(value.into())
    }

    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            VarValue::Scalar(s) => Some(s),
            VarValue::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            VarValue::List(items) => Some(items),
            VarValue::Scalar(_) => None,
        }
    }

    pub fn is_vector(&self) -> bool {
        matches!(self, VarValue::List(_))
    }

    /// Converts a configuration node into a variable value. `path` is used
    /// for diagnostics only.
    pub fn from_json(path: &str, value: &Json) -> Result<Self, ConfigError> {
        match value {
            Json::Array(items) => items
                .iter()
                .enumerate()
                .map(|(idx, item)| {
                    scalar_text(item).ok_or_else(|| {
                        ConfigError::new(
                            format!("{}/{}", path, idx),
                            "vector elements must be scalars",
                        )
                    })
                })
                .collect::<Result<Vec<_>, _>>()
                .map(VarValue::List),
            other => scalar_text(other)
                .map(VarValue::Scalar)
                .ok_or_else(|| ConfigError::new(path, "variable values must be scalars or lists")),
        }
    }
}

impl fmt::Display for VarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarValue::Scalar(s) => write!(f, "{}", s),
            VarValue::List(items) => write!(f, "[{}]", items.join(", ")),
        }
    }
}

/// Renders a scalar configuration node as variable text.
pub fn scalar_text(value: &Json) -> Option<String> {
    match value {
        Json::String(s) => Some(s.clone()),
        Json::Number(n) => Some(n.to_string()),
        Json::Bool(true) => Some("True".to_string()),
        Json::Bool(false) => Some("False".to_string()),
        Json::Null => Some(String::new()),
        _ => None,
    }
}

/// Parses a `variables:` mapping.
pub fn variables_from_json(
    path: &str,
    value: Option<&Json>,
) -> Result<BTreeMap<String, VarValue>, ConfigError> {
    let mut out = BTreeMap::new();
    match value {
        None | Some(Json::Null) => {}
        Some(Json::Object(map)) => {
            for (name, raw) in map {
                let var_path = format!("{}/{}", path, name);
                out.insert(name.clone(), VarValue::from_json(&var_path, raw)?);
            }
        }
        Some(_) => return Err(ConfigError::new(path, "expected a mapping of variables")),
    }
    Ok(out)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableSpace {
    layers: BTreeMap<Scope, BTreeMap<String, VarValue>>,
}

impl VariableSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&mut self, scope: Scope, name: impl Into<String>, value: VarValue) {
        self.layers
            .entry(scope)
            .or_default()
            .insert(name.into(), value);
    }

    pub fn define_all(&mut self, scope: Scope, vars: &BTreeMap<String, VarValue>) {
        for (name, value) in vars {
            self.define(scope, name.clone(), value.clone());
        }
    }

    pub fn remove(&mut self, scope: Scope, name: &str) -> Option<VarValue> {
        self.layers.get_mut(&scope).and_then(|layer| layer.remove(name))
    }

    /// Effective value of `name`, most specific scope first.
    pub fn resolve(&self, name: &str) -> Option<&VarValue> {
        self.layers
            .values()
            .rev()
            .find_map(|layer| layer.get(name))
    }

    /// Scope that currently provides the effective value of `name`.
    pub fn scope_of(&self, name: &str) -> Option<Scope> {
        self.layers
            .iter()
            .rev()
            .find(|(_, layer)| layer.contains_key(name))
            .map(|(scope, _)| *scope)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }

    pub fn all_names(&self) -> BTreeSet<String> {
        self.layers
            .values()
            .flat_map(|layer| layer.keys().cloned())
            .collect()
    }

    pub fn layer(&self, scope: Scope) -> Option<&BTreeMap<String, VarValue>> {
        self.layers.get(&scope)
    }

    /// Flattened view with precedence applied.
    pub fn effective(&self) -> BTreeMap<String, VarValue> {
        let mut out = BTreeMap::new();
        for layer in self.layers.values() {
            for (name, value) in layer {
                out.insert(name.clone(), value.clone());
            }
        }
        out
    }

    /// Names whose effective value is a vector.
    pub fn vector_names(&self) -> BTreeSet<String> {
        self.effective()
            .into_iter()
            .filter(|(_, value)| value.is_vector())
            .map(|(name, _)| name)
            .collect()
    }

    /// Installs the reserved-variable defaults: any two of `n_ranks`,
    /// `n_nodes` and `processes_per_node` derive the third. With fewer than
    /// two present, `n_nodes` and `processes_per_node` default to 1 first.
    pub fn derive_reserved(&mut self) {
        let has = |space: &VariableSpace, name: &str| space.contains(name);
        if !has(self, "n_threads") {
            self.define(Scope::Defaults, "n_threads", VarValue::scalar("1"));
        }
        let present = ["n_ranks", "n_nodes", "processes_per_node"]
            .iter()
            .filter(|name| has(self, name))
            .count();
        if present < 2 {
            if !has(self, "n_nodes") && !has(self, "n_ranks") {
                self.define(Scope::Defaults, "n_nodes", VarValue::scalar("1"));
            }
            if !has(self, "processes_per_node") && !has(self, "n_ranks") {
                self.define(Scope::Defaults, "processes_per_node", VarValue::scalar("1"));
            }
            if has(self, "n_ranks") && !has(self, "n_nodes") {
                self.define(Scope::Defaults, "n_nodes", VarValue::scalar("1"));
            }
        }
        if !has(self, "n_ranks") {
            self.define(
                Scope::Defaults,
                "n_ranks",
                VarValue::scalar("{n_nodes}*{processes_per_node}"),
            );
        } else if !has(self, "n_nodes") {
            self.define(
                Scope::Defaults,
                "n_nodes",
                VarValue::scalar("ceil({n_ranks}/{processes_per_node})"),
            );
        } else if !has(self, "processes_per_node") {
            self.define(
                Scope::Defaults,
                "processes_per_node",
                VarValue::scalar("ceil({n_ranks}/{n_nodes})"),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn more_specific_scope_wins() {
        let mut space = VariableSpace::new();
        space.define(Scope::Root, "n", VarValue::scalar("1"));
        space.define(Scope::Application, "n", VarValue::scalar("2"));
        space.define(Scope::Experiment, "n", VarValue::scalar("4"));
        space.define(Scope::Workload, "n", VarValue::scalar("3"));
        assert_eq!(space.resolve("n"), Some(&VarValue::scalar("4")));
        assert_eq!(space.scope_of("n"), Some(Scope::Experiment));
        space.remove(Scope::Experiment, "n");
        assert_eq!(space.resolve("n"), Some(&VarValue::scalar("3")));
    }

    #[test]
    fn json_values_become_scalars_and_vectors() {
        let vars = variables_from_json(
            "/bench/variables",
            Some(&json!({"a": 1, "b": "x", "c": [1, "two", 3.5], "d": true})),
        )
        .expect("parse");
        assert_eq!(vars["a"], VarValue::scalar("1"));
        assert_eq!(vars["d"], VarValue::scalar("True"));
        assert_eq!(
            vars["c"],
            VarValue::List(vec!["1".into(), "two".into(), "3.5".into()])
        );
        let err = variables_from_json("/bench/variables", Some(&json!({"bad": {"x": 1}})))
            .expect_err("nested mapping");
        assert_eq!(err.path, "/bench/variables/bad");
    }

    #[test]
    fn reserved_variables_derive_the_missing_one() {
        let mut space = VariableSpace::new();
        space.define(Scope::Experiment, "n_ranks", VarValue::scalar("8"));
        space.define(Scope::Experiment, "processes_per_node", VarValue::scalar("4"));
        space.derive_reserved();
        assert_eq!(
            space.resolve("n_nodes"),
            Some(&VarValue::scalar("ceil({n_ranks}/{processes_per_node})"))
        );

        let mut space = VariableSpace::new();
        space.derive_reserved();
        assert_eq!(space.resolve("n_nodes"), Some(&VarValue::scalar("1")));
        assert_eq!(
            space.resolve("n_ranks"),
            Some(&VarValue::scalar("{n_nodes}*{processes_per_node}"))
        );
        assert_eq!(space.resolve("n_threads"), Some(&VarValue::scalar("1")));
    }

    #[test]
    fn vector_names_follow_effective_values() {
        let mut space = VariableSpace::new();
        space.define(
            Scope::Root,
            "n_nodes",
            VarValue::List(vec!["1".into(), "2".into()]),
        );
        assert!(space.vector_names().contains("n_nodes"));
        space.define(Scope::Experiment, "n_nodes", VarValue::scalar("4"));
        assert!(space.vector_names().is_empty());
    }
}
