//! Configuration documents and the scope stack they are merged through.
//!
//! Documents are YAML, read into `serde_json::Value` and addressed with JSON
//! pointers. Scopes are merged in an explicit order; nothing here is global.

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde_json::{Map, Value};

use crate::errors::ConfigError;

/// Configuration scopes from least to most specific.
pub const SCOPE_ORDER: &[&str] = &[
    "defaults",
    "system",
    "site",
    "user",
    "workspace",
    "command_line",
];

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigScope {
    pub name: String,
    pub value: Value,
}

impl ConfigScope {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    pub fn from_file(name: impl Into<String>, path: &Path) -> Result<Self> {
        Ok(Self::new(name, load_yaml(path)?))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigStack {
    scopes: Vec<ConfigScope>,
}

impl ConfigStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `scope` at its precedence position; a scope with the same
    /// name is merged into the existing one.
    pub fn push(&mut self, scope: ConfigScope) -> Result<()> {
        let rank = scope_rank(&scope.name)
            .ok_or_else(|| anyhow!("unknown configuration scope '{}'", scope.name))?;
        if let Some(existing) = self.scopes.iter_mut().find(|s| s.name == scope.name) {
            merge_into(&mut existing.value, &scope.value);
            return Ok(());
        }
        let pos = self
            .scopes
            .iter()
            .position(|s| scope_rank(&s.name).unwrap_or(0) > rank)
            .unwrap_or(self.scopes.len());
        self.scopes.insert(pos, scope);
        Ok(())
    }

    pub fn scopes(&self) -> &[ConfigScope] {
        &self.scopes
    }

    /// Deep merge of every scope, most specific last.
    pub fn merged(&self) -> Value {
        let mut out = Value::Object(Map::new());
        for scope in &self.scopes {
            merge_into(&mut out, &scope.value);
        }
        out
    }

    pub fn get(&self, pointer: &str) -> Option<Value> {
        self.merged().pointer(pointer).cloned()
    }

    /// Applies a `path:value` override (colon separated path, YAML value)
    /// to the command-line scope.
    pub fn apply_override(&mut self, raw: &str) -> Result<()> {
        let value = parse_override(raw)?;
        self.push(ConfigScope::new("command_line", value))
    }
}

fn scope_rank(name: &str) -> Option<usize> {
    SCOPE_ORDER.iter().position(|s| *s == name)
}

/// Recursively merges `overlay` into `base`. Mappings merge key by key;
/// every other value is replaced.
pub fn merge_into(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => merge_into(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (slot, value) => *slot = value.clone(),
    }
}

pub fn parse_override(raw: &str) -> Result<Value> {
    let (path, literal) = split_override(raw)
        .ok_or_else(|| anyhow!("invalid override '{}': expected path:value", raw))?;
    let parsed: serde_yaml::Value = serde_yaml::from_str(literal)
        .with_context(|| format!("invalid override value in '{}'", raw))?;
    let mut value = serde_json::to_value(parsed)?;
    for key in path.split(':').rev() {
        if key.is_empty() {
            return Err(anyhow!("invalid override '{}': empty path component", raw));
        }
        let mut map = Map::new();
        map.insert(key.to_string(), value);
        value = Value::Object(map);
    }
    Ok(value)
}

/// Splits at the last `:` whose right side is not itself a path component,
/// i.e. the first `:` followed by whitespace or the last `:` overall.
fn split_override(raw: &str) -> Option<(&str, &str)> {
    if let Some(idx) = raw.find(": ") {
        return Some((&raw[..idx], raw[idx + 1..].trim()));
    }
    raw.rfind(':').map(|idx| (&raw[..idx], &raw[idx + 1..]))
}

pub fn load_yaml(path: &Path) -> Result<Value> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_yaml(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

pub fn parse_yaml(raw: &str) -> Result<Value> {
    let yaml_value: serde_yaml::Value = serde_yaml::from_str(raw)?;
    let json_value: Value = serde_json::to_value(yaml_value)?;
    Ok(match json_value {
        Value::Null => Value::Object(Map::new()),
        other => other,
    })
}

/// Rejects keys of `value` (a mapping at `path`) that are not in `allowed`.
pub fn check_keys(path: &str, value: &Value, allowed: &[&str]) -> Result<(), ConfigError> {
    match value {
        Value::Null => Ok(()),
        Value::Object(map) => {
            let mut unknown: Vec<&str> = map
                .keys()
                .map(|k| k.as_str())
                .filter(|k| !allowed.contains(k))
                .collect();
            if unknown.is_empty() {
                return Ok(());
            }
            unknown.sort();
            Err(ConfigError::new(
                format!("{}/{}", path, unknown[0]),
                format!("unknown key(s): {}", unknown.join(", ")),
            ))
        }
        _ => Err(ConfigError::new(path, "expected a mapping")),
    }
}

/// A list of strings at `path`, or an empty list when absent.
pub fn string_list(path: &str, value: Option<&Value>) -> Result<Vec<String>, ConfigError> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(vec![s.clone()]),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(idx, item)| match item {
                Value::String(s) => Ok(s.clone()),
                Value::Number(n) => Ok(n.to_string()),
                _ => Err(ConfigError::new(
                    format!("{}/{}", path, idx),
                    "expected a string",
                )),
            })
            .collect(),
        Some(_) => Err(ConfigError::new(path, "expected a list of strings")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scopes_merge_in_precedence_order() {
        let mut stack = ConfigStack::new();
        stack
            .push(ConfigScope::new(
                "workspace",
                json!({"config": {"workers": 4, "strict": false}}),
            ))
            .expect("push");
        stack
            .push(ConfigScope::new(
                "defaults",
                json!({"config": {"workers": 1, "shell": "sh"}}),
            ))
            .expect("push");
        stack.apply_override("config:workers:8").expect("override");
        assert_eq!(
            stack.merged(),
            json!({"config": {"workers": 8, "strict": false, "shell": "sh"}})
        );
        let names: Vec<_> = stack.scopes().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["defaults", "workspace", "command_line"]);
        assert!(stack.push(ConfigScope::new("nowhere", json!({}))).is_err());
    }

    #[test]
    fn overrides_parse_yaml_values() {
        assert_eq!(
            parse_override("bench:variables:n_nodes:[1, 2]").expect("override"),
            json!({"bench": {"variables": {"n_nodes": [1, 2]}}})
        );
        assert_eq!(
            parse_override("bench:variables:cmd: mpirun -n 4").expect("override"),
            json!({"bench": {"variables": {"cmd": "mpirun -n 4"}}})
        );
        assert!(parse_override("novalue").is_err());
    }

    #[test]
    fn lists_replace_rather_than_append() {
        let mut base = json!({"a": [1, 2], "b": {"c": 1}});
        merge_into(&mut base, &json!({"a": [3], "b": {"d": 2}}));
        assert_eq!(base, json!({"a": [3], "b": {"c": 1, "d": 2}}));
    }

    #[test]
    fn unknown_keys_are_reported_with_path() {
        let err = check_keys(
            "/bench/applications/app",
            &json!({"workloads": {}, "bogus": 1}),
            &["workloads", "variables"],
        )
        .expect_err("unknown key");
        assert_eq!(err.path, "/bench/applications/app/bogus");
    }

    #[test]
    fn empty_yaml_is_an_empty_mapping() {
        assert_eq!(parse_yaml("").expect("parse"), json!({}));
        assert_eq!(
            parse_yaml("bench:\n  variables:\n    a: 1\n").expect("parse"),
            json!({"bench": {"variables": {"a": 1}}})
        );
    }
}
