use std::collections::{BTreeMap, BTreeSet};

use bench_core::config::{check_keys, string_list};
use bench_core::variables::{scalar_text, variables_from_json};
use bench_core::{ConfigError, VarValue, VariableSpace};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::definitions::{
    ApplicationDefinition, Executable, SuccessCriterion, WorkloadDefinition,
};

pub const BUILTIN_PREFIX: &str = "builtin::";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum EnvAction {
    Set { name: String, value: String },
    Append { name: String, value: String, separator: String },
    Prepend { name: String, value: String, separator: String },
    Unset { name: String },
}

impl EnvAction {
    /// Shell line for this action. Shell references are brace-escaped so a
    /// later expansion round leaves them intact.
    pub fn shell_line(&self) -> String {
        match self {
            EnvAction::Set { name, value } => format!("export {}=\"{}\";", name, value),
            EnvAction::Append {
                name,
                value,
                separator,
            } => format!(
                "export {name}=\"$\\{{{name}\\}}{}{}\";",
                separator, value,
                name = name
            ),
            EnvAction::Prepend {
                name,
                value,
                separator,
            } => format!(
                "export {name}=\"{}{}$\\{{{name}\\}}\";",
                value, separator,
                name = name
            ),
            EnvAction::Unset { name } => format!("unset {};", name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionOrder {
    Before,
    After,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutableInjection {
    pub name: String,
    #[serde(default = "default_injection_order")]
    pub order: InjectionOrder,
    #[serde(default)]
    pub relative_to: Option<String>,
}

fn default_injection_order() -> InjectionOrder {
    InjectionOrder::After
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Internals {
    #[serde(default)]
    pub custom_executables: BTreeMap<String, Executable>,
    #[serde(default)]
    pub executables: Option<Vec<String>>,
    #[serde(default)]
    pub executable_injection: Vec<ExecutableInjection>,
}

impl Internals {
    /// Later (more specific) blocks override executables and order, and
    /// add injections.
    pub fn merge(&mut self, other: &Internals) {
        self.custom_executables
            .extend(other.custom_executables.clone());
        if other.executables.is_some() {
            self.executables = other.executables.clone();
        }
        self.executable_injection
            .extend(other.executable_injection.iter().cloned());
    }

    pub fn is_empty(&self) -> bool {
        self.custom_executables.is_empty()
            && self.executables.is_none()
            && self.executable_injection.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModifierRef {
    pub name: String,
    pub mode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainEntry {
    /// Namespace, namespace glob, or bare experiment name in the same
    /// workload.
    pub name: String,
    pub command: String,
    pub order: String,
    pub variables: BTreeMap<String, VarValue>,
    pub inherit_variables: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Repeat {
    Single,
    /// Aggregates its instances; never executed itself.
    Base { count: usize },
    Instance { index: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainLink {
    pub root: String,
    pub position: usize,
    pub command: String,
    /// `(donor namespace, names)`, outermost chain first.
    pub inherit: Vec<(String, Vec<String>)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Experiment {
    pub application: String,
    pub workload: String,
    pub name: String,
    pub namespace: String,
    pub template: bool,
    pub index: usize,
    pub repeat: Repeat,
    pub space: VariableSpace,
    pub tags: BTreeSet<String>,
    pub modifiers: Vec<ModifierRef>,
    pub env_vars: Vec<EnvAction>,
    pub internals: Internals,
    pub success_criteria: Vec<SuccessCriterion>,
    pub chained: Vec<ChainEntry>,
    pub chain: Option<ChainLink>,
    pub resolved: BTreeMap<String, String>,
}

impl Experiment {
    /// Namespace of the chain this experiment executes in.
    pub fn unit_root(&self) -> &str {
        self.chain
            .as_ref()
            .map(|link| link.root.as_str())
            .unwrap_or(&self.namespace)
    }

    pub fn is_repeat_base(&self) -> bool {
        matches!(self.repeat, Repeat::Base { .. })
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.resolved.get(name).map(|s| s.as_str())
    }
}

pub const SCOPE_KEYS: &[&str] = &[
    "variables",
    "env_vars",
    "zips",
    "modifiers",
    "success_criteria",
    "internals",
    "tags",
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopeBlock {
    pub variables: BTreeMap<String, VarValue>,
    pub env_vars: Vec<EnvAction>,
    pub zips: BTreeMap<String, Vec<String>>,
    pub modifiers: Vec<ModifierRef>,
    pub success_criteria: Vec<SuccessCriterion>,
    pub internals: Internals,
    pub tags: Vec<String>,
}

fn string_map(path: &str, value: Option<&Value>) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut out = BTreeMap::new();
    match value {
        None | Some(Value::Null) => {}
        Some(Value::Object(map)) => {
            for (name, raw) in map {
                let text = scalar_text(raw).ok_or_else(|| {
                    ConfigError::new(format!("{}/{}", path, name), "expected a scalar")
                })?;
                out.insert(name.clone(), text);
            }
        }
        Some(_) => return Err(ConfigError::new(path, "expected a mapping")),
    }
    Ok(out)
}

fn parse_env_vars(path: &str, value: Option<&Value>) -> Result<Vec<EnvAction>, ConfigError> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    check_keys(path, value, &["set", "append", "prepend", "unset", "separator"])?;
    let separator = value
        .get("separator")
        .and_then(scalar_text)
        .unwrap_or_else(|| ":".to_string());
    let mut out = Vec::new();
    for (name, value) in string_map(&format!("{}/set", path), value.get("set"))? {
        out.push(EnvAction::Set { name, value });
    }
    for (name, value) in string_map(&format!("{}/append", path), value.get("append"))? {
        out.push(EnvAction::Append {
            name,
            value,
            separator: separator.clone(),
        });
    }
    for (name, value) in string_map(&format!("{}/prepend", path), value.get("prepend"))? {
        out.push(EnvAction::Prepend {
            name,
            value,
            separator: separator.clone(),
        });
    }
    for name in string_list(&format!("{}/unset", path), value.get("unset"))? {
        out.push(EnvAction::Unset { name });
    }
    Ok(out)
}

pub fn parse_zips(path: &str, value: Option<&Value>) -> Result<BTreeMap<String, Vec<String>>, ConfigError> {
    let mut out = BTreeMap::new();
    match value {
        None | Some(Value::Null) => {}
        Some(Value::Object(map)) => {
            for (name, members) in map {
                let zip_path = format!("{}/{}", path, name);
                out.insert(name.clone(), string_list(&zip_path, Some(members))?);
            }
        }
        Some(_) => return Err(ConfigError::new(path, "expected a mapping of zips")),
    }
    Ok(out)
}

fn parse_modifiers(path: &str, value: Option<&Value>) -> Result<Vec<ModifierRef>, ConfigError> {
    let items = match value {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(items)) => items,
        Some(_) => return Err(ConfigError::new(path, "expected a list of modifiers")),
    };
    items
        .iter()
        .enumerate()
        .map(|(idx, item)| {
            let item_path = format!("{}/{}", path, idx);
            match item {
                Value::String(name) => Ok(ModifierRef {
                    name: name.clone(),
                    mode: None,
                }),
                Value::Object(map) => {
                    check_keys(&item_path, item, &["name", "mode"])?;
                    let name = map
                        .get("name")
                        .and_then(Value::as_str)
                        .ok_or_else(|| ConfigError::new(&item_path, "modifier needs a name"))?;
                    Ok(ModifierRef {
                        name: name.to_string(),
                        mode: map.get("mode").and_then(scalar_text),
                    })
                }
                _ => Err(ConfigError::new(item_path, "expected a modifier name or mapping")),
            }
        })
        .collect()
}

pub fn parse_success_criteria(
    path: &str,
    value: Option<&Value>,
) -> Result<Vec<SuccessCriterion>, ConfigError> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(raw @ Value::Array(_)) => serde_json::from_value(raw.clone())
            .map_err(|e| ConfigError::new(path, e.to_string())),
        Some(_) => Err(ConfigError::new(path, "expected a list of criteria")),
    }
}

impl ScopeBlock {
    /// Parses one level of the tree. `extra` names the keys specific to
    /// that level, which the caller reads itself.
    pub fn parse(path: &str, value: &Value, extra: &[&str]) -> Result<Self, ConfigError> {
        let allowed: Vec<&str> = SCOPE_KEYS.iter().chain(extra.iter()).copied().collect();
        check_keys(path, value, &allowed)?;
        let internals = match value.get("internals") {
            None | Some(Value::Null) => Internals::default(),
            Some(raw) => serde_json::from_value(raw.clone())
                .map_err(|e| ConfigError::new(format!("{}/internals", path), e.to_string()))?,
        };
        Ok(Self {
            variables: variables_from_json(&format!("{}/variables", path), value.get("variables"))?,
            env_vars: parse_env_vars(&format!("{}/env_vars", path), value.get("env_vars"))?,
            zips: parse_zips(&format!("{}/zips", path), value.get("zips"))?,
            modifiers: parse_modifiers(&format!("{}/modifiers", path), value.get("modifiers"))?,
            success_criteria: parse_success_criteria(
                &format!("{}/success_criteria", path),
                value.get("success_criteria"),
            )?,
            internals,
            tags: string_list(&format!("{}/tags", path), value.get("tags"))?,
        })
    }
}

pub fn parse_chained_experiments(
    path: &str,
    value: Option<&Value>,
) -> Result<Vec<ChainEntry>, ConfigError> {
    let items = match value {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(items)) => items,
        Some(_) => return Err(ConfigError::new(path, "expected a list of chained experiments")),
    };
    let mut out = Vec::new();
    for (idx, item) in items.iter().enumerate() {
        let item_path = format!("{}/{}", path, idx);
        check_keys(
            &item_path,
            item,
            &["name", "command", "order", "variables", "inherit_variables"],
        )?;
        let name = item
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| ConfigError::new(&item_path, "chained experiment needs a name"))?;
        out.push(ChainEntry {
            name: name.to_string(),
            command: item
                .get("command")
                .and_then(scalar_text)
                .unwrap_or_else(|| "{execute_experiment}".to_string()),
            order: item
                .get("order")
                .and_then(scalar_text)
                .unwrap_or_else(|| "after_root".to_string()),
            variables: variables_from_json(
                &format!("{}/variables", item_path),
                item.get("variables"),
            )?,
            inherit_variables: string_list(
                &format!("{}/inherit_variables", item_path),
                item.get("inherit_variables"),
            )?,
        });
    }
    Ok(out)
}

/// Executable names in execution order: the workload's list, replaced by
/// an explicit `internals.executables`, then adjusted by injections.
pub fn executable_order(workload: &WorkloadDefinition, internals: &Internals) -> Vec<String> {
    let mut order = internals
        .executables
        .clone()
        .unwrap_or_else(|| workload.executables.clone());
    for injection in &internals.executable_injection {
        let anchor = injection
            .relative_to
            .as_ref()
            .and_then(|target| order.iter().position(|name| name == target));
        let pos = match (injection.order, anchor) {
            (InjectionOrder::Before, Some(idx)) => idx,
            (InjectionOrder::After, Some(idx)) => idx + 1,
            (InjectionOrder::Before, None) => 0,
            (InjectionOrder::After, None) => order.len(),
        };
        order.insert(pos, injection.name.clone());
    }
    order
}

/// Renders the shell lines of `order` into one command block. Lines keep
/// their placeholders; they are expanded in the experiment's scope later.
pub fn render_command(
    app: &ApplicationDefinition,
    order: &[String],
    internals: &Internals,
    builtins: &BTreeMap<String, Vec<String>>,
    env_vars: &[EnvAction],
) -> Result<String, ConfigError> {
    let mut lines = Vec::new();
    for name in order {
        if let Some(builtin) = name.strip_prefix(BUILTIN_PREFIX) {
            if builtin == "env_vars" {
                lines.extend(env_vars.iter().map(EnvAction::shell_line));
                continue;
            }
            let body = builtins.get(builtin).ok_or_else(|| {
                ConfigError::new(
                    format!("/applications/{}/builtins", app.name),
                    format!("unknown builtin '{}'", builtin),
                )
            })?;
            lines.extend(body.iter().cloned());
            continue;
        }
        let exe = internals
            .custom_executables
            .get(name)
            .or_else(|| app.executables.get(name))
            .ok_or_else(|| {
                ConfigError::new(
                    format!("/applications/{}/executables", app.name),
                    format!("unknown executable '{}'", name),
                )
            })?;
        for template in &exe.template {
            let mut line = String::new();
            if exe.use_mpi {
                line.push_str("{mpi_command} ");
            }
            line.push_str(template);
            if !exe.redirect.is_empty() {
                line.push(' ');
                line.push_str(&exe.output_capture);
                line.push(' ');
                line.push_str(&exe.redirect);
            }
            lines.push(line);
        }
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_core::config::parse_yaml;
    use bench_core::{Expander, Scope};

    fn app() -> ApplicationDefinition {
        let mut app = ApplicationDefinition {
            name: "hostname".into(),
            ..Default::default()
        };
        app.executables.insert(
            "serial".into(),
            Executable {
                template: vec!["/bin/hostname".into()],
                use_mpi: false,
                redirect: "{log_file}".into(),
                output_capture: ">>".into(),
            },
        );
        app.executables.insert(
            "parallel".into(),
            Executable {
                template: vec!["/bin/hostname -f".into()],
                use_mpi: true,
                redirect: String::new(),
                output_capture: ">>".into(),
            },
        );
        app
    }

    #[test]
    fn scope_block_parses_every_section() {
        let value = parse_yaml(
            r#"
variables:
  n_nodes: [1, 2]
env_vars:
  set: {OMP_NUM_THREADS: '{n_threads}'}
  prepend: {PATH: /opt/bin}
  unset: [DEBUG]
zips:
  platform_config: [n_nodes, platform]
modifiers:
  - lscpu
  - {name: intel-aps, mode: standard}
internals:
  executables: [parallel]
tags: [smoke]
"#,
        )
        .expect("yaml");
        let block = ScopeBlock::parse("/bench", &value, &[]).expect("block");
        assert!(block.variables["n_nodes"].is_vector());
        assert_eq!(block.env_vars.len(), 3);
        assert_eq!(block.zips["platform_config"], vec!["n_nodes", "platform"]);
        assert_eq!(block.modifiers[1].mode.as_deref(), Some("standard"));
        assert_eq!(block.internals.executables, Some(vec!["parallel".to_string()]));
        assert_eq!(block.tags, vec!["smoke"]);

        let err = ScopeBlock::parse("/bench", &parse_yaml("matrix: [a]").expect("yaml"), &[])
            .expect_err("matrix not allowed at root");
        assert_eq!(err.path, "/bench/matrix");
    }

    #[test]
    fn injections_adjust_executable_order() {
        let workload = WorkloadDefinition {
            executables: vec!["builtin::env_vars".into(), "serial".into()],
            ..Default::default()
        };
        let internals = Internals {
            executable_injection: vec![
                ExecutableInjection {
                    name: "parallel".into(),
                    order: InjectionOrder::Before,
                    relative_to: Some("serial".into()),
                },
                ExecutableInjection {
                    name: "builtin::cleanup".into(),
                    order: InjectionOrder::After,
                    relative_to: None,
                },
            ],
            ..Default::default()
        };
        assert_eq!(
            executable_order(&workload, &internals),
            vec!["builtin::env_vars", "parallel", "serial", "builtin::cleanup"]
        );
    }

    #[test]
    fn command_lines_carry_mpi_prefix_and_redirect() {
        let env = vec![
            EnvAction::Set {
                name: "OMP_NUM_THREADS".into(),
                value: "{n_threads}".into(),
            },
            EnvAction::Append {
                name: "PATH".into(),
                value: "/opt/bin".into(),
                separator: ":".into(),
            },
        ];
        let order = vec![
            "builtin::env_vars".to_string(),
            "serial".to_string(),
            "parallel".to_string(),
        ];
        let command =
            render_command(&app(), &order, &Internals::default(), &BTreeMap::new(), &env)
                .expect("render");

        let mut space = VariableSpace::new();
        space.define(Scope::Generated, "command", VarValue::scalar(command));
        space.define(Scope::Root, "n_threads", VarValue::scalar("4"));
        space.define(Scope::Root, "mpi_command", VarValue::scalar("mpirun -n 2"));
        space.define(Scope::Generated, "log_file", VarValue::scalar("/tmp/out.log"));
        let rendered = Expander::new(&space).expand("{command}").expect("expand");
        assert_eq!(
            rendered,
            "export OMP_NUM_THREADS=\"4\";\n\
             export PATH=\"${PATH}:/opt/bin\";\n\
             /bin/hostname >> /tmp/out.log\n\
             mpirun -n 2 /bin/hostname -f"
        );
    }

    #[test]
    fn unknown_executables_and_builtins_fail() {
        let internals = Internals::default();
        assert!(render_command(&app(), &["nope".into()], &internals, &BTreeMap::new(), &[]).is_err());
        assert!(render_command(
            &app(),
            &["builtin::nope".into()],
            &internals,
            &BTreeMap::new(),
            &[]
        )
        .is_err());
    }

    #[test]
    fn chained_entries_take_defaults() {
        let value = parse_yaml(
            "- name: app.wl.child\n- name: other\n  order: before_root\n  inherit_variables: [n_nodes]\n",
        )
        .expect("yaml");
        let entries = parse_chained_experiments("/x", Some(&value)).expect("entries");
        assert_eq!(entries[0].command, "{execute_experiment}");
        assert_eq!(entries[0].order, "after_root");
        assert_eq!(entries[1].inherit_variables, vec!["n_nodes"]);
    }
}
