//! Application, modifier and package-manager definitions.
//!
//! Definitions are plain data loaded from YAML (`applications.yaml`). Each
//! kind exposes the same capability set through [`ObjectDefinition`], so
//! the pipeline can collect phases, builtins, success criteria and figures
//! of merit without caring which kind of object supplied them.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use bench_core::config::check_keys;
use bench_core::{ConfigError, VarValue};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Application,
    Modifier,
    PackageManager,
}

pub trait ObjectDefinition {
    fn kind(&self) -> ObjectKind;
    fn name(&self) -> &str;
    fn phases(&self) -> Vec<PhaseSpec>;
    fn builtins(&self) -> &BTreeMap<String, Vec<String>>;
    fn success_criteria(&self) -> &[SuccessCriterion];
    fn figures_of_merit(&self) -> &[FigureOfMerit];
    fn fom_contexts(&self) -> &[FomContext];
}

fn de_variables<'de, D>(deserializer: D) -> Result<BTreeMap<String, VarValue>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: BTreeMap<String, Value> = BTreeMap::deserialize(deserializer)?;
    raw.iter()
        .map(|(name, value)| {
            VarValue::from_json(name, value)
                .map(|v| (name.clone(), v))
                .map_err(serde::de::Error::custom)
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhaseSpec {
    pub name: String,
    #[serde(default = "default_pipeline")]
    pub pipeline: String,
    #[serde(default)]
    pub run_before: Vec<String>,
    #[serde(default)]
    pub run_after: Vec<String>,
    /// Shell command run in the experiment directory; phases without one
    /// are handled by the engine or are no-ops.
    #[serde(default)]
    pub command: Option<String>,
}

fn default_pipeline() -> String {
    "setup".to_string()
}

impl PhaseSpec {
    pub fn builtin(name: &str, pipeline: &str, run_after: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            pipeline: pipeline.to_string(),
            run_before: Vec::new(),
            run_after: run_after.iter().map(|s| s.to_string()).collect(),
            command: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Executable {
    #[serde(default)]
    pub template: Vec<String>,
    #[serde(default)]
    pub use_mpi: bool,
    #[serde(default = "default_redirect")]
    pub redirect: String,
    #[serde(default = "default_output_capture")]
    pub output_capture: String,
}

fn default_redirect() -> String {
    "{log_file}".to_string()
}

fn default_output_capture() -> String {
    ">>".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkloadDefinition {
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub executables: Vec<String>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default, deserialize_with = "de_variables")]
    pub variables: BTreeMap<String, VarValue>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputDefinition {
    #[serde(skip)]
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FigureOfMerit {
    pub name: String,
    #[serde(default = "default_redirect")]
    pub log_file: String,
    pub fom_regex: String,
    pub group_name: String,
    #[serde(default)]
    pub units: String,
    #[serde(default)]
    pub contexts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FomContext {
    pub name: String,
    pub regex: String,
    pub output_format: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CriterionMode {
    #[serde(rename = "string")]
    StringMatch {
        #[serde(rename = "match")]
        pattern: String,
        #[serde(default = "default_redirect")]
        file: String,
    },
    /// `formula` holds for every figure of merit selected by name and
    /// context; `{value}` / `value` binds the figure's value.
    #[serde(rename = "fom_comparison")]
    Formula {
        fom_name: String,
        #[serde(default = "default_fom_context")]
        fom_context: String,
        formula: String,
    },
    Hook { hook: String },
}

fn default_fom_context() -> String {
    "null".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessCriterion {
    pub name: String,
    #[serde(flatten)]
    pub mode: CriterionMode,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApplicationDefinition {
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, deserialize_with = "de_variables")]
    pub variables: BTreeMap<String, VarValue>,
    #[serde(default)]
    pub executables: BTreeMap<String, Executable>,
    #[serde(default)]
    pub workloads: BTreeMap<String, WorkloadDefinition>,
    #[serde(default)]
    pub inputs: BTreeMap<String, InputDefinition>,
    #[serde(default)]
    pub figures_of_merit: Vec<FigureOfMerit>,
    #[serde(default)]
    pub fom_contexts: Vec<FomContext>,
    #[serde(default)]
    pub success_criteria: Vec<SuccessCriterion>,
    #[serde(default)]
    pub builtins: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub phases: Vec<PhaseSpec>,
}

pub fn standard_phases() -> Vec<PhaseSpec> {
    vec![
        PhaseSpec::builtin("get_inputs", "setup", &[]),
        PhaseSpec::builtin("software_create_env", "setup", &["get_inputs"]),
        PhaseSpec::builtin("make_experiments", "setup", &["software_create_env"]),
        PhaseSpec::builtin("write_inventory", "setup", &["make_experiments"]),
        PhaseSpec::builtin("submit_experiment", "execute", &[]),
        PhaseSpec::builtin("analyze_experiments", "analyze", &[]),
        PhaseSpec::builtin("archive_experiments", "archive", &[]),
        PhaseSpec::builtin("mirror_inputs", "mirror", &[]),
    ]
}

impl ObjectDefinition for ApplicationDefinition {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Application
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn phases(&self) -> Vec<PhaseSpec> {
        let mut out = standard_phases();
        out.extend(self.phases.iter().cloned());
        out
    }
    fn builtins(&self) -> &BTreeMap<String, Vec<String>> {
        &self.builtins
    }
    fn success_criteria(&self) -> &[SuccessCriterion] {
        &self.success_criteria
    }
    fn figures_of_merit(&self) -> &[FigureOfMerit] {
        &self.figures_of_merit
    }
    fn fom_contexts(&self) -> &[FomContext] {
        &self.fom_contexts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModificationMethod {
    Set,
    Append,
    Prepend,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VariableModification {
    pub variable: String,
    #[serde(default = "default_method")]
    pub method: ModificationMethod,
    pub modification: String,
    #[serde(default = "default_separator")]
    pub separator: String,
}

fn default_method() -> ModificationMethod {
    ModificationMethod::Set
}

fn default_separator() -> String {
    " ".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModifierMode {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub variable_modifications: Vec<VariableModification>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModifierDefinition {
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub default_mode: Option<String>,
    #[serde(default)]
    pub modes: BTreeMap<String, ModifierMode>,
    #[serde(default)]
    pub figures_of_merit: Vec<FigureOfMerit>,
    #[serde(default)]
    pub fom_contexts: Vec<FomContext>,
    #[serde(default)]
    pub success_criteria: Vec<SuccessCriterion>,
    #[serde(default)]
    pub builtins: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub phases: Vec<PhaseSpec>,
}

impl ModifierDefinition {
    /// The requested mode, or the default one; a modifier with exactly one
    /// mode uses it when none is named.
    pub fn mode(&self, requested: Option<&str>) -> Option<(&str, &ModifierMode)> {
        let name = match requested.or(self.default_mode.as_deref()) {
            Some(name) => name,
            None if self.modes.len() == 1 => self.modes.keys().next()?.as_str(),
            None => return None,
        };
        self.modes.get_key_value(name).map(|(k, v)| (k.as_str(), v))
    }
}

impl ObjectDefinition for ModifierDefinition {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Modifier
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn phases(&self) -> Vec<PhaseSpec> {
        self.phases.clone()
    }
    fn builtins(&self) -> &BTreeMap<String, Vec<String>> {
        &self.builtins
    }
    fn success_criteria(&self) -> &[SuccessCriterion] {
        &self.success_criteria
    }
    fn figures_of_merit(&self) -> &[FigureOfMerit] {
        &self.figures_of_merit
    }
    fn fom_contexts(&self) -> &[FomContext] {
        &self.fom_contexts
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageManagerDefinition {
    #[serde(skip)]
    pub name: String,
    #[serde(default, deserialize_with = "de_variables")]
    pub variables: BTreeMap<String, VarValue>,
    #[serde(default)]
    pub builtins: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub phases: Vec<PhaseSpec>,
}

impl ObjectDefinition for PackageManagerDefinition {
    fn kind(&self) -> ObjectKind {
        ObjectKind::PackageManager
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn phases(&self) -> Vec<PhaseSpec> {
        self.phases.clone()
    }
    fn builtins(&self) -> &BTreeMap<String, Vec<String>> {
        &self.builtins
    }
    fn success_criteria(&self) -> &[SuccessCriterion] {
        &[]
    }
    fn figures_of_merit(&self) -> &[FigureOfMerit] {
        &[]
    }
    fn fom_contexts(&self) -> &[FomContext] {
        &[]
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DefinitionLibrary {
    pub applications: BTreeMap<String, ApplicationDefinition>,
    pub modifiers: BTreeMap<String, ModifierDefinition>,
    pub package_managers: BTreeMap<String, PackageManagerDefinition>,
}

const LIBRARY_KEYS: &[&str] = &["applications", "modifiers", "package_managers"];

fn parse_named<T>(path: &str, value: Option<&Value>) -> Result<BTreeMap<String, T>>
where
    T: for<'de> Deserialize<'de>,
{
    let mut out = BTreeMap::new();
    let Some(value) = value else {
        return Ok(out);
    };
    let map = match value {
        Value::Null => return Ok(out),
        Value::Object(map) => map,
        _ => return Err(ConfigError::new(path, "expected a mapping").into()),
    };
    for (name, body) in map {
        let item_path = format!("{}/{}", path, name);
        let body = if body.is_null() {
            Value::Object(Default::default())
        } else {
            body.clone()
        };
        let parsed: T = serde_json::from_value(body)
            .map_err(|e| ConfigError::new(&item_path, e.to_string()))?;
        out.insert(name.clone(), parsed);
    }
    Ok(out)
}

impl DefinitionLibrary {
    pub fn from_json(source: &str, value: &Value) -> Result<Self> {
        check_keys("", value, LIBRARY_KEYS).with_context(|| format!("in {}", source))?;
        let mut applications: BTreeMap<String, ApplicationDefinition> =
            parse_named("/applications", value.get("applications"))
                .with_context(|| format!("in {}", source))?;
        for (name, app) in applications.iter_mut() {
            app.name = name.clone();
            for (wl_name, wl) in app.workloads.iter_mut() {
                wl.name = wl_name.clone();
            }
            for (input_name, input) in app.inputs.iter_mut() {
                input.name = input_name.clone();
            }
        }
        let mut modifiers: BTreeMap<String, ModifierDefinition> =
            parse_named("/modifiers", value.get("modifiers"))
                .with_context(|| format!("in {}", source))?;
        for (name, modifier) in modifiers.iter_mut() {
            modifier.name = name.clone();
        }
        let mut package_managers: BTreeMap<String, PackageManagerDefinition> =
            parse_named("/package_managers", value.get("package_managers"))
                .with_context(|| format!("in {}", source))?;
        for (name, pm) in package_managers.iter_mut() {
            pm.name = name.clone();
        }
        Ok(Self {
            applications,
            modifiers,
            package_managers,
        })
    }

    /// Later libraries replace same-named objects of earlier ones.
    pub fn extend(&mut self, other: DefinitionLibrary) {
        self.applications.extend(other.applications);
        self.modifiers.extend(other.modifiers);
        self.package_managers.extend(other.package_managers);
    }

    pub fn application(&self, name: &str) -> Option<&ApplicationDefinition> {
        self.applications.get(name)
    }

    pub fn modifier(&self, name: &str) -> Option<&ModifierDefinition> {
        self.modifiers.get(name)
    }

    pub fn package_manager(&self, name: &str) -> Option<&PackageManagerDefinition> {
        self.package_managers.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_core::config::parse_yaml;

    const LIBRARY: &str = r#"
applications:
  hostname:
    tags: [test]
    variables:
      greeting: hello
    executables:
      serial:
        template: ["/bin/hostname"]
      parallel:
        template: ["/bin/hostname", "echo done"]
        use_mpi: true
    workloads:
      local:
        executables: [builtin::env_vars, serial]
        variables:
          n_ranks: 1
    figures_of_merit:
      - name: possible hostname
        fom_regex: '(?P<hostname>\S+)\s*'
        group_name: hostname
    success_criteria:
      - name: found
        mode: string
        match: '.*'
      - name: fast
        mode: fom_comparison
        fom_name: time
        formula: '{value} < 10'
        required: false
modifiers:
  lscpu:
    modes:
      standard:
        variable_modifications:
          - variable: mpi_command
            method: prepend
            modification: lscpu &&
package_managers:
  pip:
    phases:
      - name: pip_install
        command: pip install -r requirements.txt
"#;

    fn library() -> DefinitionLibrary {
        let value = parse_yaml(LIBRARY).expect("yaml");
        DefinitionLibrary::from_json("applications.yaml", &value).expect("library")
    }

    #[test]
    fn parses_applications_with_defaults() {
        let lib = library();
        let app = lib.application("hostname").expect("app");
        assert_eq!(app.name, "hostname");
        assert_eq!(app.workloads["local"].name, "local");
        assert_eq!(app.workloads["local"].variables["n_ranks"], VarValue::scalar("1"));
        let serial = &app.executables["serial"];
        assert!(!serial.use_mpi);
        assert_eq!(serial.redirect, "{log_file}");
        assert_eq!(serial.output_capture, ">>");
        assert_eq!(app.figures_of_merit[0].log_file, "{log_file}");
    }

    #[test]
    fn criteria_parse_into_modes() {
        let lib = library();
        let criteria = lib.application("hostname").expect("app").success_criteria();
        assert!(matches!(
            &criteria[0].mode,
            CriterionMode::StringMatch { pattern, file } if pattern == ".*" && file == "{log_file}"
        ));
        assert!(criteria[0].required);
        match &criteria[1].mode {
            CriterionMode::Formula { fom_context, .. } => assert_eq!(fom_context, "null"),
            other => panic!("unexpected mode {:?}", other),
        }
        assert!(!criteria[1].required);
    }

    #[test]
    fn capability_sets_are_uniform_across_kinds() {
        let lib = library();
        let objects: Vec<&dyn ObjectDefinition> = vec![
            lib.application("hostname").expect("app"),
            lib.modifier("lscpu").expect("modifier"),
            lib.package_manager("pip").expect("pm"),
        ];
        let kinds: Vec<_> = objects.iter().map(|o| o.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                ObjectKind::Application,
                ObjectKind::Modifier,
                ObjectKind::PackageManager
            ]
        );
        assert!(objects[0]
            .phases()
            .iter()
            .any(|p| p.name == "make_experiments"));
        assert_eq!(objects[2].phases()[0].pipeline, "setup");
        assert!(objects[2].success_criteria().is_empty());
    }

    #[test]
    fn single_mode_modifier_needs_no_mode_name() {
        let lib = library();
        let (name, mode) = lib.modifier("lscpu").expect("modifier").mode(None).expect("mode");
        assert_eq!(name, "standard");
        assert_eq!(mode.variable_modifications[0].method, ModificationMethod::Prepend);
        assert!(lib.modifier("lscpu").expect("modifier").mode(Some("nope")).is_none());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let value = parse_yaml("applications:\n  a:\n    bogus: 1\n").expect("yaml");
        let err = DefinitionLibrary::from_json("applications.yaml", &value)
            .expect_err("unknown key");
        assert!(format!("{:#}", err).contains("bogus"), "{:#}", err);
        let value = parse_yaml("apps: {}\n").expect("yaml");
        assert!(DefinitionLibrary::from_json("applications.yaml", &value).is_err());
    }
}
