//! A bench workspace on disk.
//!
//! ```text
//! <root>/configs/bench.yaml          configuration document (`bench:`)
//! <root>/configs/applications.yaml   definition library
//! <root>/configs/definitions/*.yaml  more definition libraries
//! <root>/configs/*.tpl               script templates
//! <root>/experiments/ inputs/ software/ archive/ logs/
//! <root>/.bench/                     run state and inventories
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bench_core::config::{check_keys, load_yaml};
use bench_core::{ConfigError, ConfigScope, ConfigStack};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::collaborators::{Collaborators, SoftwareConfig};
use crate::criteria::HookRegistry;
use crate::definitions::DefinitionLibrary;
use crate::inventory::{diff_inventories, InventoryDiff, WorkspaceInventory};
use crate::pipeline::{
    run_pipeline, PipelineContext, PipelineKind, PipelineOptions, PipelineReport,
    DEFAULT_EXECUTE_TEMPLATE, STATE_DIR,
};
use crate::set::{ExperimentFilter, ExperimentSet, GenerationOptions};

pub const CONFIG_FILE: &str = "bench.yaml";
pub const LIBRARY_FILE: &str = "applications.yaml";
pub const TEMPLATE_EXTENSION: &str = "tpl";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkspaceSettings {
    #[serde(default)]
    pub strict_expansion: bool,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default)]
    pub package_manager: Option<String>,
    /// Command template with `{url}` and `{dest}` for remote inputs.
    #[serde(default)]
    pub input_fetch_command: Option<String>,
}

fn default_max_depth() -> usize {
    bench_core::expander::DEFAULT_MAX_DEPTH
}

fn default_workers() -> usize {
    1
}

fn default_shell() -> String {
    "sh".to_string()
}

impl Default for WorkspaceSettings {
    fn default() -> Self {
        Self {
            strict_expansion: false,
            max_depth: default_max_depth(),
            workers: default_workers(),
            fail_fast: false,
            shell: default_shell(),
            package_manager: None,
            input_fetch_command: None,
        }
    }
}

impl WorkspaceSettings {
    fn from_json(value: Option<&Value>) -> Result<Self, ConfigError> {
        match value {
            None | Some(Value::Null) => Ok(Self::default()),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| ConfigError::new("/bench/config", e.to_string())),
        }
    }
}

/// Configuration scopes that live outside the workspace: `system`
/// (`/etc/bench/config.yaml`), `site` (`$BENCH_SITE_CONFIG`) and `user`
/// (`$BENCH_USER_CONFIG`, else `~/.bench/config.yaml`). Missing files are
/// skipped.
pub fn environment_scopes() -> Result<Vec<ConfigScope>> {
    let mut candidates: Vec<(&str, PathBuf)> = vec![("system", PathBuf::from("/etc/bench/config.yaml"))];
    if let Ok(site) = std::env::var("BENCH_SITE_CONFIG") {
        candidates.push(("site", PathBuf::from(site)));
    }
    match std::env::var("BENCH_USER_CONFIG") {
        Ok(user) => candidates.push(("user", PathBuf::from(user))),
        Err(_) => {
            if let Ok(home) = std::env::var("HOME") {
                candidates.push(("user", Path::new(&home).join(".bench").join("config.yaml")));
            }
        }
    }
    let mut scopes = Vec::new();
    for (name, path) in candidates {
        if path.is_file() {
            debug!(scope = name, path = %path.display(), "loading configuration scope");
            scopes.push(ConfigScope::from_file(name, &path)?);
        }
    }
    Ok(scopes)
}

#[derive(Debug, Clone, Serialize)]
pub struct InventoryReport {
    pub previous: Option<String>,
    pub experiments: usize,
    pub diff: InventoryDiff,
}

pub struct Workspace {
    pub root: PathBuf,
    pub config: ConfigStack,
    pub bench: Value,
    pub library: DefinitionLibrary,
    pub software: SoftwareConfig,
    pub templates: BTreeMap<String, String>,
    pub settings: WorkspaceSettings,
    pub collaborators: Collaborators,
    pub hooks: HookRegistry,
}

impl Workspace {
    /// Opens the workspace at `root` with the environment's scopes and the
    /// given `path:value` overrides.
    pub fn open(root: &Path, overrides: &[String]) -> Result<Self> {
        Self::open_with(root, environment_scopes()?, overrides)
    }

    pub fn open_with(root: &Path, scopes: Vec<ConfigScope>, overrides: &[String]) -> Result<Self> {
        let configs = root.join("configs");
        let config_path = configs.join(CONFIG_FILE);
        let document = load_yaml(&config_path)?;
        check_keys("", &document, &["bench"])
            .with_context(|| format!("in {}", config_path.display()))?;

        let mut config = ConfigStack::new();
        config.push(ConfigScope::new("defaults", json!({"bench": {}})))?;
        for scope in scopes {
            config.push(scope)?;
        }
        config.push(ConfigScope::new("workspace", document))?;
        for raw in overrides {
            config.apply_override(raw)?;
        }
        let bench = match config.get("/bench") {
            Some(Value::Object(map)) => Value::Object(map),
            Some(Value::Null) | None => Value::Object(Map::new()),
            Some(_) => return Err(ConfigError::new("/bench", "expected a mapping").into()),
        };

        let settings = WorkspaceSettings::from_json(bench.get("config"))?;
        let software = SoftwareConfig::from_json(bench.get("software"))?;
        let library = load_library(&configs)?;
        let templates = load_templates(&configs)?;
        let collaborators = Collaborators::local(&settings.shell, settings.input_fetch_command.clone());
        info!(
            root = %root.display(),
            applications = library.applications.len(),
            templates = templates.len(),
            "opened workspace"
        );
        Ok(Self {
            root: root.to_path_buf(),
            config,
            bench,
            library,
            software,
            templates,
            settings,
            collaborators,
            hooks: HookRegistry::new(),
        })
    }

    pub fn generation_options(&self) -> GenerationOptions {
        GenerationOptions {
            workspace_root: self.root.clone(),
            strict: self.settings.strict_expansion,
            max_depth: self.settings.max_depth,
            template_names: self.templates.keys().cloned().collect(),
        }
    }

    pub fn experiment_set(&self, filter: &ExperimentFilter) -> Result<ExperimentSet> {
        let options = self.generation_options();
        let mut set = ExperimentSet::build(&self.bench, &self.library, &options)?;
        set.apply_filter(filter, &options);
        info!(
            generated = set.summary.generated,
            excluded = set.summary.excluded,
            filtered = set.summary.filtered,
            chained = set.summary.chained,
            failures = set.summary.expansion_failures,
            "experiment set ready"
        );
        Ok(set)
    }

    pub fn pipeline_context<'a>(&'a self, set: &'a ExperimentSet) -> PipelineContext<'a> {
        PipelineContext {
            root: &self.root,
            set,
            library: &self.library,
            software: &self.software,
            templates: &self.templates,
            package_manager: self.settings.package_manager.as_deref(),
            collaborators: &self.collaborators,
            hooks: &self.hooks,
            strict: self.settings.strict_expansion,
            max_depth: self.settings.max_depth,
        }
    }

    pub fn run(
        &self,
        set: &ExperimentSet,
        kind: PipelineKind,
        options: &PipelineOptions,
    ) -> Result<PipelineReport> {
        run_pipeline(&self.pipeline_context(set), kind, options)
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            workers: self.settings.workers,
            fail_fast: self.settings.fail_fast,
            ..PipelineOptions::default()
        }
    }

    pub fn inventory_path(&self) -> PathBuf {
        self.root.join(STATE_DIR).join("inventory.json")
    }

    /// Compares the set's inventory with the one recorded by the last setup.
    pub fn inventory_report(&self, set: &ExperimentSet) -> Result<InventoryReport> {
        let current = self.pipeline_context(set).inventory()?;
        let path = self.inventory_path();
        let previous = WorkspaceInventory::load(&path)?;
        let diff = diff_inventories(&previous.clone().unwrap_or_default(), &current);
        Ok(InventoryReport {
            previous: previous.map(|p| p.generated_at),
            experiments: current.experiments.len(),
            diff,
        })
    }
}

fn load_library(configs: &Path) -> Result<DefinitionLibrary> {
    let mut library = DefinitionLibrary::default();
    let mut files = Vec::new();
    let main = configs.join(LIBRARY_FILE);
    if main.is_file() {
        files.push(main);
    }
    let extra = configs.join("definitions");
    if extra.is_dir() {
        let mut more: Vec<PathBuf> = fs::read_dir(&extra)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file()
                    && matches!(p.extension().and_then(|e| e.to_str()), Some("yaml" | "yml"))
            })
            .collect();
        more.sort();
        files.extend(more);
    }
    for path in files {
        let value = load_yaml(&path)?;
        library.extend(DefinitionLibrary::from_json(
            &path.to_string_lossy(),
            &value,
        )?);
    }
    Ok(library)
}

fn load_templates(configs: &Path) -> Result<BTreeMap<String, String>> {
    let mut templates = BTreeMap::new();
    if configs.is_dir() {
        for entry in fs::read_dir(configs)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(TEMPLATE_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let source = fs::read_to_string(&path)
                .with_context(|| format!("failed to read template {}", path.display()))?;
            templates.insert(stem.to_string(), source);
        }
    }
    templates
        .entry("execute_experiment".to_string())
        .or_insert_with(|| DEFAULT_EXECUTE_TEMPLATE.to_string());
    Ok(templates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_core::ensure_dir;
    use chrono::Utc;

    const LIBRARY: &str = r#"
applications:
  hostname:
    executables:
      serial:
        template: [/bin/hostname]
    workloads:
      local:
        executables: [serial]
"#;

    const CONFIG: &str = r#"
bench:
  config:
    workers: 2
  variables:
    mpi_command: mpirun
    batch_submit: '{execute_experiment}'
  applications:
    hostname:
      workloads:
        local:
          experiments:
            'run_{n_nodes}':
              variables:
                n_nodes: [1, 2, 4]
"#;

    fn workspace_dir(tag: &str, config: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "bench_workspace_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root.join("configs")).expect("configs");
        fs::write(root.join("configs").join(CONFIG_FILE), config).expect("config");
        fs::write(root.join("configs").join(LIBRARY_FILE), LIBRARY).expect("library");
        root
    }

    #[test]
    fn opens_layers_and_templates() {
        let root = workspace_dir("open", CONFIG);
        fs::write(root.join("configs").join("env.tpl"), "export X={n_nodes}\n").expect("tpl");
        let workspace = Workspace::open_with(
            &root,
            vec![ConfigScope::new("user", json!({"bench": {"config": {"fail_fast": true, "workers": 8}}}))],
            &["bench:config:workers:3".to_string()],
        )
        .expect("open");
        assert_eq!(workspace.settings.workers, 3);
        assert!(workspace.settings.fail_fast);
        assert_eq!(
            workspace.templates.keys().cloned().collect::<Vec<_>>(),
            vec!["env", "execute_experiment"]
        );
        let set = workspace
            .experiment_set(&ExperimentFilter::default())
            .expect("set");
        assert_eq!(set.experiments.len(), 3);
        assert_eq!(
            set.experiments[0].value("env"),
            Some(root.join("experiments/hostname/local/run_1/env").to_string_lossy().as_ref())
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn where_filter_counts_filtered_experiments() {
        let root = workspace_dir("filter", CONFIG);
        let workspace = Workspace::open_with(&root, Vec::new(), &[]).expect("open");
        let filter = ExperimentFilter {
            where_clauses: vec!["{n_nodes} > 1".to_string()],
            tags: Vec::new(),
        };
        let set = workspace.experiment_set(&filter).expect("set");
        let names: Vec<&str> = set.experiments.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["run_2", "run_4"]);
        assert_eq!(set.summary.filtered, 1);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn unknown_keys_are_configuration_errors() {
        let root = workspace_dir("keys", "bench: {}\nextra: 1\n");
        let err = Workspace::open_with(&root, Vec::new(), &[]).err().expect("unknown root key");
        assert!(err.downcast_ref::<ConfigError>().is_some(), "{:#}", err);

        fs::write(
            root.join("configs").join(CONFIG_FILE),
            "bench:\n  config:\n    wokers: 2\n",
        )
        .expect("config");
        let err = Workspace::open_with(&root, Vec::new(), &[]).err().expect("unknown setting");
        let config_err = err.downcast_ref::<ConfigError>().expect("config error");
        assert_eq!(config_err.path, "/bench/config");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn inventory_report_tracks_changes_since_setup() {
        let root = workspace_dir("inventory", CONFIG);
        let workspace = Workspace::open_with(&root, Vec::new(), &[]).expect("open");
        let set = workspace
            .experiment_set(&ExperimentFilter::default())
            .expect("set");
        let first = workspace.inventory_report(&set).expect("report");
        assert!(first.previous.is_none());
        assert_eq!(first.diff.added.len(), 3);

        workspace
            .pipeline_context(&set)
            .inventory()
            .expect("inventory")
            .write(&workspace.inventory_path())
            .expect("write");
        let changed = Workspace::open_with(
            &root,
            Vec::new(),
            &["bench:variables:mpi_command:srun".to_string()],
        )
        .expect("open");
        let set = changed
            .experiment_set(&ExperimentFilter::default())
            .expect("set");
        let report = changed.inventory_report(&set).expect("report");
        assert!(report.previous.is_some());
        assert!(report.diff.added.is_empty());
        assert_eq!(report.diff.changed.len(), 3);
        assert_eq!(report.diff.changed["hostname.local.run_1"], vec!["variables"]);
        let _ = fs::remove_dir_all(root);
    }
}
