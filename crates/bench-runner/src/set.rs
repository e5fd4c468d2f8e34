//! Generation of the experiment set from the `bench:` configuration tree.
//!
//! Generation runs in stages: per-template combination (vectors, zips,
//! matrices, exclusions), name expansion, modifiers and repeats; then chain
//! splicing over the whole set; then variable resolution in cross-reference
//! order; and finally optional `--where` / `--tags` filtering.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use anyhow::Result;
use bench_core::config::{check_keys, string_list};
use bench_core::variables::variables_from_json;
use bench_core::{
    find_cross_references, CombinatorError, ConfigError, Expander, ExpansionError, Scope,
    VarValue, VariableSpace,
};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::chains;
use crate::combinator::{combine, matches_any, Assignment, CombinatorInput, MatrixSpec};
use crate::definitions::{
    ApplicationDefinition, DefinitionLibrary, ModificationMethod, WorkloadDefinition,
};
use crate::experiment::{
    executable_order, parse_chained_experiments, parse_zips, render_command, Experiment,
    Internals, Repeat, ScopeBlock,
};

const ROOT_KEYS: &[&str] = &["applications", "config", "software"];
const EXPERIMENT_KEYS: &[&str] = &[
    "matrix",
    "matrices",
    "exclude",
    "chained_experiments",
    "template",
];

#[derive(Debug, Clone)]
pub struct GenerationOptions {
    pub workspace_root: PathBuf,
    pub strict: bool,
    pub max_depth: usize,
    /// Stems of the workspace's script templates; each becomes a path
    /// variable inside the experiment's run directory.
    pub template_names: Vec<String>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            strict: false,
            max_depth: bench_core::expander::DEFAULT_MAX_DEPTH,
            template_names: vec!["execute_experiment".to_string()],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GenerationSummary {
    pub generated: usize,
    pub excluded: usize,
    pub filtered: usize,
    pub templates: usize,
    pub chained: usize,
    pub repeats: usize,
    pub expansion_failures: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExperimentFailure {
    pub namespace: String,
    pub stage: String,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct ExperimentFilter {
    pub where_clauses: Vec<String>,
    pub tags: Vec<String>,
}

impl ExperimentFilter {
    pub fn is_empty(&self) -> bool {
        self.where_clauses.is_empty() && self.tags.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExperimentSet {
    pub experiments: Vec<Experiment>,
    pub summary: GenerationSummary,
    pub failures: Vec<ExperimentFailure>,
}

struct Exclusions {
    assignments: Vec<Assignment>,
    where_clauses: Vec<String>,
}

impl Exclusions {
    fn matches(&self, expander: &Expander<'_>) -> Result<bool, ExpansionError> {
        let hit = matches_any(
            &self.assignments,
            |name| {
                if expander.space().contains(name) {
                    expander.expand_var(name).map(Some)
                } else {
                    Ok(None)
                }
            },
            |raw| expander.expand(raw),
        )?;
        if hit {
            return Ok(true);
        }
        for clause in &self.where_clauses {
            if expander.evaluate_bool(clause)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

struct TemplateContext<'a> {
    app: &'a ApplicationDefinition,
    workload: &'a WorkloadDefinition,
    blocks: [&'a ScopeBlock; 4],
    value: &'a Value,
    path: String,
    template_name: &'a str,
}

impl TemplateContext<'_> {
    fn namespace(&self) -> String {
        format!("{}.{}.{}", self.app.name, self.workload.name, self.template_name)
    }
}

fn entries<'v>(
    value: &'v Value,
    key: &str,
    path: &str,
) -> Result<Vec<(&'v String, &'v Value)>, ConfigError> {
    match value.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Object(map)) => Ok(map.iter().collect()),
        Some(_) => Err(ConfigError::new(format!("{}/{}", path, key), "expected a mapping")),
    }
}

fn parse_matrices(path: &str, value: &Value) -> Result<Vec<MatrixSpec>, ConfigError> {
    let mut out = Vec::new();
    if let Some(members) = value.get("matrix") {
        out.push(MatrixSpec {
            name: "matrix".to_string(),
            members: string_list(&format!("{}/matrix", path), Some(members))?,
        });
    }
    match value.get("matrices") {
        None | Some(Value::Null) => {}
        Some(Value::Array(items)) => {
            for (idx, item) in items.iter().enumerate() {
                let item_path = format!("{}/matrices/{}", path, idx);
                match item {
                    Value::Object(map) if map.len() == 1 => {
                        for (name, members) in map {
                            out.push(MatrixSpec {
                                name: name.clone(),
                                members: string_list(&item_path, Some(members))?,
                            });
                        }
                    }
                    Value::Array(_) => out.push(MatrixSpec {
                        name: format!("matrix_{}", idx),
                        members: string_list(&item_path, Some(item))?,
                    }),
                    _ => {
                        return Err(ConfigError::new(
                            item_path,
                            "expected a list of names or a single named list",
                        ))
                    }
                }
            }
        }
        Some(_) => {
            return Err(ConfigError::new(
                format!("{}/matrices", path),
                "expected a list of matrices",
            ))
        }
    }
    Ok(out)
}

fn parse_exclude(path: &str, value: Option<&Value>, namespace: &str) -> Result<Exclusions> {
    let mut exclusions = Exclusions {
        assignments: Vec::new(),
        where_clauses: Vec::new(),
    };
    let Some(value) = value else {
        return Ok(exclusions);
    };
    check_keys(path, value, &["variables", "zips", "matrix", "matrices", "where"])?;
    exclusions.where_clauses = string_list(&format!("{}/where", path), value.get("where"))?;
    let variables = variables_from_json(&format!("{}/variables", path), value.get("variables"))?;
    if variables.is_empty() {
        return Ok(exclusions);
    }
    let vectors: BTreeMap<String, Vec<String>> = variables
        .iter()
        .filter_map(|(name, v)| v.as_list().map(|items| (name.clone(), items.to_vec())))
        .collect();
    let scalars: BTreeMap<String, String> = variables
        .iter()
        .filter_map(|(name, v)| v.as_scalar().map(|s| (name.clone(), s.to_string())))
        .collect();
    let scalar_names: BTreeSet<String> = scalars.keys().cloned().collect();
    let zips = parse_zips(&format!("{}/zips", path), value.get("zips"))?;
    let matrices = parse_matrices(path, value)?;
    let label = format!("{} (exclude)", namespace);
    let mut assignments = combine(&CombinatorInput {
        experiment: &label,
        vectors: &vectors,
        scalars: &scalar_names,
        zips: &zips,
        matrices: &matrices,
    })?;
    for assignment in assignments.iter_mut() {
        assignment.extend(scalars.clone());
    }
    exclusions.assignments = assignments;
    Ok(exclusions)
}

fn define_generated(space: &mut VariableSpace, ctx: &TemplateContext<'_>, options: &GenerationOptions) {
    let generated = [
        ("application_name", ctx.app.name.clone()),
        ("workload_name", ctx.workload.name.clone()),
        ("experiment_template_name", ctx.template_name.to_string()),
        (
            "workspace_root",
            options.workspace_root.to_string_lossy().to_string(),
        ),
        (
            "application_run_dir",
            "{workspace_root}/experiments/{application_name}".to_string(),
        ),
        (
            "workload_run_dir",
            "{application_run_dir}/{workload_name}".to_string(),
        ),
        (
            "experiment_run_dir",
            "{workload_run_dir}/{experiment_name}".to_string(),
        ),
        (
            "application_input_dir",
            "{workspace_root}/inputs/{application_name}".to_string(),
        ),
        (
            "workload_input_dir",
            "{application_input_dir}/{workload_name}".to_string(),
        ),
        ("software_dir", "{workspace_root}/software/{env_name}".to_string()),
        ("log_dir", "{workspace_root}/logs".to_string()),
        (
            "log_file",
            "{experiment_run_dir}/{experiment_name}.out".to_string(),
        ),
    ];
    for (name, value) in generated {
        space.define(Scope::Generated, name, VarValue::Scalar(value));
    }
    for stem in &options.template_names {
        space.define(
            Scope::Generated,
            stem.clone(),
            VarValue::Scalar(format!("{{experiment_run_dir}}/{}", stem)),
        );
    }
}

fn modified_value(
    previous: Option<&VarValue>,
    method: ModificationMethod,
    modification: &str,
    separator: &str,
) -> String {
    let previous = previous.and_then(VarValue::as_scalar).unwrap_or("");
    match method {
        ModificationMethod::Set => modification.to_string(),
        _ if previous.is_empty() => modification.to_string(),
        ModificationMethod::Append => format!("{}{}{}", previous, separator, modification),
        ModificationMethod::Prepend => format!("{}{}{}", modification, separator, previous),
    }
}

impl ExperimentSet {
    /// Builds the spliced, resolved set. Configuration and combinator
    /// errors abort; per-experiment failures are recorded and skipped.
    pub fn build(
        bench: &Value,
        library: &DefinitionLibrary,
        options: &GenerationOptions,
    ) -> Result<Self> {
        let mut set = Self::generate(bench, library, options)?;
        set.resolve(options);
        Ok(set)
    }

    pub fn generate(
        bench: &Value,
        library: &DefinitionLibrary,
        options: &GenerationOptions,
    ) -> Result<Self> {
        let root = ScopeBlock::parse("/bench", bench, ROOT_KEYS)?;
        let mut set = ExperimentSet::default();
        let mut base: Vec<Experiment> = Vec::new();
        let mut seen = BTreeSet::new();

        for (app_name, app_value) in entries(bench, "applications", "/bench")? {
            let app_path = format!("/bench/applications/{}", app_name);
            let app = library.application(app_name).ok_or_else(|| {
                ConfigError::new(&app_path, format!("no definition for application '{}'", app_name))
            })?;
            let app_block = ScopeBlock::parse(&app_path, app_value, &["workloads"])?;
            for (wl_name, wl_value) in entries(app_value, "workloads", &app_path)? {
                let wl_path = format!("{}/workloads/{}", app_path, wl_name);
                let workload = app.workloads.get(wl_name).ok_or_else(|| {
                    ConfigError::new(
                        &wl_path,
                        format!("application '{}' has no workload '{}'", app_name, wl_name),
                    )
                })?;
                let wl_block = ScopeBlock::parse(&wl_path, wl_value, &["experiments"])?;
                for (exp_name, exp_value) in entries(wl_value, "experiments", &wl_path)? {
                    let exp_path = format!("{}/experiments/{}", wl_path, exp_name);
                    let exp_block = ScopeBlock::parse(&exp_path, exp_value, EXPERIMENT_KEYS)?;
                    let ctx = TemplateContext {
                        app,
                        workload,
                        blocks: [&root, &app_block, &wl_block, &exp_block],
                        value: exp_value,
                        path: exp_path,
                        template_name: exp_name,
                    };
                    for exp in set.generate_template(&ctx, library, options)? {
                        if !seen.insert(exp.namespace.clone()) {
                            return Err(CombinatorError::DuplicateNamespace {
                                namespace: exp.namespace,
                            }
                            .into());
                        }
                        base.push(exp);
                    }
                }
            }
        }

        let (mut experiments, chain_failures) = chains::splice(base);
        for (namespace, err) in chain_failures {
            warn!(%namespace, error = %err, "dropping experiment chain");
            set.failures.push(ExperimentFailure {
                namespace,
                stage: "chain".to_string(),
                message: err.to_string(),
            });
        }
        let mut spliced = BTreeSet::new();
        for exp in &experiments {
            if !spliced.insert(exp.namespace.clone()) {
                return Err(CombinatorError::DuplicateNamespace {
                    namespace: exp.namespace.clone(),
                }
                .into());
            }
        }
        set.summary.chained = experiments.iter().filter(|e| e.chain.is_some()).count();
        for (idx, exp) in experiments.iter_mut().enumerate() {
            exp.index = idx + 1;
            exp.space.define(
                Scope::Generated,
                "experiment_index",
                VarValue::Scalar(exp.index.to_string()),
            );
        }
        set.experiments = experiments;
        debug!(summary = ?set.summary, "generated experiment set");
        Ok(set)
    }

    fn generate_template(
        &mut self,
        ctx: &TemplateContext<'_>,
        library: &DefinitionLibrary,
        options: &GenerationOptions,
    ) -> Result<Vec<Experiment>> {
        let template_ns = ctx.namespace();
        let scopes = [
            Scope::Root,
            Scope::Application,
            Scope::Workload,
            Scope::Experiment,
        ];

        let mut space = VariableSpace::new();
        space.define_all(Scope::Defaults, &ctx.app.variables);
        space.define_all(Scope::Defaults, &ctx.workload.variables);
        space.define(Scope::Defaults, "env_name", VarValue::scalar("{application_name}"));
        for input in &ctx.workload.inputs {
            space.define(
                Scope::Defaults,
                input.clone(),
                VarValue::Scalar(format!("{{workload_input_dir}}/{}", input)),
            );
        }
        for (scope, block) in scopes.iter().zip(ctx.blocks.iter()) {
            space.define_all(*scope, &block.variables);
        }
        define_generated(&mut space, ctx, options);

        let mut zips = BTreeMap::new();
        let mut env_vars = Vec::new();
        let mut modifiers = Vec::new();
        let mut criteria = Vec::new();
        let mut internals = Internals::default();
        let mut tags: BTreeSet<String> = ctx
            .app
            .tags
            .iter()
            .chain(ctx.workload.tags.iter())
            .cloned()
            .collect();
        for block in ctx.blocks {
            zips.extend(block.zips.clone());
            env_vars.extend(block.env_vars.iter().cloned());
            modifiers.extend(block.modifiers.iter().cloned());
            criteria.extend(block.success_criteria.iter().cloned());
            internals.merge(&block.internals);
            tags.extend(block.tags.iter().cloned());
        }
        let matrices = parse_matrices(&ctx.path, ctx.value)?;
        let exclusions = parse_exclude(
            &format!("{}/exclude", ctx.path),
            ctx.value.get("exclude"),
            &template_ns,
        )?;
        let chained = parse_chained_experiments(
            &format!("{}/chained_experiments", ctx.path),
            ctx.value.get("chained_experiments"),
        )?;
        let template = match ctx.value.get("template") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(_) => {
                return Err(ConfigError::new(format!("{}/template", ctx.path), "expected a boolean").into())
            }
        };

        let mut builtins = ctx.app.builtins.clone();
        let mut modes = Vec::new();
        for modifier in &modifiers {
            let definition = library.modifier(&modifier.name).ok_or_else(|| {
                ConfigError::new(
                    format!("{}/modifiers", ctx.path),
                    format!("no definition for modifier '{}'", modifier.name),
                )
            })?;
            let (_, mode) = definition.mode(modifier.mode.as_deref()).ok_or_else(|| {
                ConfigError::new(
                    format!("{}/modifiers", ctx.path),
                    format!(
                        "modifier '{}' has no mode '{}'",
                        modifier.name,
                        modifier.mode.as_deref().unwrap_or("<default>")
                    ),
                )
            })?;
            builtins.extend(definition.builtins.clone());
            modes.push(mode);
        }
        let order = executable_order(ctx.workload, &internals);
        let command = render_command(ctx.app, &order, &internals, &builtins, &env_vars)?;

        let effective = space.effective();
        let vectors: BTreeMap<String, Vec<String>> = effective
            .iter()
            .filter_map(|(name, v)| v.as_list().map(|items| (name.clone(), items.to_vec())))
            .collect();
        let scalars: BTreeSet<String> = effective
            .iter()
            .filter(|(_, v)| !v.is_vector())
            .map(|(name, _)| name.clone())
            .collect();
        let assignments = combine(&CombinatorInput {
            experiment: &template_ns,
            vectors: &vectors,
            scalars: &scalars,
            zips: &zips,
            matrices: &matrices,
        })?;

        let mut out = Vec::new();
        for (position, assignment) in assignments.into_iter().enumerate() {
            let mut exp_space = space.clone();
            for (name, value) in assignment {
                exp_space.define(Scope::Assignment, name, VarValue::Scalar(value));
            }
            exp_space.derive_reserved();

            let expander = Expander::new(&exp_space)
                .strict(options.strict)
                .max_depth(options.max_depth);
            let named = exclusions.matches(&expander).and_then(|excluded| {
                if excluded {
                    Ok(None)
                } else {
                    expander.expand(ctx.template_name).map(Some)
                }
            });
            drop(expander);
            let name = match named {
                Ok(Some(name)) => name,
                Ok(None) => {
                    self.summary.excluded += 1;
                    continue;
                }
                Err(err) => {
                    self.record_expansion_failure(format!("{}[{}]", template_ns, position), &err);
                    continue;
                }
            };

            for mode in &modes {
                for modification in &mode.variable_modifications {
                    let value = modified_value(
                        exp_space.resolve(&modification.variable),
                        modification.method,
                        &modification.modification,
                        &modification.separator,
                    );
                    exp_space.define(Scope::Modifier, modification.variable.clone(), VarValue::Scalar(value));
                }
            }
            exp_space.define(Scope::Generated, "command", VarValue::Scalar(command.clone()));

            let namespace = format!("{}.{}.{}", ctx.app.name, ctx.workload.name, name);
            let repeats = match repeat_count(&exp_space, options) {
                Ok(count) => count,
                Err(err) => {
                    self.record_expansion_failure(namespace, &err);
                    continue;
                }
            };
            let experiment = Experiment {
                application: ctx.app.name.clone(),
                workload: ctx.workload.name.clone(),
                name: name.clone(),
                namespace,
                template,
                index: 0,
                repeat: Repeat::Single,
                space: exp_space,
                tags: tags.clone(),
                modifiers: modifiers.clone(),
                env_vars: env_vars.clone(),
                internals: internals.clone(),
                success_criteria: criteria.clone(),
                chained: chained.clone(),
                chain: None,
                resolved: BTreeMap::new(),
            };
            if template {
                self.summary.templates += 1;
            } else {
                self.summary.generated += 1;
            }
            if repeats == 0 {
                out.push(named_experiment(experiment, None));
                continue;
            }
            self.summary.repeats += repeats;
            for index in 1..=repeats {
                let mut instance = named_experiment(experiment.clone(), Some(index));
                instance.repeat = Repeat::Instance { index };
                out.push(instance);
            }
            let mut base = named_experiment(experiment, None);
            base.repeat = Repeat::Base { count: repeats };
            base.chained = Vec::new();
            out.push(base);
        }
        Ok(out)
    }

    fn record_expansion_failure(&mut self, namespace: String, err: &ExpansionError) {
        warn!(%namespace, error = %err, "experiment expansion failed");
        self.summary.expansion_failures += 1;
        self.failures.push(ExperimentFailure {
            namespace,
            stage: "expansion".to_string(),
            message: err.to_string(),
        });
    }

    /// Resolves every variable of every experiment. Experiments referencing
    /// another experiment's variables (`{var in app.wl.exp}`) or inheriting
    /// from a chain root are resolved after their targets.
    pub fn resolve(&mut self, options: &GenerationOptions) {
        let (order, cycles) = reference_order(&self.experiments);
        let mut failed: BTreeMap<usize, ExpansionError> = BTreeMap::new();
        for (idx, path) in cycles {
            failed.insert(idx, ExpansionError::Cycle { path });
        }
        let mut resolved: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for idx in order {
            let exp = &mut self.experiments[idx];
            if let Some(link) = exp.chain.clone() {
                let mut missing = None;
                for (donor, names) in &link.inherit {
                    let Some(values) = resolved.get(donor) else {
                        missing = Some(donor.clone());
                        break;
                    };
                    for name in names {
                        if let Some(value) = values.get(name) {
                            exp.space
                                .define(Scope::Inherited, name.clone(), VarValue::Scalar(escape_braces(value)));
                        }
                    }
                }
                if let Some(donor) = missing {
                    failed.insert(
                        idx,
                        ExpansionError::Undefined {
                            name: donor,
                            expression: "inherit_variables".to_string(),
                        },
                    );
                    continue;
                }
            }
            let result = {
                let expander = Expander::new(&exp.space)
                    .strict(options.strict)
                    .max_depth(options.max_depth)
                    .with_lookup(&resolved);
                exp.space
                    .all_names()
                    .into_iter()
                    .map(|name| expander.expand_var(&name).map(|value| (name, value)))
                    .collect::<Result<BTreeMap<_, _>, _>>()
            };
            match result {
                Ok(values) => {
                    exp.resolved = values.clone();
                    resolved.insert(exp.namespace.clone(), values);
                }
                Err(err) => {
                    failed.insert(idx, err);
                }
            }
        }
        for (idx, err) in failed.iter().rev() {
            let exp = self.experiments.remove(*idx);
            self.record_expansion_failure(exp.namespace, err);
        }
    }

    /// Keeps experiments whose chain root satisfies every `where` clause
    /// and carries every requested tag. Chain members follow their root.
    pub fn apply_filter(&mut self, filter: &ExperimentFilter, options: &GenerationOptions) {
        if filter.is_empty() {
            return;
        }
        let lookup: BTreeMap<String, BTreeMap<String, String>> = self
            .experiments
            .iter()
            .map(|e| (e.namespace.clone(), e.resolved.clone()))
            .collect();
        let present: BTreeSet<&str> = self.experiments.iter().map(|e| e.namespace.as_str()).collect();
        let mut decisions: BTreeMap<String, Result<bool, ExpansionError>> = BTreeMap::new();
        for exp in &self.experiments {
            let decides = exp.chain.is_none() || !present.contains(exp.unit_root());
            if !decides {
                continue;
            }
            let decision = if !filter.tags.iter().all(|tag| exp.tags.contains(tag)) {
                Ok(false)
            } else {
                let expander = Expander::new(&exp.space)
                    .strict(options.strict)
                    .max_depth(options.max_depth)
                    .with_lookup(&lookup);
                filter
                    .where_clauses
                    .iter()
                    .try_fold(true, |acc, clause| -> Result<bool, ExpansionError> {
                        Ok(acc && expander.evaluate_bool(clause)?)
                    })
            };
            let key = if exp.chain.is_none() {
                exp.namespace.clone()
            } else {
                exp.unit_root().to_string()
            };
            decisions.entry(key).or_insert(decision);
        }

        let experiments = std::mem::take(&mut self.experiments);
        for exp in experiments {
            match decisions.get(exp.unit_root()) {
                Some(Ok(true)) => self.experiments.push(exp),
                Some(Ok(false)) | None => self.summary.filtered += 1,
                Some(Err(err)) => {
                    let err = err.clone();
                    self.record_expansion_failure(exp.namespace, &err);
                }
            }
        }
    }

    pub fn get(&self, namespace: &str) -> Option<&Experiment> {
        self.experiments.iter().find(|e| e.namespace == namespace)
    }

    /// Indices grouped into execution units: a chain root with its members
    /// in chain order, or a single unchained experiment.
    pub fn units(&self) -> Vec<Vec<usize>> {
        let mut units: Vec<Vec<usize>> = Vec::new();
        let mut current: Option<&str> = None;
        for (idx, exp) in self.experiments.iter().enumerate() {
            match (current, units.last_mut()) {
                (Some(root), Some(unit)) if root == exp.unit_root() => unit.push(idx),
                _ => units.push(vec![idx]),
            }
            current = Some(exp.unit_root());
        }
        units
    }
}

fn named_experiment(mut exp: Experiment, repeat: Option<usize>) -> Experiment {
    if let Some(index) = repeat {
        exp.name = format!("{}.{}", exp.name, index);
        exp.namespace = format!("{}.{}", exp.namespace, index);
    }
    exp.space.define(
        Scope::Generated,
        "experiment_name",
        VarValue::Scalar(exp.name.clone()),
    );
    exp.space.define(
        Scope::Generated,
        "experiment_namespace",
        VarValue::Scalar(exp.namespace.clone()),
    );
    exp.space.define(
        Scope::Generated,
        "repeat_index",
        VarValue::Scalar(repeat.unwrap_or(0).to_string()),
    );
    exp
}

fn repeat_count(space: &VariableSpace, options: &GenerationOptions) -> Result<usize, ExpansionError> {
    if !space.contains("n_repeats") {
        return Ok(0);
    }
    let text = Expander::new(space)
        .strict(options.strict)
        .max_depth(options.max_depth)
        .expand_var("n_repeats")?;
    text.trim().parse::<usize>().map_err(|_| ExpansionError::Type {
        expression: "{n_repeats}".to_string(),
        message: format!("expected a non-negative integer, got '{}'", text),
    })
}

fn escape_braces(text: &str) -> String {
    text.replace('{', "\\{").replace('}', "\\}")
}

/// Topological order of experiments by cross-experiment dependencies, ties
/// broken by position. Experiments on or behind a reference cycle are
/// returned separately with the cycle's namespaces.
fn reference_order(experiments: &[Experiment]) -> (Vec<usize>, Vec<(usize, Vec<String>)>) {
    let by_namespace: BTreeMap<&str, usize> = experiments
        .iter()
        .enumerate()
        .map(|(idx, e)| (e.namespace.as_str(), idx))
        .collect();
    let mut dependents: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); experiments.len()];
    let mut pending = vec![0usize; experiments.len()];
    for (idx, exp) in experiments.iter().enumerate() {
        let mut deps = BTreeSet::new();
        for value in exp.space.effective().values() {
            let texts: Vec<&str> = match value {
                VarValue::Scalar(s) => vec![s.as_str()],
                VarValue::List(items) => items.iter().map(|s| s.as_str()).collect(),
            };
            for text in texts {
                for reference in find_cross_references(text) {
                    if let Some(&target) = by_namespace.get(reference.namespace.as_str()) {
                        deps.insert(target);
                    }
                }
            }
        }
        if let Some(link) = &exp.chain {
            for (donor, _) in &link.inherit {
                if let Some(&target) = by_namespace.get(donor.as_str()) {
                    deps.insert(target);
                }
            }
        }
        deps.remove(&idx);
        pending[idx] = deps.len();
        for dep in deps {
            dependents[dep].insert(idx);
        }
    }

    let mut ready: BTreeSet<usize> = (0..experiments.len()).filter(|i| pending[*i] == 0).collect();
    let mut order = Vec::with_capacity(experiments.len());
    while let Some(idx) = ready.pop_first() {
        order.push(idx);
        for &next in &dependents[idx] {
            pending[next] -= 1;
            if pending[next] == 0 {
                ready.insert(next);
            }
        }
    }
    let stuck: Vec<usize> = (0..experiments.len()).filter(|i| pending[*i] > 0).collect();
    let path: Vec<String> = stuck
        .iter()
        .map(|idx| experiments[*idx].namespace.clone())
        .collect();
    let cycles = stuck.into_iter().map(|idx| (idx, path.clone())).collect();
    (order, cycles)
}
