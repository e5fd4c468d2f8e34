use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use bench_core::{
    atomic_write_bytes, atomic_write_json_pretty, ensure_dir, sha256_bytes, Expander, Scope,
    VarValue, VariableSpace,
};
use chrono::Utc;
use rayon::prelude::*;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::collaborators::{copy_dir_filtered, Collaborators, SoftwareConfig};
use crate::criteria::{evaluate_criteria, extract_foms, CriteriaContext, CriteriaReport, FomValue, HookRegistry};
use crate::definitions::{
    ApplicationDefinition, DefinitionLibrary, ObjectDefinition, WorkloadDefinition,
};
use crate::experiment::{Experiment, Repeat};
use crate::inventory::{ExperimentInventory, InventorySources, WorkspaceInventory};
use crate::phases::{filter_phases, PhaseGraph};
use crate::set::ExperimentSet;

pub const STATE_DIR: &str = ".bench";

pub const DEFAULT_EXECUTE_TEMPLATE: &str = "#!/bin/sh\ncd \"{experiment_run_dir}\"\n\n{command}\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    Setup,
    Execute,
    Analyze,
    Archive,
    Mirror,
}

impl PipelineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineKind::Setup => "setup",
            PipelineKind::Execute => "execute",
            PipelineKind::Analyze => "analyze",
            PipelineKind::Archive => "archive",
            PipelineKind::Mirror => "mirror",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub dry_run: bool,
    pub phase_filter: Option<String>,
    pub workers: usize,
    pub fail_fast: bool,
    /// Replaces `batch_submit` for the execute pipeline.
    pub executor: Option<String>,
    pub tar_archive: bool,
    pub mirror_dir: Option<PathBuf>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            phase_filter: None,
            workers: 1,
            fail_fast: false,
            executor: None,
            tar_archive: false,
            mirror_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExperimentStatus {
    Success,
    Failed,
    NotRun,
}

impl ExperimentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentStatus::Success => "SUCCESS",
            ExperimentStatus::Failed => "FAILED",
            ExperimentStatus::NotRun => "NOT_RUN",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExperimentReport {
    pub namespace: String,
    pub status: ExperimentStatus,
    pub phases: Vec<String>,
    pub failure_reasons: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub foms: Vec<FomValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub criteria: Option<CriteriaReport>,
}

impl ExperimentReport {
    fn not_run(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            status: ExperimentStatus::NotRun,
            phases: Vec::new(),
            failure_reasons: Vec::new(),
            foms: Vec::new(),
            criteria: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub pipeline: PipelineKind,
    pub dry_run: bool,
    pub started_at: String,
    pub finished_at: String,
    pub cancelled: bool,
    pub experiments: Vec<ExperimentReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive: Option<String>,
}

impl PipelineReport {
    pub fn counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for status in [
            ExperimentStatus::Success,
            ExperimentStatus::Failed,
            ExperimentStatus::NotRun,
        ] {
            counts.insert(status.as_str(), 0);
        }
        for report in &self.experiments {
            *counts.entry(report.status.as_str()).or_insert(0) += 1;
        }
        counts
    }

    pub fn success(&self) -> bool {
        self.experiments
            .iter()
            .all(|r| r.status != ExperimentStatus::Failed)
    }

    /// `namespace: reason` for every failed experiment.
    pub fn failure_reasons(&self) -> Vec<String> {
        self.experiments
            .iter()
            .flat_map(|r| {
                r.failure_reasons
                    .iter()
                    .map(move |reason| format!("{}: {}", r.namespace, reason))
            })
            .collect()
    }
}

pub struct PipelineContext<'a> {
    pub root: &'a Path,
    pub set: &'a ExperimentSet,
    pub library: &'a DefinitionLibrary,
    pub software: &'a SoftwareConfig,
    /// Template stem to template source.
    pub templates: &'a BTreeMap<String, String>,
    pub package_manager: Option<&'a str>,
    pub collaborators: &'a Collaborators,
    pub hooks: &'a HookRegistry,
    pub strict: bool,
    pub max_depth: usize,
}

fn definitions<'l>(
    library: &'l DefinitionLibrary,
    exp: &Experiment,
) -> Result<(&'l ApplicationDefinition, &'l WorkloadDefinition)> {
    let app = library
        .application(&exp.application)
        .ok_or_else(|| anyhow!("no definition for application '{}'", exp.application))?;
    let workload = app.workloads.get(&exp.workload).ok_or_else(|| {
        anyhow!(
            "application '{}' has no workload '{}'",
            exp.application,
            exp.workload
        )
    })?;
    Ok((app, workload))
}

fn path_of(exp: &Experiment, name: &str) -> Result<PathBuf> {
    exp.value(name)
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("variable '{}' is undefined or empty", name))
}

fn input_path(exp: &Experiment, input: &str) -> Result<PathBuf> {
    match exp.value(input).filter(|v| !v.is_empty()) {
        Some(path) => Ok(PathBuf::from(path)),
        None => Ok(path_of(exp, "workload_input_dir")?.join(input)),
    }
}

impl PipelineContext<'_> {
    pub fn inventory_sources(&self, exp: &Experiment) -> Result<InventorySources> {
        let (app, workload) = definitions(self.library, exp)?;
        let template: BTreeMap<&str, String> = self
            .templates
            .iter()
            .map(|(stem, source)| (stem.as_str(), sha256_bytes(source.as_bytes())))
            .collect();
        let inputs: BTreeMap<&str, Value> = workload
            .inputs
            .iter()
            .filter_map(|name| {
                app.inputs
                    .get(name)
                    .map(|i| (name.as_str(), json!({"url": i.url, "sha256": i.sha256})))
            })
            .collect();
        let env = self.software.environment(exp.value("env_name").unwrap_or_default());
        Ok(InventorySources {
            template: serde_json::to_value(template)?,
            inputs: serde_json::to_value(inputs)?,
            software: serde_json::to_value(env)?,
        })
    }

    /// Inventory of the current set, without touching the workspace.
    pub fn inventory(&self) -> Result<WorkspaceInventory> {
        let entries = self
            .set
            .experiments
            .iter()
            .map(|exp| ExperimentInventory::build(exp, &self.inventory_sources(exp)?))
            .collect::<Result<Vec<_>>>()?;
        Ok(WorkspaceInventory::new(entries))
    }
}

#[derive(Debug)]
struct OperationLock {
    path: PathBuf,
}

impl Drop for OperationLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn acquire_operation_lock(state_dir: &Path) -> Result<OperationLock> {
    ensure_dir(state_dir)?;
    let lock_path = state_dir.join("operation.lock");
    match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&lock_path)
    {
        Ok(mut file) => {
            let payload = format!(
                "{{\"pid\":{},\"acquired_at\":\"{}\"}}\n",
                std::process::id(),
                Utc::now().to_rfc3339()
            );
            let _ = file.write_all(payload.as_bytes());
            let _ = file.sync_all();
            Ok(OperationLock { path: lock_path })
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(anyhow!(
            "operation_in_progress: another pipeline holds {}",
            lock_path.display()
        )),
        Err(e) => Err(e.into()),
    }
}

fn write_run_state(state_dir: &Path, pipeline: &str, status: &str) -> Result<()> {
    let payload = json!({
        "schema_version": "bench_run_state_v1",
        "pipeline": pipeline,
        "status": status,
        "pid": std::process::id(),
        "updated_at": Utc::now().to_rfc3339(),
    });
    atomic_write_json_pretty(&state_dir.join("run_state.json"), &payload)
}

struct RunStateGuard {
    state_dir: PathBuf,
    pipeline: String,
    done: bool,
}

impl RunStateGuard {
    fn new(state_dir: &Path, pipeline: &str) -> Self {
        Self {
            state_dir: state_dir.to_path_buf(),
            pipeline: pipeline.to_string(),
            done: false,
        }
    }

    fn complete(&mut self, status: &str) -> Result<()> {
        write_run_state(&self.state_dir, &self.pipeline, status)?;
        self.done = true;
        Ok(())
    }
}

impl Drop for RunStateGuard {
    fn drop(&mut self) {
        if !self.done {
            let _ = write_run_state(&self.state_dir, &self.pipeline, "failed");
        }
    }
}

fn locked<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| anyhow!("lock poisoned by a panicked worker"))
}

#[derive(Default)]
struct KeyedLocks {
    locks: Mutex<BTreeMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    fn get(&self, key: &str) -> Result<Arc<Mutex<()>>> {
        let mut locks = locked(&self.locks)?;
        Ok(locks.entry(key.to_string()).or_default().clone())
    }
}

#[derive(Debug, Clone)]
struct PlannedPhase {
    name: String,
    command: Option<String>,
}

struct Runtime<'a> {
    ctx: &'a PipelineContext<'a>,
    kind: PipelineKind,
    options: &'a PipelineOptions,
    lookup: BTreeMap<String, BTreeMap<String, String>>,
    cancel: AtomicBool,
    env_locks: KeyedLocks,
    path_locks: KeyedLocks,
    environments: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
    inventories: Mutex<Vec<ExperimentInventory>>,
    archive_dir: Option<PathBuf>,
}

impl<'a> Runtime<'a> {
    fn new(
        ctx: &'a PipelineContext<'a>,
        kind: PipelineKind,
        options: &'a PipelineOptions,
        archive_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            ctx,
            kind,
            options,
            lookup: ctx
                .set
                .experiments
                .iter()
                .map(|e| (e.namespace.clone(), e.resolved.clone()))
                .collect(),
            cancel: AtomicBool::new(false),
            env_locks: KeyedLocks::default(),
            path_locks: KeyedLocks::default(),
            environments: Mutex::new(BTreeMap::new()),
            inventories: Mutex::new(Vec::new()),
            archive_dir,
        }
    }

    fn plan(&self, exp: &Experiment) -> Result<Vec<PlannedPhase>> {
        let (app, _) = definitions(self.ctx.library, exp)?;
        let mut objects: Vec<&dyn ObjectDefinition> = vec![app];
        for modifier in &exp.modifiers {
            let definition = self
                .ctx
                .library
                .modifier(&modifier.name)
                .ok_or_else(|| anyhow!("no definition for modifier '{}'", modifier.name))?;
            objects.push(definition);
        }
        if let Some(name) = self.ctx.package_manager {
            if let Some(definition) = self.ctx.library.package_manager(name) {
                objects.push(definition);
            }
        }
        let mut graph = PhaseGraph::new();
        for object in objects {
            for spec in object.phases() {
                graph.register(object.name(), &spec);
            }
        }
        let order = filter_phases(
            graph.order(self.kind.as_str())?,
            self.options.phase_filter.as_deref(),
        )?;
        Ok(order
            .into_iter()
            .map(|r| PlannedPhase {
                name: r.name.clone(),
                command: r.command.clone(),
            })
            .collect())
    }

    fn expand(&self, space: &VariableSpace, text: &str) -> Result<String> {
        Ok(Expander::new(space)
            .strict(self.ctx.strict)
            .max_depth(self.ctx.max_depth)
            .with_lookup(&self.lookup)
            .expand(text)?)
    }

    fn package_paths(&self, exp: &Experiment) -> Result<BTreeMap<String, String>> {
        let env_name = exp.value("env_name").unwrap_or_default();
        if let Some(paths) = locked(&self.environments)?.get(env_name) {
            return Ok(paths.clone());
        }
        let root = path_of(exp, "software_dir")?;
        Ok(self
            .ctx
            .software
            .environment(env_name)
            .packages
            .iter()
            .map(|p| (p.name.clone(), root.join(&p.name).to_string_lossy().to_string()))
            .collect())
    }

    /// The experiment's variables plus `<package>_path` for its software
    /// environment.
    fn render_space(&self, exp: &Experiment) -> Result<VariableSpace> {
        let mut space = exp.space.clone();
        for (package, path) in self.package_paths(exp)? {
            space.define(
                Scope::Generated,
                format!("{}_path", package),
                VarValue::Scalar(path),
            );
        }
        Ok(space)
    }

    fn run_unit(&self, unit: &[usize], plans: &[Vec<PlannedPhase>]) -> Vec<ExperimentReport> {
        let mut reports = Vec::with_capacity(unit.len());
        let mut blocked = false;
        for &idx in unit {
            let exp = &self.ctx.set.experiments[idx];
            let mut report = ExperimentReport::not_run(&exp.namespace);
            if blocked || self.cancel.load(Ordering::SeqCst) {
                debug!(namespace = %exp.namespace, "not run");
                reports.push(report);
                continue;
            }
            self.run_experiment(exp, &plans[idx], &mut report);
            info!(namespace = %exp.namespace, status = report.status.as_str(), "experiment finished");
            if report.status == ExperimentStatus::Failed {
                if self.kind != PipelineKind::Analyze {
                    blocked = true;
                }
                if self.options.fail_fast && !self.cancel.swap(true, Ordering::SeqCst) {
                    warn!(namespace = %exp.namespace, "fail-fast: cancelling remaining experiments");
                }
            }
            reports.push(report);
        }
        reports
    }

    fn run_experiment(&self, exp: &Experiment, plan: &[PlannedPhase], report: &mut ExperimentReport) {
        if exp.is_repeat_base() && self.kind != PipelineKind::Analyze {
            debug!(namespace = %exp.namespace, "repeat base only aggregates");
            return;
        }
        for phase in plan {
            if self.cancel.load(Ordering::SeqCst) {
                debug!(namespace = %exp.namespace, phase = %phase.name, "cancelled before phase");
                return;
            }
            debug!(namespace = %exp.namespace, phase = %phase.name, "phase start");
            match self.run_phase(exp, phase, report) {
                Ok(()) => report.phases.push(phase.name.clone()),
                Err(err) => {
                    warn!(namespace = %exp.namespace, phase = %phase.name, error = %format!("{:#}", err), "phase failed");
                    report.status = ExperimentStatus::Failed;
                    report
                        .failure_reasons
                        .push(format!("{}: {:#}", phase.name, err));
                    return;
                }
            }
        }
        if report.status == ExperimentStatus::NotRun {
            report.status = ExperimentStatus::Success;
        }
    }

    fn run_phase(&self, exp: &Experiment, phase: &PlannedPhase, report: &mut ExperimentReport) -> Result<()> {
        let command = phase.command.as_deref();
        match phase.name.as_str() {
            "get_inputs" => self.get_inputs(exp)?,
            "software_create_env" => return self.software_create_env(exp, command),
            "make_experiments" => self.make_experiments(exp)?,
            "write_inventory" => self.write_inventory(exp)?,
            "submit_experiment" => self.submit_experiment(exp)?,
            "analyze_experiments" => self.analyze_experiment(exp, report)?,
            "archive_experiments" => self.archive_experiment(exp)?,
            "mirror_inputs" => self.mirror_inputs(exp)?,
            other if command.is_none() => {
                debug!(phase = other, "phase has no handler and no command");
            }
            _ => {}
        }
        if let Some(command) = command {
            self.run_phase_command(exp, &phase.name, command)?;
        }
        Ok(())
    }

    fn run_command(&self, exp: &Experiment, command: &str, cwd: &Path, log: &Path) -> Result<()> {
        if self.options.dry_run {
            info!(namespace = %exp.namespace, %command, "dry run: command not executed");
            return Ok(());
        }
        ensure_dir(cwd)?;
        let outcome = self.ctx.collaborators.runner.run(command, cwd, Some(log))?;
        if !outcome.success {
            return Err(anyhow!(
                "command exited with status {}{}",
                outcome.status,
                if outcome.stderr_tail.is_empty() {
                    String::new()
                } else {
                    format!(": {}", outcome.stderr_tail)
                }
            ));
        }
        Ok(())
    }

    fn run_phase_command(&self, exp: &Experiment, phase: &str, template: &str) -> Result<()> {
        let command = self.expand(&self.render_space(exp)?, template)?;
        let log = path_of(exp, "log_dir")?.join(format!("{}.{}.log", exp.namespace, phase));
        self.run_command(exp, &command, &path_of(exp, "experiment_run_dir")?, &log)
    }

    fn get_inputs(&self, exp: &Experiment) -> Result<()> {
        let (app, workload) = definitions(self.ctx.library, exp)?;
        for name in &workload.inputs {
            let input = app.inputs.get(name).ok_or_else(|| {
                anyhow!("workload '{}' names unknown input '{}'", workload.name, name)
            })?;
            let url = self.expand(&exp.space, &input.url)?;
            let dest = input_path(exp, name)?;
            if self.options.dry_run {
                info!(input = %name, %url, dest = %dest.display(), "dry run: input not fetched");
                continue;
            }
            let lock = self.path_locks.get(&dest.to_string_lossy())?;
            let _held = locked(&lock)?;
            self.ctx
                .collaborators
                .fetcher
                .fetch(input, &url, &dest)
                .with_context(|| format!("input '{}'", name))?;
        }
        Ok(())
    }

    /// Creates each software environment once per run. Experiments sharing
    /// an environment wait on the same lock.
    fn software_create_env(&self, exp: &Experiment, command: Option<&str>) -> Result<()> {
        let env_name = exp
            .value("env_name")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| anyhow!("variable 'env_name' is undefined or empty"))?
            .to_string();
        let lock = self.env_locks.get(&env_name)?;
        let _held = locked(&lock)?;
        if locked(&self.environments)?.contains_key(&env_name) {
            debug!(env = %env_name, "software environment already created");
            return Ok(());
        }
        let root = path_of(exp, "software_dir")?;
        let env = self.ctx.software.environment(&env_name);
        let paths = if self.options.dry_run {
            info!(env = %env_name, "dry run: software environment not created");
            self.package_paths(exp)?
        } else {
            info!(env = %env_name, packages = env.packages.len(), "creating software environment");
            self.ctx
                .collaborators
                .package_manager
                .create_env(&env, &root)
                .with_context(|| format!("software environment '{}'", env_name))?
        };
        if let Some(command) = command {
            self.run_phase_command(exp, "software_create_env", command)?;
        }
        locked(&self.environments)?.insert(env_name, paths);
        Ok(())
    }

    fn make_experiments(&self, exp: &Experiment) -> Result<()> {
        for required in ["mpi_command", "batch_submit"] {
            if exp.value(required).map(str::trim).unwrap_or_default().is_empty() {
                return Err(anyhow!(
                    "variable '{}' must expand to a non-empty string",
                    required
                ));
            }
        }
        let run_dir = path_of(exp, "experiment_run_dir")?;
        ensure_dir(&run_dir)?;
        let space = self.render_space(exp)?;
        for (stem, source) in self.ctx.templates {
            let target = exp
                .value(stem)
                .map(PathBuf::from)
                .unwrap_or_else(|| run_dir.join(stem));
            let rendered = self
                .expand(&space, source)
                .with_context(|| format!("template '{}'", stem))?;
            atomic_write_bytes(&target, rendered.as_bytes())?;
            make_executable(&target)?;
            debug!(namespace = %exp.namespace, template = %target.display(), "rendered template");
        }
        Ok(())
    }

    fn write_inventory(&self, exp: &Experiment) -> Result<()> {
        let inventory = ExperimentInventory::build(exp, &self.ctx.inventory_sources(exp)?)?;
        let run_dir = path_of(exp, "experiment_run_dir")?;
        ensure_dir(&run_dir)?;
        inventory.write(&run_dir)?;
        locked(&self.inventories)?.push(inventory);
        Ok(())
    }

    fn submit_experiment(&self, exp: &Experiment) -> Result<()> {
        let command = match (&exp.chain, &self.options.executor) {
            (Some(_), _) => exp.value("chain_command").unwrap_or_default().to_string(),
            (None, Some(executor)) => self.expand(&exp.space, executor)?,
            (None, None) => exp.value("batch_submit").unwrap_or_default().to_string(),
        };
        if command.trim().is_empty() {
            return Err(anyhow!("nothing to submit: the submit command is empty"));
        }
        let log = path_of(exp, "log_dir")?.join(format!("{}.submit.log", exp.namespace));
        info!(namespace = %exp.namespace, "submitting experiment");
        self.run_command(exp, &command, &path_of(exp, "experiment_run_dir")?, &log)
    }

    fn analyze_experiment(&self, exp: &Experiment, report: &mut ExperimentReport) -> Result<()> {
        if exp.is_repeat_base() {
            return Ok(());
        }
        let (app, _) = definitions(self.ctx.library, exp)?;
        let mut objects: Vec<&dyn ObjectDefinition> = vec![app];
        for modifier in &exp.modifiers {
            if let Some(definition) = self.ctx.library.modifier(&modifier.name) {
                objects.push(definition);
            }
        }
        let mut foms = Vec::new();
        let mut contexts = Vec::new();
        let mut criteria = Vec::new();
        for object in objects {
            foms.extend(object.figures_of_merit().iter().cloned());
            contexts.extend(object.fom_contexts().iter().cloned());
            criteria.extend(object.success_criteria().iter().cloned());
        }
        criteria.extend(exp.success_criteria.iter().cloned());

        let expander = Expander::new(&exp.space)
            .strict(self.ctx.strict)
            .max_depth(self.ctx.max_depth)
            .with_lookup(&self.lookup);
        let values = extract_foms(&foms, &contexts, &expander)?;
        let outcome = evaluate_criteria(
            &criteria,
            &CriteriaContext {
                namespace: &exp.namespace,
                space: &exp.space,
                variables: &exp.resolved,
                foms: &values,
                hooks: self.ctx.hooks,
                max_depth: self.ctx.max_depth,
            },
        );
        if !outcome.success() {
            report.status = ExperimentStatus::Failed;
            report.failure_reasons.extend(outcome.failure_reasons());
        }
        report.foms = values;
        report.criteria = Some(outcome);
        Ok(())
    }

    fn archive_experiment(&self, exp: &Experiment) -> Result<()> {
        let archive = self
            .archive_dir
            .as_ref()
            .ok_or_else(|| anyhow!("archive directory was not prepared"))?;
        let run_dir = path_of(exp, "experiment_run_dir")?;
        if !run_dir.exists() {
            debug!(namespace = %exp.namespace, "nothing to archive");
            return Ok(());
        }
        let relative = run_dir
            .strip_prefix(self.ctx.root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| {
                Path::new("experiments")
                    .join(&exp.application)
                    .join(&exp.workload)
                    .join(&exp.name)
            });
        if self.options.dry_run {
            info!(namespace = %exp.namespace, "dry run: run directory not archived");
            return Ok(());
        }
        copy_dir_filtered(&run_dir, &archive.join(relative), &[])
    }

    fn mirror_inputs(&self, exp: &Experiment) -> Result<()> {
        let mirror = self
            .options
            .mirror_dir
            .as_ref()
            .ok_or_else(|| anyhow!("no mirror directory given"))?;
        let (_, workload) = definitions(self.ctx.library, exp)?;
        let inputs_root = self.ctx.root.join("inputs");
        for name in &workload.inputs {
            let source = input_path(exp, name)?;
            if !source.exists() {
                warn!(input = %name, path = %source.display(), "input not staged; run setup first");
                continue;
            }
            let relative = source
                .strip_prefix(&inputs_root)
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| Path::new(&exp.application).join(&exp.workload).join(name));
            let target = mirror.join(relative);
            let lock = self.path_locks.get(&target.to_string_lossy())?;
            let _held = locked(&lock)?;
            if target.exists() {
                continue;
            }
            if self.options.dry_run {
                info!(input = %name, target = %target.display(), "dry run: input not mirrored");
                continue;
            }
            if source.is_dir() {
                copy_dir_filtered(&source, &target, &[])?;
            } else {
                if let Some(parent) = target.parent() {
                    ensure_dir(parent)?;
                }
                fs::copy(&source, &target)
                    .with_context(|| format!("failed to mirror {}", source.display()))?;
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

fn format_stat(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

/// Fills in repeat base experiments from their instances: the base
/// succeeds iff every instance succeeded, and numeric figures of merit get
/// `_min`, `_max` and `_mean` summaries per context.
fn aggregate_repeats(experiments: &[Experiment], reports: &mut [ExperimentReport]) {
    let by_namespace: BTreeMap<String, usize> = reports
        .iter()
        .enumerate()
        .map(|(idx, r)| (r.namespace.clone(), idx))
        .collect();
    for exp in experiments {
        let Repeat::Base { count } = exp.repeat else {
            continue;
        };
        let Some(&base_idx) = by_namespace.get(&exp.namespace) else {
            continue;
        };
        let instances: Vec<&ExperimentReport> = (1..=count)
            .filter_map(|i| by_namespace.get(&format!("{}.{}", exp.namespace, i)))
            .map(|&idx| &reports[idx])
            .collect();

        let mut reasons = Vec::new();
        let mut groups: BTreeMap<(String, String), (FomValue, Vec<f64>)> = BTreeMap::new();
        for instance in &instances {
            if instance.status != ExperimentStatus::Success {
                reasons.push(format!(
                    "repeat {} is {}",
                    instance.namespace,
                    instance.status.as_str()
                ));
            }
            for fom in &instance.foms {
                let Ok(number) = fom.value.trim().parse::<f64>() else {
                    continue;
                };
                groups
                    .entry((fom.context_label().to_string(), fom.name.clone()))
                    .or_insert_with(|| (fom.clone(), Vec::new()))
                    .1
                    .push(number);
            }
        }
        let mut foms = Vec::new();
        for (template, values) in groups.into_values() {
            let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let mean = values.iter().sum::<f64>() / values.len() as f64;
            for (suffix, value) in [("min", min), ("max", max), ("mean", mean)] {
                foms.push(FomValue {
                    name: format!("{}_{}", template.name, suffix),
                    value: format_stat(value),
                    units: template.units.clone(),
                    context: template.context.clone(),
                });
            }
        }

        let no_instances = instances.is_empty();
        let base = &mut reports[base_idx];
        base.foms = foms;
        base.failure_reasons = reasons;
        base.status = if no_instances {
            ExperimentStatus::NotRun
        } else if base.failure_reasons.is_empty() {
            ExperimentStatus::Success
        } else {
            ExperimentStatus::Failed
        };
    }
}

fn write_results(root: &Path, reports: &[ExperimentReport]) -> Result<()> {
    let experiments: Vec<Value> = reports
        .iter()
        .map(|r| {
            let mut contexts: BTreeMap<&str, Vec<Value>> = BTreeMap::new();
            for fom in &r.foms {
                contexts.entry(fom.context_label()).or_default().push(json!({
                    "name": fom.name,
                    "value": fom.value,
                    "units": fom.units,
                }));
            }
            json!({
                "namespace": r.namespace,
                "status": r.status,
                "failure_reasons": r.failure_reasons,
                "contexts": contexts,
            })
        })
        .collect();
    let payload = json!({
        "schema_version": "bench_results_v1",
        "generated_at": Utc::now().to_rfc3339(),
        "experiments": experiments,
    });
    atomic_write_json_pretty(&root.join("results.json"), &payload)?;

    let mut text = String::new();
    for r in reports {
        text.push_str(&format!("{}: {}\n", r.namespace, r.status.as_str()));
        for reason in &r.failure_reasons {
            text.push_str(&format!("  failure: {}\n", reason));
        }
        for fom in &r.foms {
            text.push_str(&format!(
                "  [{}] {} = {} {}\n",
                fom.context_label(),
                fom.name,
                fom.value,
                fom.units
            ));
        }
    }
    atomic_write_bytes(&root.join("results.txt"), text.trim_end_matches(' ').as_bytes())
}

fn zip_dir(src: &Path, out: &Path) -> Result<()> {
    let file = fs::File::create(out).with_context(|| format!("failed to create {}", out.display()))?;
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    for entry in walkdir::WalkDir::new(src).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(src)?;
        let name = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join("/");
        writer.start_file(name, options)?;
        writer.write_all(&fs::read(entry.path())?)?;
    }
    writer.finish()?;
    Ok(())
}

pub fn run_pipeline(
    ctx: &PipelineContext<'_>,
    kind: PipelineKind,
    options: &PipelineOptions,
) -> Result<PipelineReport> {
    let state_dir = ctx.root.join(STATE_DIR);
    let _lock = acquire_operation_lock(&state_dir)?;
    let mut guard = RunStateGuard::new(&state_dir, kind.as_str());
    write_run_state(&state_dir, kind.as_str(), "running")?;
    let started_at = Utc::now().to_rfc3339();

    let archive_dir = if kind == PipelineKind::Archive {
        let stamp = Utc::now().format("%Y-%m-%d_%H.%M.%S").to_string();
        let dir = ctx.root.join("archive").join(&stamp);
        let configs = ctx.root.join("configs");
        if !options.dry_run {
            ensure_dir(&dir)?;
            if configs.is_dir() {
                copy_dir_filtered(&configs, &dir.join("configs"), &[])?;
            }
        }
        Some(dir)
    } else {
        None
    };

    let runtime = Runtime::new(ctx, kind, options, archive_dir.clone());
    let plans = ctx
        .set
        .experiments
        .iter()
        .map(|exp| {
            runtime
                .plan(exp)
                .with_context(|| format!("phase order for {}", exp.namespace))
        })
        .collect::<Result<Vec<_>>>()?;
    let units = ctx.set.units();
    info!(
        pipeline = kind.as_str(),
        experiments = ctx.set.experiments.len(),
        units = units.len(),
        workers = options.workers.max(1),
        dry_run = options.dry_run,
        "pipeline start"
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.workers.max(1))
        .build()?;
    let per_unit: Vec<Vec<ExperimentReport>> = pool.install(|| {
        units
            .par_iter()
            .map(|unit| runtime.run_unit(unit, &plans))
            .collect()
    });
    let mut experiments: Vec<ExperimentReport> = per_unit.into_iter().flatten().collect();

    match kind {
        PipelineKind::Setup => {
            let entries = std::mem::take(&mut *locked(&runtime.inventories)?);
            if !entries.is_empty() {
                let path = state_dir.join("inventory.json");
                if path.exists() {
                    fs::copy(&path, state_dir.join("inventory.prev.json"))?;
                }
                WorkspaceInventory::new(entries).write(&path)?;
            }
        }
        PipelineKind::Analyze => {
            aggregate_repeats(&ctx.set.experiments, &mut experiments);
            write_results(ctx.root, &experiments)?;
        }
        PipelineKind::Archive => {
            if let Some(dir) = archive_dir.as_ref().filter(|_| options.tar_archive && !options.dry_run) {
                let stamp = dir.file_name().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
                let out = ctx.root.join("archive").join(format!("{}.zip", stamp));
                zip_dir(dir, &out)?;
                info!(archive = %out.display(), "wrote archive");
            }
        }
        PipelineKind::Execute | PipelineKind::Mirror => {}
    }

    let report = PipelineReport {
        pipeline: kind,
        dry_run: options.dry_run,
        started_at,
        finished_at: Utc::now().to_rfc3339(),
        cancelled: runtime.cancel.load(Ordering::SeqCst),
        experiments,
        archive: archive_dir.map(|d| d.to_string_lossy().to_string()),
    };
    let counts = report.counts();
    info!(
        pipeline = kind.as_str(),
        success = counts["SUCCESS"],
        failed = counts["FAILED"],
        not_run = counts["NOT_RUN"],
        "pipeline finished"
    );
    guard.complete(if report.success() { "completed" } else { "completed_with_failures" })?;
    Ok(report)
}
