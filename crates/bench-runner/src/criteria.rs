use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use bench_core::{CriteriaError, Expander, ExpansionError, Scope, Value, VarValue, VariableSpace};
use globset::{Glob, GlobMatcher};
use regex::Regex;
use serde::Serialize;

use crate::definitions::{CriterionMode, FigureOfMerit, FomContext, SuccessCriterion};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextValue {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FomValue {
    pub name: String,
    pub value: String,
    pub units: String,
    pub context: Option<ContextValue>,
}

impl FomValue {
    pub fn context_label(&self) -> &str {
        self.context
            .as_ref()
            .map(|c| c.value.as_str())
            .unwrap_or("null")
    }
}

struct CompiledContext<'a> {
    spec: &'a FomContext,
    regex: Regex,
}

fn compile(name: &str, pattern: &str) -> Result<Regex, CriteriaError> {
    Regex::new(pattern).map_err(|e| CriteriaError::InvalidPattern {
        criterion: name.to_string(),
        pattern: pattern.to_string(),
        message: e.to_string(),
    })
}

fn captures_space(regex: &Regex, caps: &regex::Captures<'_>) -> VariableSpace {
    let mut space = VariableSpace::new();
    for name in regex.capture_names().flatten() {
        if let Some(m) = caps.name(name) {
            space.define(Scope::Generated, name, VarValue::scalar(m.as_str()));
        }
    }
    space
}

/// Log text with invalid UTF-8 replaced; `None` when the file does not exist.
fn read_log(criterion: &str, path: &str) -> Result<Option<String>, CriteriaError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CriteriaError::Read {
            criterion: criterion.to_string(),
            path: path.to_string(),
            message: e.to_string(),
        }),
    }
}

/// Scans each figure of merit's log file line by line. A context line
/// updates the active value of that context; a figure line yields one
/// value tagged with the first of its contexts that is active.
pub fn extract_foms(
    foms: &[FigureOfMerit],
    contexts: &[FomContext],
    expander: &Expander<'_>,
) -> Result<Vec<FomValue>, CriteriaError> {
    let compiled_contexts = contexts
        .iter()
        .map(|spec| {
            compile(&spec.name, &spec.regex).map(|regex| CompiledContext { spec, regex })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut by_file: BTreeMap<String, Vec<(&FigureOfMerit, Regex)>> = BTreeMap::new();
    for fom in foms {
        let path = expander
            .expand(&fom.log_file)
            .map_err(|source| CriteriaError::Formula {
                criterion: fom.name.clone(),
                source,
            })?;
        let regex = compile(&fom.name, &fom.fom_regex)?;
        by_file.entry(path).or_default().push((fom, regex));
    }

    let mut out = Vec::new();
    for (path, file_foms) in by_file {
        let label = file_foms
            .iter()
            .map(|(fom, _)| fom.name.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let Some(contents) = read_log(&label, &path)? else {
            continue;
        };
        let mut active: BTreeMap<&str, String> = BTreeMap::new();
        for line in contents.lines() {
            for ctx in &compiled_contexts {
                if let Some(caps) = ctx.regex.captures(line) {
                    let space = captures_space(&ctx.regex, &caps);
                    let label = Expander::new(&space)
                        .expand(&ctx.spec.output_format)
                        .unwrap_or_else(|_| ctx.spec.output_format.clone());
                    active.insert(ctx.spec.name.as_str(), label);
                }
            }
            for (fom, regex) in &file_foms {
                let Some(caps) = regex.captures(line) else {
                    continue;
                };
                let Some(value) = caps.name(&fom.group_name) else {
                    continue;
                };
                let context = fom.contexts.iter().find_map(|name| {
                    active.get(name.as_str()).map(|value| ContextValue {
                        name: name.clone(),
                        value: value.clone(),
                    })
                });
                out.push(FomValue {
                    name: fom.name.clone(),
                    value: value.as_str().to_string(),
                    units: fom.units.clone(),
                    context,
                });
            }
        }
    }
    Ok(out)
}

pub struct HookInput<'a> {
    pub namespace: &'a str,
    pub criterion: &'a str,
    pub variables: &'a BTreeMap<String, String>,
    pub foms: &'a [FomValue],
}

pub type HookFn = dyn Fn(&HookInput<'_>) -> bool + Send + Sync;

#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: BTreeMap<String, Arc<HookFn>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, hook: F)
    where
        F: Fn(&HookInput<'_>) -> bool + Send + Sync + 'static,
    {
        self.hooks.insert(name.into(), Arc::new(hook));
    }

    pub fn get(&self, name: &str) -> Option<&Arc<HookFn>> {
        self.hooks.get(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CriterionOutcome {
    Passed,
    Failed { reason: String },
    Skipped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CriterionResult {
    pub name: String,
    #[serde(flatten)]
    pub outcome: CriterionOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CriteriaReport {
    pub results: Vec<CriterionResult>,
}

impl CriteriaReport {
    pub fn success(&self) -> bool {
        !self
            .results
            .iter()
            .any(|r| matches!(r.outcome, CriterionOutcome::Failed { .. }))
    }

    pub fn failure_reasons(&self) -> Vec<String> {
        self.results
            .iter()
            .filter_map(|r| match &r.outcome {
                CriterionOutcome::Failed { reason } => Some(format!("{}: {}", r.name, reason)),
                _ => None,
            })
            .collect()
    }
}

pub struct CriteriaContext<'a> {
    pub namespace: &'a str,
    pub space: &'a VariableSpace,
    pub variables: &'a BTreeMap<String, String>,
    pub foms: &'a [FomValue],
    pub hooks: &'a HookRegistry,
    pub max_depth: usize,
}

fn glob(criterion: &str, pattern: &str) -> Result<GlobMatcher, CriteriaError> {
    Glob::new(pattern)
        .map(|g| g.compile_matcher())
        .map_err(|e| CriteriaError::InvalidPattern {
            criterion: criterion.to_string(),
            pattern: pattern.to_string(),
            message: e.to_string(),
        })
}

fn failed(err: impl ToString) -> CriterionOutcome {
    CriterionOutcome::Failed {
        reason: err.to_string(),
    }
}

fn string_match(
    criterion: &SuccessCriterion,
    pattern: &str,
    file: &str,
    ctx: &CriteriaContext<'_>,
) -> Result<CriterionOutcome, CriteriaError> {
    let path = Expander::new(ctx.space)
        .max_depth(ctx.max_depth)
        .expand(file)
        .map_err(|source| CriteriaError::Formula {
            criterion: criterion.name.clone(),
            source,
        })?;
    if !Path::new(&path).is_file() {
        let missing = CriteriaError::MissingFile {
            criterion: criterion.name.clone(),
            path,
        };
        return Ok(if criterion.required {
            failed(missing)
        } else {
            CriterionOutcome::Skipped {
                reason: missing.to_string(),
            }
        });
    }
    let regex = compile(&criterion.name, pattern)?;
    let contents = read_log(&criterion.name, &path)?.unwrap_or_default();
    if contents.lines().any(|line| regex.is_match(line)) {
        Ok(CriterionOutcome::Passed)
    } else {
        Ok(failed(format!("no line of {} matches '{}'", path, pattern)))
    }
}

fn formula(
    criterion: &SuccessCriterion,
    fom_name: &str,
    fom_context: &str,
    formula: &str,
    ctx: &CriteriaContext<'_>,
) -> Result<CriterionOutcome, CriteriaError> {
    let name_glob = glob(&criterion.name, fom_name)?;
    let context_glob = glob(&criterion.name, fom_context)?;
    let selected: Vec<&FomValue> = ctx
        .foms
        .iter()
        .filter(|fom| name_glob.is_match(&fom.name))
        .filter(|fom| {
            context_glob.is_match(fom.context_label())
                || fom
                    .context
                    .as_ref()
                    .map(|c| context_glob.is_match(&c.name))
                    .unwrap_or(false)
        })
        .collect();
    if selected.is_empty() {
        let missing = CriteriaError::MissingFigureOfMerit {
            criterion: criterion.name.clone(),
            fom: fom_name.to_string(),
        };
        return Ok(if criterion.required {
            failed(missing)
        } else {
            CriterionOutcome::Skipped {
                reason: missing.to_string(),
            }
        });
    }
    for fom in selected {
        let mut space = ctx.space.clone();
        space.define(Scope::Generated, "value", VarValue::scalar(fom.value.clone()));
        let bindings = BTreeMap::from([("value".to_string(), Value::from_text(&fom.value))]);
        let expander = Expander::new(&space).max_depth(ctx.max_depth);
        let outcome = expander
            .evaluate_with(formula, &bindings)
            .and_then(|value| match value {
                Value::Bool(b) => Ok(b),
                other => Err(ExpansionError::Type {
                    expression: formula.to_string(),
                    message: format!("expected a boolean, got '{}'", other),
                }),
            })
            .map_err(|source| CriteriaError::Formula {
                criterion: criterion.name.clone(),
                source,
            })?;
        if !outcome {
            return Ok(failed(format!(
                "'{}' is false for {} = {}",
                formula, fom.name, fom.value
            )));
        }
    }
    Ok(CriterionOutcome::Passed)
}

/// Evaluates every criterion. Errors become failures of the criterion
/// they belong to.
pub fn evaluate_criteria(criteria: &[SuccessCriterion], ctx: &CriteriaContext<'_>) -> CriteriaReport {
    let results = criteria
        .iter()
        .map(|criterion| {
            let outcome = match &criterion.mode {
                CriterionMode::StringMatch { pattern, file } => {
                    string_match(criterion, pattern, file, ctx)
                }
                CriterionMode::Formula {
                    fom_name,
                    fom_context,
                    formula: text,
                } => formula(criterion, fom_name, fom_context, text, ctx),
                CriterionMode::Hook { hook } => Ok(match ctx.hooks.get(hook) {
                    Some(predicate) => {
                        let input = HookInput {
                            namespace: ctx.namespace,
                            criterion: &criterion.name,
                            variables: ctx.variables,
                            foms: ctx.foms,
                        };
                        if predicate(&input) {
                            CriterionOutcome::Passed
                        } else {
                            failed(format!("hook '{}' rejected the experiment", hook))
                        }
                    }
                    None => failed(format!("no hook registered as '{}'", hook)),
                }),
            };
            CriterionResult {
                name: criterion.name.clone(),
                outcome: outcome.unwrap_or_else(failed),
            }
        })
        .collect();
    CriteriaReport { results }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::path::PathBuf;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "bench_criteria_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("temp dir");
        dir
    }

    fn space_with_log(path: &Path) -> VariableSpace {
        let mut space = VariableSpace::new();
        space.define(
            Scope::Generated,
            "log_file",
            VarValue::scalar(path.to_string_lossy().to_string()),
        );
        space
    }

    fn fom(name: &str, regex: &str, group: &str, contexts: &[&str]) -> FigureOfMerit {
        FigureOfMerit {
            name: name.to_string(),
            log_file: "{log_file}".to_string(),
            fom_regex: regex.to_string(),
            group_name: group.to_string(),
            units: "s".to_string(),
            contexts: contexts.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn criterion(name: &str, mode: CriterionMode, required: bool) -> SuccessCriterion {
        SuccessCriterion {
            name: name.to_string(),
            mode,
            required,
        }
    }

    #[test]
    fn figures_pick_up_active_context() {
        let dir = temp_dir("ctx");
        let log = dir.join("run.out");
        fs::write(
            &log,
            "time: 1.5\nsize = 10\ntime: 2.5\nsize = 20\ntime: 3.5\n",
        )
        .expect("write log");
        let space = space_with_log(&log);
        let contexts = vec![FomContext {
            name: "problem".to_string(),
            regex: r"size = (?P<n>\d+)".to_string(),
            output_format: "n={n}".to_string(),
        }];
        let foms = extract_foms(
            &[fom("time", r"time: (?P<t>[\d.]+)", "t", &["problem"])],
            &contexts,
            &Expander::new(&space),
        )
        .expect("extract");
        let labels: Vec<(&str, &str)> = foms
            .iter()
            .map(|f| (f.value.as_str(), f.context_label()))
            .collect();
        assert_eq!(labels, vec![("1.5", "null"), ("2.5", "n=10"), ("3.5", "n=20")]);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn criteria_modes_evaluate() {
        let dir = temp_dir("modes");
        let log = dir.join("run.out");
        fs::write(&log, "Kernel done\nelapsed 4.0\n").expect("write log");
        let space = space_with_log(&log);
        let foms = vec![FomValue {
            name: "elapsed".to_string(),
            value: "4.0".to_string(),
            units: "s".to_string(),
            context: None,
        }];
        let mut hooks = HookRegistry::new();
        hooks.register("has_foms", |input: &HookInput<'_>| !input.foms.is_empty());
        let variables = BTreeMap::new();
        let ctx = CriteriaContext {
            namespace: "a.w.e",
            space: &space,
            variables: &variables,
            foms: &foms,
            hooks: &hooks,
            max_depth: 100,
        };
        let criteria = vec![
            criterion(
                "done",
                CriterionMode::StringMatch {
                    pattern: r"^Kernel done$".to_string(),
                    file: "{log_file}".to_string(),
                },
                true,
            ),
            criterion(
                "fast",
                CriterionMode::Formula {
                    fom_name: "elap*".to_string(),
                    fom_context: "null".to_string(),
                    formula: "{value} < 5".to_string(),
                },
                true,
            ),
            criterion(
                "bare",
                CriterionMode::Formula {
                    fom_name: "elapsed".to_string(),
                    fom_context: "*".to_string(),
                    formula: "value >= 4".to_string(),
                },
                true,
            ),
            criterion(
                "hooked",
                CriterionMode::Hook {
                    hook: "has_foms".to_string(),
                },
                true,
            ),
        ];
        let report = evaluate_criteria(&criteria, &ctx);
        assert!(report.success(), "{:?}", report);
        assert_eq!(report.results.len(), 4);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn logs_with_invalid_utf8_are_still_scanned() {
        let dir = temp_dir("lossy");
        let log = dir.join("run.out");
        fs::write(&log, b"Kernel done\nelapsed 4\ngarbage \xff\xfe\n").expect("write log");
        let space = space_with_log(&log);
        let foms = extract_foms(
            &[fom("elapsed", r"elapsed (?P<t>\d+)", "t", &[])],
            &[],
            &Expander::new(&space),
        )
        .expect("extract");
        assert_eq!(foms.len(), 1);
        assert_eq!(foms[0].value, "4");

        let hooks = HookRegistry::new();
        let variables = BTreeMap::new();
        let ctx = CriteriaContext {
            namespace: "a.w.e",
            space: &space,
            variables: &variables,
            foms: &foms,
            hooks: &hooks,
            max_depth: 100,
        };
        let report = evaluate_criteria(
            &[criterion(
                "done",
                CriterionMode::StringMatch {
                    pattern: "^Kernel done$".to_string(),
                    file: "{log_file}".to_string(),
                },
                true,
            )],
            &ctx,
        );
        assert!(report.success(), "{:?}", report);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn unreadable_logs_are_reported() {
        let dir = temp_dir("unreadable");
        let space = space_with_log(&dir);
        let err = extract_foms(
            &[fom("elapsed", r"elapsed (?P<t>\d+)", "t", &[])],
            &[],
            &Expander::new(&space),
        )
        .expect_err("directory is not a log");
        assert!(matches!(err, CriteriaError::Read { .. }), "{:?}", err);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_inputs_fail_only_when_required() {
        let space = space_with_log(Path::new("/nonexistent/bench/run.out"));
        let hooks = HookRegistry::new();
        let variables = BTreeMap::new();
        let ctx = CriteriaContext {
            namespace: "a.w.e",
            space: &space,
            variables: &variables,
            foms: &[],
            hooks: &hooks,
            max_depth: 100,
        };
        let optional = vec![
            criterion(
                "log",
                CriterionMode::StringMatch {
                    pattern: "ok".to_string(),
                    file: "{log_file}".to_string(),
                },
                false,
            ),
            criterion(
                "fom",
                CriterionMode::Formula {
                    fom_name: "t".to_string(),
                    fom_context: "null".to_string(),
                    formula: "{value} > 0".to_string(),
                },
                false,
            ),
        ];
        let report = evaluate_criteria(&optional, &ctx);
        assert!(report.success());
        assert!(report
            .results
            .iter()
            .all(|r| matches!(r.outcome, CriterionOutcome::Skipped { .. })));

        let required: Vec<SuccessCriterion> = optional
            .into_iter()
            .map(|mut c| {
                c.required = true;
                c
            })
            .collect();
        let report = evaluate_criteria(&required, &ctx);
        assert!(!report.success());
        assert_eq!(report.failure_reasons().len(), 2);
    }

    #[test]
    fn false_formulas_and_unknown_hooks_fail() {
        let space = VariableSpace::new();
        let foms = vec![FomValue {
            name: "t".to_string(),
            value: "9".to_string(),
            units: String::new(),
            context: None,
        }];
        let hooks = HookRegistry::new();
        let variables = BTreeMap::new();
        let ctx = CriteriaContext {
            namespace: "a.w.e",
            space: &space,
            variables: &variables,
            foms: &foms,
            hooks: &hooks,
            max_depth: 100,
        };
        let criteria = vec![
            criterion(
                "slow",
                CriterionMode::Formula {
                    fom_name: "t".to_string(),
                    fom_context: "null".to_string(),
                    formula: "{value} < 5".to_string(),
                },
                true,
            ),
            criterion(
                "hook",
                CriterionMode::Hook {
                    hook: "missing".to_string(),
                },
                true,
            ),
        ];
        let report = evaluate_criteria(&criteria, &ctx);
        assert_eq!(report.failure_reasons().len(), 2);
    }
}
