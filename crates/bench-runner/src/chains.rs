//! Experiment chaining.
//!
//! A root experiment lists `chained_experiments`; each entry names one or
//! more target experiments (a namespace, a glob over namespaces, or a bare
//! experiment name in the root's workload). Every target is copied, with
//! its own chain expanded recursively, and spliced into the root's
//! execution order. Copies get the namespace
//! `<root namespace>.chain.<position>.<target namespace>`.

use std::collections::BTreeMap;
use std::str::FromStr;

use bench_core::{ChainError, Scope, VarValue};
use globset::Glob;
use tracing::debug;

use crate::experiment::{ChainEntry, ChainLink, Experiment};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainOrder {
    BeforeChain,
    BeforeRoot,
    AfterRoot,
    AfterChain,
}

impl FromStr for ChainOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "before_chain" => Ok(ChainOrder::BeforeChain),
            "before_root" => Ok(ChainOrder::BeforeRoot),
            "after_root" => Ok(ChainOrder::AfterRoot),
            "after_chain" => Ok(ChainOrder::AfterChain),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
struct Member {
    id: usize,
    source: usize,
    /// Namespace relative to the experiment whose chain is being built.
    relative: String,
    entry: Option<ChainEntry>,
    /// `(donor id, names)`, outermost first.
    inherit: Vec<(usize, Vec<String>)>,
}

struct Splicer<'a> {
    base: &'a [Experiment],
    by_namespace: BTreeMap<&'a str, usize>,
    next_id: usize,
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', '{'])
}

impl<'a> Splicer<'a> {
    fn new(base: &'a [Experiment]) -> Self {
        Self {
            base,
            by_namespace: base
                .iter()
                .enumerate()
                .map(|(idx, exp)| (exp.namespace.as_str(), idx))
                .collect(),
            next_id: 0,
        }
    }

    fn fresh_id(&mut self) -> usize {
        self.next_id += 1;
        self.next_id
    }

    fn targets(&self, root: &Experiment, pattern: &str) -> Result<Vec<usize>, ChainError> {
        let qualified = if pattern.contains('.') {
            pattern.to_string()
        } else {
            format!("{}.{}.{}", root.application, root.workload, pattern)
        };
        let found: Vec<usize> = if is_glob(&qualified) {
            let matcher = Glob::new(&qualified)
                .map_err(|e| ChainError::InvalidPattern {
                    root: root.namespace.clone(),
                    pattern: pattern.to_string(),
                    message: e.to_string(),
                })?
                .compile_matcher();
            // BTreeMap iteration keeps matches in namespace order.
            self.by_namespace
                .iter()
                .filter(|(ns, _)| matcher.is_match(ns))
                .map(|(_, idx)| *idx)
                .collect()
        } else {
            self.by_namespace
                .get(qualified.as_str())
                .map(|idx| vec![*idx])
                .unwrap_or_default()
        };
        if found.is_empty() {
            return Err(ChainError::MissingTarget {
                root: root.namespace.clone(),
                pattern: pattern.to_string(),
            });
        }
        Ok(found)
    }

    /// Ordered members of `idx`'s chain, `idx` itself included.
    fn chain(&mut self, idx: usize, stack: &mut Vec<String>) -> Result<(usize, Vec<Member>), ChainError> {
        let base = self.base;
        let root = &base[idx];
        let root_id = self.fresh_id();
        stack.push(root.namespace.clone());
        let mut units: Vec<Vec<Member>> = vec![vec![Member {
            id: root_id,
            source: idx,
            relative: root.namespace.clone(),
            entry: None,
            inherit: Vec::new(),
        }]];
        let mut root_pos = 0;
        for entry in &root.chained {
            let order = ChainOrder::from_str(&entry.order).map_err(|order| {
                ChainError::InvalidOrder {
                    root: root.namespace.clone(),
                    order,
                }
            })?;
            for target in self.targets(root, &entry.name)? {
                let target_ns = &base[target].namespace;
                if stack.contains(target_ns) {
                    let mut path = stack.clone();
                    path.push(target_ns.clone());
                    return Err(ChainError::Cycle { path });
                }
                let (target_id, mut unit) = self.chain(target, stack)?;
                for member in unit.iter_mut() {
                    if member.id == target_id {
                        member.entry = Some(entry.clone());
                    }
                    if !entry.inherit_variables.is_empty() {
                        member
                            .inherit
                            .insert(0, (root_id, entry.inherit_variables.clone()));
                    }
                }
                match order {
                    ChainOrder::BeforeChain => {
                        units.insert(0, unit);
                        root_pos += 1;
                    }
                    ChainOrder::BeforeRoot => {
                        units.insert(root_pos, unit);
                        root_pos += 1;
                    }
                    ChainOrder::AfterRoot => units.insert(root_pos + 1, unit),
                    ChainOrder::AfterChain => units.push(unit),
                }
            }
        }
        stack.pop();

        let root_ns = root.namespace.clone();
        let mut members: Vec<Member> = units.into_iter().flatten().collect();
        for (pos, member) in members.iter_mut().enumerate() {
            if member.id != root_id {
                member.relative = format!("{}.chain.{}.{}", root_ns, pos, member.relative);
            }
        }
        Ok((root_id, members))
    }
}

/// Failures of chains that could not be built; the roots involved are
/// left out of the output.
pub type ChainFailures = Vec<(String, ChainError)>;

/// Replaces every non-template root by its expanded chain. Templates are
/// only reachable through chains.
pub fn splice(base: Vec<Experiment>) -> (Vec<Experiment>, ChainFailures) {
    let mut splicer = Splicer::new(&base);
    let mut out = Vec::new();
    let mut failures = Vec::new();
    for (idx, root) in base.iter().enumerate() {
        if root.template {
            continue;
        }
        if root.chained.is_empty() {
            out.push(root.clone());
            continue;
        }
        let (root_id, members) = match splicer.chain(idx, &mut Vec::new()) {
            Ok(chain) => chain,
            Err(err) => {
                failures.push((root.namespace.clone(), err));
                continue;
            }
        };
        let namespaces: BTreeMap<usize, String> = members
            .iter()
            .map(|m| (m.id, m.relative.clone()))
            .collect();
        debug!(root = %root.namespace, members = members.len(), "expanded chain");
        for (position, member) in members.into_iter().enumerate() {
            if member.id == root_id {
                out.push(root.clone());
                continue;
            }
            out.push(chained_copy(&base[member.source], root, position, &member, &namespaces));
        }
    }
    (out, failures)
}

fn chained_copy(
    source: &Experiment,
    root: &Experiment,
    position: usize,
    member: &Member,
    namespaces: &BTreeMap<usize, String>,
) -> Experiment {
    let mut copy = source.clone();
    let suffix = member
        .relative
        .strip_prefix(&format!("{}.", root.namespace))
        .unwrap_or(&member.relative);
    copy.namespace = member.relative.clone();
    copy.name = format!("{}.{}", root.name, suffix);
    copy.template = false;
    copy.chained = Vec::new();
    copy.space
        .define(Scope::Generated, "experiment_name", VarValue::scalar(copy.name.clone()));
    copy.space.define(
        Scope::Generated,
        "experiment_namespace",
        VarValue::scalar(copy.namespace.clone()),
    );
    let command = match &member.entry {
        Some(entry) => {
            copy.space.define_all(Scope::Chain, &entry.variables);
            entry.command.clone()
        }
        None => "{execute_experiment}".to_string(),
    };
    copy.space
        .define(Scope::Generated, "chain_command", VarValue::scalar(command.clone()));
    copy.chain = Some(ChainLink {
        root: root.namespace.clone(),
        position,
        command,
        inherit: member
            .inherit
            .iter()
            .filter_map(|(donor, names)| {
                namespaces.get(donor).map(|ns| (ns.clone(), names.clone()))
            })
            .collect(),
    });
    copy
}
