use std::collections::{BTreeSet, HashMap};

use bench_core::PipelineGraphError;
use globset::Glob;
use tracing::debug;

use crate::definitions::PhaseSpec;

pub const PIPELINES: &[&str] = &["setup", "execute", "analyze", "archive", "mirror"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseRegistration {
    pub name: String,
    pub pipeline: String,
    pub run_before: Vec<String>,
    pub run_after: Vec<String>,
    pub command: Option<String>,
    pub owner: String,
}

#[derive(Debug, Clone, Default)]
pub struct PhaseGraph {
    registrations: Vec<PhaseRegistration>,
}

impl PhaseGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `spec` for `owner`. Re-registering a phase of the same
    /// pipeline merges its constraints and keeps its first position.
    pub fn register(&mut self, owner: &str, spec: &PhaseSpec) {
        if let Some(existing) = self
            .registrations
            .iter_mut()
            .find(|r| r.name == spec.name && r.pipeline == spec.pipeline)
        {
            for name in &spec.run_before {
                if !existing.run_before.contains(name) {
                    existing.run_before.push(name.clone());
                }
            }
            for name in &spec.run_after {
                if !existing.run_after.contains(name) {
                    existing.run_after.push(name.clone());
                }
            }
            if existing.command.is_none() {
                existing.command = spec.command.clone();
            }
            return;
        }
        self.registrations.push(PhaseRegistration {
            name: spec.name.clone(),
            pipeline: spec.pipeline.clone(),
            run_before: spec.run_before.clone(),
            run_after: spec.run_after.clone(),
            command: spec.command.clone(),
            owner: owner.to_string(),
        });
    }

    pub fn get(&self, pipeline: &str, name: &str) -> Option<&PhaseRegistration> {
        self.registrations
            .iter()
            .find(|r| r.pipeline == pipeline && r.name == name)
    }

    pub fn order(&self, pipeline: &str) -> Result<Vec<&PhaseRegistration>, PipelineGraphError> {
        if !PIPELINES.contains(&pipeline) {
            return Err(PipelineGraphError::UnknownPipeline {
                pipeline: pipeline.to_string(),
            });
        }
        let nodes: Vec<&PhaseRegistration> = self
            .registrations
            .iter()
            .filter(|r| r.pipeline == pipeline)
            .collect();
        let index: HashMap<&str, usize> = nodes
            .iter()
            .enumerate()
            .map(|(idx, r)| (r.name.as_str(), idx))
            .collect();

        let mut successors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); nodes.len()];
        for (idx, node) in nodes.iter().enumerate() {
            for before in &node.run_before {
                match index.get(before.as_str()) {
                    Some(&target) if target != idx => {
                        successors[idx].insert(target);
                    }
                    Some(_) => {}
                    None => debug!(phase = %node.name, %before, "ignoring run_before on unregistered phase"),
                }
            }
            for after in &node.run_after {
                match index.get(after.as_str()) {
                    Some(&source) if source != idx => {
                        successors[source].insert(idx);
                    }
                    Some(_) => {}
                    None => debug!(phase = %node.name, %after, "ignoring run_after on unregistered phase"),
                }
            }
        }

        let mut pending = vec![0usize; nodes.len()];
        for succ in &successors {
            for &next in succ {
                pending[next] += 1;
            }
        }
        let mut ready: BTreeSet<usize> = (0..nodes.len()).filter(|i| pending[*i] == 0).collect();
        let mut order = Vec::with_capacity(nodes.len());
        while let Some(idx) = ready.pop_first() {
            order.push(nodes[idx]);
            for &next in &successors[idx] {
                pending[next] -= 1;
                if pending[next] == 0 {
                    ready.insert(next);
                }
            }
        }
        if order.len() != nodes.len() {
            return Err(PipelineGraphError::Cycle {
                pipeline: pipeline.to_string(),
                phases: (0..nodes.len())
                    .filter(|i| pending[*i] > 0)
                    .map(|i| nodes[i].name.clone())
                    .collect(),
            });
        }
        Ok(order)
    }
}

pub fn filter_phases<'a>(
    order: Vec<&'a PhaseRegistration>,
    pattern: Option<&str>,
) -> Result<Vec<&'a PhaseRegistration>, PipelineGraphError> {
    let Some(pattern) = pattern else {
        return Ok(order);
    };
    let matcher = Glob::new(pattern)
        .map_err(|e| PipelineGraphError::InvalidFilter {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?
        .compile_matcher();
    Ok(order
        .into_iter()
        .filter(|r| matcher.is_match(&r.name))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, before: &[&str], after: &[&str]) -> PhaseSpec {
        PhaseSpec {
            name: name.to_string(),
            pipeline: "setup".to_string(),
            run_before: before.iter().map(|s| s.to_string()).collect(),
            run_after: after.iter().map(|s| s.to_string()).collect(),
            command: None,
        }
    }

    fn names(order: &[&PhaseRegistration]) -> Vec<String> {
        order.iter().map(|r| r.name.clone()).collect()
    }

    #[test]
    fn constraints_order_phases() {
        let mut graph = PhaseGraph::new();
        graph.register("app", &spec("C", &[], &["B"]));
        graph.register("app", &spec("A", &["B"], &[]));
        graph.register("app", &spec("B", &[], &[]));
        assert_eq!(names(&graph.order("setup").expect("order")), vec!["A", "B", "C"]);
    }

    #[test]
    fn ties_break_by_registration_order() {
        let mut graph = PhaseGraph::new();
        graph.register("app", &spec("zeta", &[], &[]));
        graph.register("app", &spec("alpha", &[], &[]));
        graph.register("app", &spec("mid", &[], &["zeta"]));
        assert_eq!(
            names(&graph.order("setup").expect("order")),
            vec!["zeta", "alpha", "mid"]
        );
    }

    #[test]
    fn cycles_are_reported() {
        let mut graph = PhaseGraph::new();
        graph.register("app", &spec("A", &["B"], &[]));
        graph.register("app", &spec("B", &["A"], &[]));
        graph.register("app", &spec("C", &[], &[]));
        match graph.order("setup").expect_err("cycle") {
            PipelineGraphError::Cycle { pipeline, phases } => {
                assert_eq!(pipeline, "setup");
                assert_eq!(phases, vec!["A", "B"]);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn duplicate_registration_merges_constraints() {
        let mut graph = PhaseGraph::new();
        graph.register("app", &spec("build", &[], &[]));
        graph.register("app", &spec("fetch", &[], &[]));
        graph.register("modifier", &spec("build", &[], &["fetch"]));
        let order = graph.order("setup").expect("order");
        assert_eq!(names(&order), vec!["fetch", "build"]);
        assert_eq!(order[1].owner, "app");
    }

    #[test]
    fn unknown_references_and_pipelines() {
        let mut graph = PhaseGraph::new();
        graph.register("app", &spec("only", &["ghost"], &["phantom"]));
        assert_eq!(names(&graph.order("setup").expect("order")), vec!["only"]);
        assert!(graph.order("execute").expect("empty").is_empty());
        assert!(matches!(
            graph.order("deploy"),
            Err(PipelineGraphError::UnknownPipeline { .. })
        ));
    }

    #[test]
    fn glob_filter_keeps_order() {
        let mut graph = PhaseGraph::new();
        for name in ["get_inputs", "software_create_env", "make_experiments"] {
            graph.register("app", &spec(name, &[], &[]));
        }
        let order = graph.order("setup").expect("order");
        let kept = filter_phases(order, Some("*_e*")).expect("filter");
        assert_eq!(names(&kept), vec!["software_create_env", "make_experiments"]);
        assert!(matches!(
            filter_phases(Vec::new(), Some("[")),
            Err(PipelineGraphError::InvalidFilter { .. })
        ));
    }
}
