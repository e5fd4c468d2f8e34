use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Result};
use bench_core::{atomic_write_json_pretty, canonical_json_digest, load_json_file};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::experiment::Experiment;

pub const INVENTORY_SCHEMA: &str = "bench_inventory_v1";

pub const ATTRIBUTE_GROUPS: &[&str] = &[
    "variables",
    "modifiers",
    "chained_experiments",
    "internals",
    "env_vars",
    "template",
    "inputs",
    "software",
];

#[derive(Debug, Clone, Default)]
pub struct InventorySources {
    pub template: Value,
    pub inputs: Value,
    pub software: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentInventory {
    pub namespace: String,
    pub digests: BTreeMap<String, String>,
    pub digest: String,
}

impl ExperimentInventory {
    pub fn build(exp: &Experiment, sources: &InventorySources) -> Result<Self> {
        let chained = json!({
            "entries": exp.chained,
            "link": exp.chain,
        });
        let groups: [(&str, Value); 8] = [
            ("variables", serde_json::to_value(&exp.resolved)?),
            ("modifiers", serde_json::to_value(&exp.modifiers)?),
            ("chained_experiments", chained),
            ("internals", serde_json::to_value(&exp.internals)?),
            ("env_vars", serde_json::to_value(&exp.env_vars)?),
            ("template", sources.template.clone()),
            ("inputs", sources.inputs.clone()),
            ("software", sources.software.clone()),
        ];
        let digests: BTreeMap<String, String> = groups
            .iter()
            .map(|(name, value)| (name.to_string(), canonical_json_digest(value)))
            .collect();
        let digest = canonical_json_digest(&serde_json::to_value(&digests)?);
        Ok(Self {
            namespace: exp.namespace.clone(),
            digests,
            digest,
        })
    }

    pub fn write(&self, run_dir: &Path) -> Result<()> {
        let mut payload = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut payload {
            map.insert("schema_version".to_string(), json!(INVENTORY_SCHEMA));
        }
        atomic_write_json_pretty(&run_dir.join("inventory.json"), &payload)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceInventory {
    pub schema_version: String,
    pub generated_at: String,
    pub experiments: BTreeMap<String, ExperimentInventory>,
}

impl WorkspaceInventory {
    pub fn new(entries: impl IntoIterator<Item = ExperimentInventory>) -> Self {
        Self {
            schema_version: INVENTORY_SCHEMA.to_string(),
            generated_at: Utc::now().to_rfc3339(),
            experiments: entries
                .into_iter()
                .map(|e| (e.namespace.clone(), e))
                .collect(),
        }
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let value = load_json_file(path)?;
        let schema = value
            .get("schema_version")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if schema != INVENTORY_SCHEMA {
            return Err(anyhow!(
                "unsupported inventory schema '{}' in {}",
                schema,
                path.display()
            ));
        }
        Ok(Some(serde_json::from_value(value)?))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        atomic_write_json_pretty(path, &serde_json::to_value(self)?)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InventoryDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: BTreeMap<String, Vec<String>>,
}

impl InventoryDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

pub fn diff_inventories(old: &WorkspaceInventory, new: &WorkspaceInventory) -> InventoryDiff {
    let mut diff = InventoryDiff::default();
    for (namespace, entry) in &new.experiments {
        let Some(previous) = old.experiments.get(namespace) else {
            diff.added.push(namespace.clone());
            continue;
        };
        if previous.digest == entry.digest {
            continue;
        }
        let groups: Vec<String> = ATTRIBUTE_GROUPS
            .iter()
            .filter(|group| previous.digests.get(**group) != entry.digests.get(**group))
            .map(|group| group.to_string())
            .collect();
        diff.changed.insert(namespace.clone(), groups);
    }
    diff.removed = old
        .experiments
        .keys()
        .filter(|ns| !new.experiments.contains_key(*ns))
        .cloned()
        .collect();
    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::{Internals, Repeat};
    use bench_core::{ensure_dir, VariableSpace};
    use std::collections::BTreeSet;
    use std::fs;

    fn experiment(namespace: &str, vars: &[(&str, &str)]) -> Experiment {
        Experiment {
            application: "hostname".to_string(),
            workload: "local".to_string(),
            name: namespace.rsplit('.').next().unwrap_or(namespace).to_string(),
            namespace: namespace.to_string(),
            template: false,
            index: 0,
            repeat: Repeat::Single,
            space: VariableSpace::new(),
            tags: BTreeSet::new(),
            modifiers: Vec::new(),
            env_vars: Vec::new(),
            internals: Internals::default(),
            success_criteria: Vec::new(),
            chained: Vec::new(),
            chain: None,
            resolved: vars
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn digests_are_stable_and_group_scoped() {
        let sources = InventorySources {
            template: json!({"execute_experiment": "abc"}),
            ..InventorySources::default()
        };
        let a = ExperimentInventory::build(&experiment("h.l.a", &[("n", "1")]), &sources)
            .expect("inventory");
        let again = ExperimentInventory::build(&experiment("h.l.a", &[("n", "1")]), &sources)
            .expect("inventory");
        assert_eq!(a, again);
        assert_eq!(a.digests.len(), ATTRIBUTE_GROUPS.len());

        let changed = ExperimentInventory::build(&experiment("h.l.a", &[("n", "2")]), &sources)
            .expect("inventory");
        assert_ne!(a.digests["variables"], changed.digests["variables"]);
        assert_eq!(a.digests["template"], changed.digests["template"]);
        assert_ne!(a.digest, changed.digest);
    }

    #[test]
    fn diff_reports_added_removed_and_changed_groups() {
        let sources = InventorySources::default();
        let build = |ns: &str, n: &str| {
            ExperimentInventory::build(&experiment(ns, &[("n", n)]), &sources).expect("inventory")
        };
        let old = WorkspaceInventory::new(vec![build("h.l.a", "1"), build("h.l.b", "1")]);
        let new = WorkspaceInventory::new(vec![build("h.l.a", "2"), build("h.l.c", "1")]);
        let diff = diff_inventories(&old, &new);
        assert_eq!(diff.added, vec!["h.l.c"]);
        assert_eq!(diff.removed, vec!["h.l.b"]);
        assert_eq!(diff.changed["h.l.a"], vec!["variables"]);
        assert!(diff_inventories(&new, &new).is_empty());
    }

    #[test]
    fn workspace_inventory_round_trips_through_disk() {
        let dir = std::env::temp_dir().join(format!(
            "bench_inventory_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("temp dir");
        let path = dir.join(".bench").join("inventory.json");
        assert!(WorkspaceInventory::load(&path).expect("load").is_none());

        let entry = ExperimentInventory::build(&experiment("h.l.a", &[]), &InventorySources::default())
            .expect("inventory");
        let inventory = WorkspaceInventory::new(vec![entry.clone()]);
        inventory.write(&path).expect("write");
        let loaded = WorkspaceInventory::load(&path).expect("load").expect("present");
        assert_eq!(loaded.experiments["h.l.a"], entry);

        fs::write(&path, r#"{"schema_version": "other"}"#).expect("write");
        assert!(WorkspaceInventory::load(&path).is_err());
        let _ = fs::remove_dir_all(dir);
    }
}
