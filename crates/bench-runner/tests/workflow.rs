#![cfg(unix)]

use std::fs;
use std::path::{Path, PathBuf};

use bench_core::ensure_dir;
use bench_runner::{
    ExperimentFilter, ExperimentStatus, PipelineKind, PipelineOptions, Workspace,
};
use chrono::Utc;

const LIBRARY: &str = r#"
applications:
  counter:
    executables:
      emit:
        template: ['echo "value: {n_nodes}"']
    workloads:
      local:
        executables: [emit]
        inputs: [seed]
    inputs:
      seed:
        url: '{workspace_root}/seed.txt'
    figures_of_merit:
      - name: value
        fom_regex: 'value: (?P<v>[0-9]+)'
        group_name: v
        units: nodes
    success_criteria:
      - name: positive
        mode: fom_comparison
        fom_name: value
        formula: 'value >= 1'
"#;

const CONFIG: &str = r#"
bench:
  config:
    workers: 2
  variables:
    mpi_command: mpirun
    batch_submit: '{execute_experiment}'
  applications:
    counter:
      workloads:
        local:
          experiments:
            'count_{n_nodes}':
              variables:
                n_nodes: [1, 3]
              chained_experiments:
                - name: probe
                  order: after_root
            probe:
              template: true
"#;

fn workspace_root(tag: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!(
        "bench_workflow_{}_{}_{}",
        tag,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    ensure_dir(&root.join("configs")).expect("configs");
    fs::write(root.join("configs/bench.yaml"), CONFIG).expect("config");
    fs::write(root.join("configs/applications.yaml"), LIBRARY).expect("library");
    fs::write(root.join("seed.txt"), "seed\n").expect("seed");
    root
}

fn statuses(report: &bench_runner::PipelineReport) -> Vec<(String, ExperimentStatus)> {
    report
        .experiments
        .iter()
        .map(|r| (r.namespace.clone(), r.status))
        .collect()
}

fn is_file(root: &Path, rel: &str) -> bool {
    root.join(rel).is_file()
}

#[test]
fn setup_execute_analyze_archive_and_mirror() {
    let root = workspace_root("full");
    let workspace = Workspace::open_with(&root, Vec::new(), &[]).expect("open");
    let set = workspace
        .experiment_set(&ExperimentFilter::default())
        .expect("set");
    let namespaces: Vec<&str> = set.experiments.iter().map(|e| e.namespace.as_str()).collect();
    assert_eq!(
        namespaces,
        vec![
            "counter.local.count_1",
            "counter.local.count_1.chain.1.counter.local.probe",
            "counter.local.count_3",
            "counter.local.count_3.chain.1.counter.local.probe",
        ]
    );
    assert_eq!(set.summary.templates, 1);

    let options = workspace.pipeline_options();
    assert_eq!(options.workers, 2);
    let setup = workspace
        .run(&set, PipelineKind::Setup, &options)
        .expect("setup");
    assert!(setup.success(), "{:?}", setup.failure_reasons());
    assert!(is_file(&root, "inputs/counter/local/seed"));
    assert!(is_file(&root, "experiments/counter/local/count_3/execute_experiment"));
    assert!(is_file(&root, ".bench/inventory.json"));
    let unchanged = workspace.inventory_report(&set).expect("inventory");
    assert!(unchanged.diff.is_empty(), "{:?}", unchanged.diff);

    let execute = workspace
        .run(&set, PipelineKind::Execute, &options)
        .expect("execute");
    assert!(execute.success(), "{:?}", execute.failure_reasons());
    let log = fs::read_to_string(root.join("experiments/counter/local/count_3/count_3.out"))
        .expect("log");
    assert_eq!(log, "value: 3\n");

    let analyze = workspace
        .run(&set, PipelineKind::Analyze, &options)
        .expect("analyze");
    assert!(statuses(&analyze)
        .iter()
        .all(|(_, status)| *status == ExperimentStatus::Success));
    let count_3 = &analyze.experiments[2];
    assert_eq!(count_3.foms.len(), 1);
    assert_eq!(count_3.foms[0].value, "3");
    assert_eq!(count_3.foms[0].units, "nodes");
    assert!(is_file(&root, "results.json"));

    let archive = workspace
        .run(
            &set,
            PipelineKind::Archive,
            &PipelineOptions {
                tar_archive: true,
                ..options.clone()
            },
        )
        .expect("archive");
    let archive_dir = PathBuf::from(archive.archive.expect("archive dir"));
    assert!(archive_dir
        .join("experiments/counter/local/count_1/count_1.out")
        .is_file());
    assert!(archive_dir.join("configs/bench.yaml").is_file());
    let zip_name = format!(
        "{}.zip",
        archive_dir.file_name().expect("stamp").to_string_lossy()
    );
    assert!(root.join("archive").join(zip_name).is_file());

    let mirror = root.join("mirror");
    workspace
        .run(
            &set,
            PipelineKind::Mirror,
            &PipelineOptions {
                mirror_dir: Some(mirror.clone()),
                ..options
            },
        )
        .expect("mirror");
    assert_eq!(
        fs::read_to_string(mirror.join("counter/local/seed")).expect("mirrored"),
        "seed\n"
    );
    let _ = fs::remove_dir_all(root);
}

#[test]
fn generation_is_deterministic() {
    let root = workspace_root("determinism");
    let workspace = Workspace::open_with(&root, Vec::new(), &[]).expect("open");
    let first = workspace
        .experiment_set(&ExperimentFilter::default())
        .expect("set");
    let second = workspace
        .experiment_set(&ExperimentFilter::default())
        .expect("set");
    let digests = |set: &bench_runner::ExperimentSet| {
        workspace
            .pipeline_context(set)
            .inventory()
            .expect("inventory")
            .experiments
            .into_iter()
            .map(|(ns, entry)| (ns, entry.digest))
            .collect::<Vec<_>>()
    };
    assert_eq!(digests(&first), digests(&second));
    let _ = fs::remove_dir_all(root);
}

#[test]
fn dry_run_renders_but_runs_nothing() {
    let root = workspace_root("dry");
    let workspace = Workspace::open_with(&root, Vec::new(), &[]).expect("open");
    let set = workspace
        .experiment_set(&ExperimentFilter::default())
        .expect("set");
    let options = PipelineOptions {
        dry_run: true,
        ..workspace.pipeline_options()
    };
    let setup = workspace
        .run(&set, PipelineKind::Setup, &options)
        .expect("setup");
    assert!(setup.success());
    assert!(is_file(&root, "experiments/counter/local/count_1/execute_experiment"));
    assert!(!root.join("inputs").exists());

    let execute = workspace
        .run(&set, PipelineKind::Execute, &options)
        .expect("execute");
    assert!(execute.success());
    assert!(!is_file(&root, "experiments/counter/local/count_1/count_1.out"));
    let _ = fs::remove_dir_all(root);
}
