use anyhow::{anyhow, Result};
use bench_core::ConfigError;
use bench_runner::{
    ExperimentFilter, ExperimentSet, PipelineKind, PipelineOptions, PipelineReport, Workspace,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "bench",
    version = env!("CARGO_PKG_VERSION"),
    about = "Generate and run benchmark experiments from a workspace"
)]
struct Cli {
    /// Workspace root
    #[arg(short = 'w', long = "workspace", global = true, default_value = ".")]
    workspace: PathBuf,
    /// Configuration override `path:value` (colon separated path)
    #[arg(short = 'c', long = "config", global = true)]
    config: Vec<String>,
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(subcommand)]
    Workspace(WorkspaceCommand),
    /// Execute the experiments (the `execute` pipeline)
    On {
        #[arg(long)]
        executor: Option<String>,
        #[command(flatten)]
        filter: FilterArgs,
        #[command(flatten)]
        run: RunArgs,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum WorkspaceCommand {
    Setup {
        #[arg(long)]
        dry_run: bool,
        /// Only run phases whose name matches this glob
        #[arg(long)]
        phases: Option<String>,
        #[command(flatten)]
        filter: FilterArgs,
        #[command(flatten)]
        run: RunArgs,
        #[arg(long)]
        json: bool,
    },
    Analyze {
        #[command(flatten)]
        filter: FilterArgs,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    Archive {
        /// Also write archive/<stamp>.zip
        #[arg(long)]
        tar_archive: bool,
        #[command(flatten)]
        filter: FilterArgs,
        #[arg(long)]
        json: bool,
    },
    Mirror {
        #[arg(long)]
        dir: PathBuf,
        #[command(flatten)]
        filter: FilterArgs,
        #[arg(long)]
        json: bool,
    },
    /// List the generated experiments
    Info {
        #[command(flatten)]
        filter: FilterArgs,
        #[arg(long)]
        json: bool,
    },
    /// Compare the current experiments with the last setup
    Inventory {
        #[command(flatten)]
        filter: FilterArgs,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Clone, Default)]
struct FilterArgs {
    /// Keep experiments for which this expression is true (repeatable)
    #[arg(long = "where")]
    where_clauses: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    tags: Vec<String>,
}

impl FilterArgs {
    fn to_filter(&self) -> ExperimentFilter {
        ExperimentFilter {
            where_clauses: self.where_clauses.clone(),
            tags: self.tags.clone(),
        }
    }
}

#[derive(Args, Clone, Default)]
struct RunArgs {
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long)]
    fail_fast: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

struct CommandOutput {
    payload: Option<Value>,
    success: bool,
}

impl CommandOutput {
    fn text(success: bool) -> Self {
        Self {
            payload: None,
            success,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    match run_command(&cli) {
        Ok(output) => {
            if let Some(payload) = output.payload {
                emit_json(&payload);
            }
            if !output.success {
                std::process::exit(1);
            }
        }
        Err(err) => {
            if json_mode {
                emit_json(&error_payload(&err));
            } else {
                eprintln!("error: {:#}", err);
            }
            std::process::exit(1);
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("BENCH_LOG").unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::On { json, .. } => *json,
        Commands::Workspace(sub) => match sub {
            WorkspaceCommand::Setup { json, .. }
            | WorkspaceCommand::Archive { json, .. }
            | WorkspaceCommand::Mirror { json, .. }
            | WorkspaceCommand::Info { json, .. }
            | WorkspaceCommand::Inventory { json, .. } => *json,
            WorkspaceCommand::Analyze { format, .. } => *format == OutputFormat::Json,
        },
    }
}

fn command_name(command: &Commands) -> &'static str {
    match command {
        Commands::On { .. } => "on",
        Commands::Workspace(sub) => match sub {
            WorkspaceCommand::Setup { .. } => "workspace setup",
            WorkspaceCommand::Analyze { .. } => "workspace analyze",
            WorkspaceCommand::Archive { .. } => "workspace archive",
            WorkspaceCommand::Mirror { .. } => "workspace mirror",
            WorkspaceCommand::Info { .. } => "workspace info",
            WorkspaceCommand::Inventory { .. } => "workspace inventory",
        },
    }
}

fn run_command(cli: &Cli) -> Result<CommandOutput> {
    let workspace = Workspace::open(&cli.workspace, &cli.config)?;
    let json_mode = command_json_mode(&cli.command);
    let name = command_name(&cli.command);
    debug!(command = name, root = %cli.workspace.display(), "running command");

    match &cli.command {
        Commands::On {
            executor,
            filter,
            run,
            dry_run,
            ..
        } => {
            let set = workspace.experiment_set(&filter.to_filter())?;
            let mut options = run_options(&workspace, run);
            options.executor = executor.clone();
            options.dry_run = *dry_run;
            let report = workspace.run(&set, PipelineKind::Execute, &options)?;
            Ok(pipeline_output(name, &set, &report, json_mode))
        }
        Commands::Workspace(sub) => match sub {
            WorkspaceCommand::Setup {
                dry_run,
                phases,
                filter,
                run,
                ..
            } => {
                let set = workspace.experiment_set(&filter.to_filter())?;
                let mut options = run_options(&workspace, run);
                options.dry_run = *dry_run;
                options.phase_filter = phases.clone();
                let report = workspace.run(&set, PipelineKind::Setup, &options)?;
                Ok(pipeline_output(name, &set, &report, json_mode))
            }
            WorkspaceCommand::Analyze { filter, .. } => {
                let set = workspace.experiment_set(&filter.to_filter())?;
                let report =
                    workspace.run(&set, PipelineKind::Analyze, &workspace.pipeline_options())?;
                if !json_mode {
                    print_analysis(&report);
                }
                Ok(pipeline_output(name, &set, &report, json_mode))
            }
            WorkspaceCommand::Archive {
                tar_archive,
                filter,
                ..
            } => {
                let set = workspace.experiment_set(&filter.to_filter())?;
                let options = PipelineOptions {
                    tar_archive: *tar_archive,
                    ..workspace.pipeline_options()
                };
                let report = workspace.run(&set, PipelineKind::Archive, &options)?;
                if !json_mode {
                    if let Some(dir) = &report.archive {
                        println!("archive: {}", dir);
                    }
                }
                Ok(pipeline_output(name, &set, &report, json_mode))
            }
            WorkspaceCommand::Mirror { dir, filter, .. } => {
                let set = workspace.experiment_set(&filter.to_filter())?;
                let options = PipelineOptions {
                    mirror_dir: Some(dir.clone()),
                    ..workspace.pipeline_options()
                };
                let report = workspace.run(&set, PipelineKind::Mirror, &options)?;
                Ok(pipeline_output(name, &set, &report, json_mode))
            }
            WorkspaceCommand::Info { filter, .. } => {
                let set = workspace.experiment_set(&filter.to_filter())?;
                if json_mode {
                    let experiments: Vec<Value> = set
                        .experiments
                        .iter()
                        .map(|exp| {
                            json!({
                                "namespace": exp.namespace,
                                "template": exp.template,
                                "tags": exp.tags,
                                "run_dir": exp.value("experiment_run_dir"),
                            })
                        })
                        .collect();
                    return Ok(CommandOutput {
                        payload: Some(json!({
                            "ok": true,
                            "command": name,
                            "summary": set.summary,
                            "failures": set.failures,
                            "experiments": experiments,
                        })),
                        success: true,
                    });
                }
                print_summary(&set);
                for exp in &set.experiments {
                    let marker = if exp.template { " (template)" } else { "" };
                    println!("  {}{}", exp.namespace, marker);
                }
                print_generation_failures(&set);
                Ok(CommandOutput::text(true))
            }
            WorkspaceCommand::Inventory { filter, .. } => {
                let set = workspace.experiment_set(&filter.to_filter())?;
                let report = workspace.inventory_report(&set)?;
                if json_mode {
                    return Ok(CommandOutput {
                        payload: Some(json!({
                            "ok": true,
                            "command": name,
                            "inventory": report,
                        })),
                        success: true,
                    });
                }
                match &report.previous {
                    Some(at) => println!("previous inventory: {}", at),
                    None => println!("previous inventory: none"),
                }
                println!("experiments: {}", report.experiments);
                if report.diff.is_empty() {
                    println!("no changes");
                }
                for ns in &report.diff.added {
                    println!("  + {}", ns);
                }
                for ns in &report.diff.removed {
                    println!("  - {}", ns);
                }
                for (ns, groups) in &report.diff.changed {
                    println!("  ~ {} [{}]", ns, groups.join(", "));
                }
                Ok(CommandOutput::text(true))
            }
        },
    }
}

fn run_options(workspace: &Workspace, run: &RunArgs) -> PipelineOptions {
    let mut options = workspace.pipeline_options();
    if let Some(workers) = run.workers {
        options.workers = workers.max(1);
    }
    if run.fail_fast {
        options.fail_fast = true;
    }
    options
}

fn pipeline_output(
    name: &str,
    set: &ExperimentSet,
    report: &PipelineReport,
    json_mode: bool,
) -> CommandOutput {
    let success = report.success() && set.failures.is_empty();
    if json_mode {
        return CommandOutput {
            payload: Some(json!({
                "ok": success,
                "command": name,
                "summary": set.summary,
                "generation_failures": set.failures,
                "counts": report.counts(),
                "report": report,
            })),
            success,
        };
    }
    print_summary(set);
    print_generation_failures(set);
    let counts = report
        .counts()
        .iter()
        .map(|(status, n)| format!("{}={}", status, n))
        .collect::<Vec<_>>()
        .join(" ");
    let dry = if report.dry_run { " (dry run)" } else { "" };
    println!("{}{}: {}", report.pipeline.as_str(), dry, counts);
    if report.cancelled {
        println!("cancelled after first failure");
    }
    for reason in report.failure_reasons() {
        println!("  failed: {}", reason);
    }
    CommandOutput::text(success)
}

fn print_summary(set: &ExperimentSet) {
    let s = &set.summary;
    println!(
        "experiments: {} generated, {} excluded, {} filtered, {} templates, {} chained, {} repeats",
        s.generated, s.excluded, s.filtered, s.templates, s.chained, s.repeats
    );
}

fn print_generation_failures(set: &ExperimentSet) {
    for failure in &set.failures {
        println!(
            "  not generated: {} ({}): {}",
            failure.namespace, failure.stage, failure.message
        );
    }
}

fn print_analysis(report: &PipelineReport) {
    for exp in &report.experiments {
        println!("{} {}", exp.namespace, exp.status.as_str());
        for fom in &exp.foms {
            let units = if fom.units.is_empty() {
                String::new()
            } else {
                format!(" {}", fom.units)
            };
            println!(
                "    [{}] {} = {}{}",
                fom.context_label(),
                fom.name,
                fom.value,
                units
            );
        }
    }
}

fn error_payload(err: &anyhow::Error) -> Value {
    if let Some(config) = err.downcast_ref::<ConfigError>() {
        return json_error(
            "config_error",
            config.message.clone(),
            json!({ "path": config.path }),
        );
    }
    let message = err.to_string();
    if message.contains("operation_in_progress") {
        return json_error("operation_in_progress", message, json!({}));
    }
    json_error("command_failed", format!("{:#}", err), json!({}))
}

fn emit_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(err) => eprintln!("error: {}", anyhow!(err)),
    }
}

fn json_error(code: &str, message: impl Into<String>, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message.into(),
            "details": details,
        }
    })
}
