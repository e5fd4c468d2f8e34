pub mod chains;
pub mod collaborators;
pub mod combinator;
pub mod criteria;
pub mod definitions;
pub mod experiment;
pub mod inventory;
pub mod phases;
pub mod pipeline;
pub mod set;
pub mod workspace;

pub use collaborators::{
    CommandOutcome, CommandRunner, Collaborators, DefaultFetcher, DirectoryPackageManager,
    InputFetcher, PackageManager, ShellRunner, SoftwareConfig,
};
pub use criteria::{CriteriaReport, FomValue, HookInput, HookRegistry};
pub use definitions::{DefinitionLibrary, ObjectDefinition, ObjectKind};
pub use experiment::Experiment;
pub use inventory::{diff_inventories, InventoryDiff, WorkspaceInventory};
pub use phases::{PhaseGraph, PIPELINES};
pub use pipeline::{
    run_pipeline, ExperimentReport, ExperimentStatus, PipelineContext, PipelineKind,
    PipelineOptions, PipelineReport,
};
pub use set::{ExperimentFilter, ExperimentSet, GenerationOptions, GenerationSummary};
pub use workspace::{InventoryReport, Workspace, WorkspaceSettings};
