//! Error taxonomy shared by the bench crates.
//!
//! Each family maps to one failure class of a generation or execution run:
//! configuration errors are fatal immediately, expansion errors are fatal
//! for one experiment, combinator errors are fatal for the whole run, chain
//! errors are fatal for the affected chain, phase graph errors are fatal for
//! the pipeline and criteria errors are recorded as experiment failures.

use thiserror::Error;

/// Malformed configuration document or unknown key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("configuration error at {path}: {message}")]
pub struct ConfigError {
    pub path: String,
    pub message: String,
}

impl ConfigError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpansionError {
    #[error("undefined variable '{name}' while expanding '{expression}'")]
    Undefined { name: String, expression: String },
    #[error("expansion cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },
    #[error("expansion of '{expression}' exceeded the recursion limit of {limit}")]
    RecursionLimit { expression: String, limit: usize },
    #[error("arithmetic error in '{expression}': {message}")]
    Arithmetic { expression: String, message: String },
    #[error("type error in '{expression}': {message}")]
    Type { expression: String, message: String },
    #[error("syntax error in '{expression}': {message}")]
    Syntax { expression: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CombinatorError {
    #[error("{experiment}: vector lengths differ: {}", describe_lengths(.lengths))]
    LengthMismatch {
        experiment: String,
        lengths: Vec<(String, usize)>,
    },
    #[error("{experiment}: zip '{zip}' members differ in length: {}", describe_lengths(.lengths))]
    ZipLengthMismatch {
        experiment: String,
        zip: String,
        lengths: Vec<(String, usize)>,
    },
    #[error("{experiment}: vector variable '{variable}' is empty")]
    EmptyVector { experiment: String, variable: String },
    #[error("{experiment}: '{group}' references undeclared variable '{member}'")]
    UndeclaredMember {
        experiment: String,
        group: String,
        member: String,
    },
    #[error("{experiment}: '{group}' references '{member}', which is not a vector")]
    NotAVector {
        experiment: String,
        group: String,
        member: String,
    },
    #[error("{experiment}: variable '{variable}' is consumed by more than one group: {}", groups.join(", "))]
    AmbiguousConsumption {
        experiment: String,
        variable: String,
        groups: Vec<String>,
    },
    #[error("duplicate experiment namespace '{namespace}'")]
    DuplicateNamespace { namespace: String },
}

fn describe_lengths(lengths: &[(String, usize)]) -> String {
    lengths
        .iter()
        .map(|(name, len)| format!("{}={}", name, len))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("{root}: chained experiment '{pattern}' matches no experiment")]
    MissingTarget { root: String, pattern: String },
    #[error("{root}: invalid chain order '{order}'")]
    InvalidOrder { root: String, order: String },
    #[error("chain cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },
    #[error("{root}: invalid chain pattern '{pattern}': {message}")]
    InvalidPattern {
        root: String,
        pattern: String,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineGraphError {
    #[error("phase ordering cycle in pipeline '{pipeline}': {}", phases.join(", "))]
    Cycle { pipeline: String, phases: Vec<String> },
    #[error("unknown pipeline '{pipeline}'")]
    UnknownPipeline { pipeline: String },
    #[error("invalid phase filter '{pattern}': {message}")]
    InvalidFilter { pattern: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CriteriaError {
    #[error("criterion '{criterion}': required file '{path}' is missing")]
    MissingFile { criterion: String, path: String },
    #[error("criterion '{criterion}': no figure of merit matches '{fom}'")]
    MissingFigureOfMerit { criterion: String, fom: String },
    #[error("criterion '{criterion}': invalid pattern '{pattern}': {message}")]
    InvalidPattern {
        criterion: String,
        pattern: String,
        message: String,
    },
    #[error("criterion '{criterion}': {source}")]
    Formula {
        criterion: String,
        source: ExpansionError,
    },
    #[error("criterion '{criterion}': unknown mode '{mode}'")]
    UnknownMode { criterion: String, mode: String },
    #[error("criterion '{criterion}': failed to read '{path}': {message}")]
    Read {
        criterion: String,
        path: String,
        message: String,
    },
}

/// Umbrella over every family, for callers that want one type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BenchError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Expansion(#[from] ExpansionError),
    #[error(transparent)]
    Combinator(#[from] CombinatorError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    PipelineGraph(#[from] PipelineGraphError),
    #[error(transparent)]
    Criteria(#[from] CriteriaError),
}
