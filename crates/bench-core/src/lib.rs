pub mod config;
pub mod errors;
pub mod expander;
pub mod expr;
pub mod fsutil;
pub mod hash;
pub mod variables;

pub use config::{ConfigScope, ConfigStack};
pub use errors::{
    BenchError, ChainError, CombinatorError, ConfigError, CriteriaError, ExpansionError,
    PipelineGraphError,
};
pub use expander::{find_cross_references, unescape, CrossReference, Expander, ExperimentLookup};
pub use expr::Value;
pub use fsutil::{atomic_write_bytes, atomic_write_json_pretty, ensure_dir, load_json_file};
pub use hash::{canonical_json_digest, sha256_bytes, sha256_file};
pub use variables::{Scope, VarValue, VariableSpace};
