use thiserror::Error;

use crate::graph::BlockId;

/// Raised while turning a program graph into a command script.
///
/// Compile errors never reach the execution engine: a run attempt that fails
/// to compile is abandoned before anything is dispatched.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("Unknown block type '{block_type}' (block {block})")]
    UnknownBlock { block: BlockId, block_type: String },

    #[error("Block '{block_type}' is missing required field '{field}'")]
    MissingField { block_type: String, field: String },

    #[error("Block '{block_type}' has invalid value '{value}' for field '{field}'")]
    InvalidField {
        block_type: String,
        field: String,
        value: String,
    },

    #[error("Block '{block_type}' expects a number in '{input}', got '{found}'")]
    TypeMismatch {
        block_type: String,
        input: String,
        found: String,
    },

    #[error("Block '{block_type}' cannot be used as a statement")]
    NotAStatement { block_type: String },

    #[error("Block '{block_type}' does not produce a value")]
    NotAValue { block_type: String },

    #[error("Block {block} refers to missing block {target}")]
    DanglingReference { block: BlockId, target: BlockId },

    #[error("Cycle detected at block '{block_type}' (block {block})")]
    CycleDetected { block: BlockId, block_type: String },

    #[error("Program nesting exceeds the maximum depth of {max_depth}")]
    DepthExceeded { max_depth: usize },
}

/// Raised while reading the editor's serialized workspace document.
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Invalid workspace document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Duplicate block id '{0}'")]
    DuplicateId(String),
}

/// Any failure of a single remote command.
///
/// Transport failures (connection refused, unreadable body) and application
/// failures (non-2xx status carrying an `error` field) share this one shape,
/// so callers never branch on the failure kind.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct RemoteError {
    pub message: String,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        RemoteError::new(format!("Request failed: {err}"))
    }
}

/// Summary error surfaced by the engine when a run terminates in `Failed`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Step {step} ({action}) failed: {source}")]
pub struct EngineError {
    /// Zero-based position of the failing instruction in dispatch order.
    pub step: usize,
    pub action: String,
    #[source]
    pub source: RemoteError,
}

/// Raised when an environment override cannot be parsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid value '{value}' for {var}: expected {expected}")]
pub struct ConfigError {
    pub var: String,
    pub value: String,
    pub expected: &'static str,
}
