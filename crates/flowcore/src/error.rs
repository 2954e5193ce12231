use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Block error: {0}")]
    Block(#[from] BlockError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Maximum iteration count ({0}) exceeded, possible infinite loop")]
    IterationLimit(usize),

    #[error("No handler found for block '{block_id}' of type '{block_type}'")]
    NoHandler { block_id: String, block_type: String },

    #[error("Workflow execution was cancelled")]
    Cancelled,

    #[error("Debug continuation error: {0}")]
    Debug(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BlockError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Timeout after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Cancelled")]
    Cancelled,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkflowError {
    #[error("Invalid workflow: {0}")]
    Invalid(String),

    #[error("Duplicate block id: {0}")]
    DuplicateBlock(String),

    #[error("Connection references unknown block '{block_id}' ({source_id} -> {target_id})")]
    DanglingConnection {
        block_id: String,
        source_id: String,
        target_id: String,
    },

    #[error("Block not found: {0}")]
    BlockNotFound(String),

    #[error("No entry block found: the workflow needs exactly one starter or trigger block")]
    NoEntryPoint,

    #[error("Multiple entry blocks found: {0:?}")]
    MultipleEntryPoints(Vec<String>),

    #[error("Invalid entry block '{block_id}': {reason}")]
    InvalidEntryPoint { block_id: String, reason: String },

    #[error("Invalid loop '{loop_id}': {reason}")]
    InvalidLoop { loop_id: String, reason: String },

    #[error("Invalid parallel '{parallel_id}': {reason}")]
    InvalidParallel { parallel_id: String, reason: String },

    #[error("Cyclic dependency detected")]
    CyclicDependency,

    #[error("Blocks of type '{block_type}' cannot have error connections (block '{block_id}')")]
    UnsupportedErrorEdge {
        block_id: String,
        block_type: String,
    },
}
