use crate::{
    events::EventEmitter, Block, BlockError, BlockOutput, BlockScope, ExecutionContext, Workflow,
};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use std::fmt;
use tokio_util::sync::CancellationToken;

/// Core trait that all block handlers implement
#[async_trait]
pub trait BlockHandler: Send + Sync {
    /// Whether this handler executes the given block
    fn can_handle(&self, block: &Block) -> bool;

    /// Execute the block with its resolved inputs
    async fn execute(&self, ctx: BlockContext<'_>) -> Result<HandlerOutput, BlockError>;

    /// Optional: describe the handler for listings
    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata::default()
    }
}

/// Turns a block's raw config plus the run state into concrete values
pub trait InputResolver: Send + Sync {
    /// Resolve every config entry of `block`
    fn resolve_inputs(
        &self,
        block: &Block,
        workflow: &Workflow,
        ctx: &ExecutionContext,
        scope: &BlockScope,
    ) -> Result<BlockOutput, BlockError>;

    /// Resolve a single template value
    fn resolve_value(
        &self,
        value: &Value,
        workflow: &Workflow,
        ctx: &ExecutionContext,
        scope: &BlockScope,
    ) -> Result<Value, BlockError>;
}

/// Context handed to a handler for one (real or virtual) block execution
pub struct BlockContext<'a> {
    pub block: &'a Block,

    /// Real or virtual id this execution writes to
    pub execution_block_id: String,

    /// Config values with references resolved
    pub inputs: BlockOutput,

    /// Loop and parallel values visible to this execution
    pub scope: BlockScope,

    pub workflow: &'a Workflow,

    /// Read-only view of the run state
    pub execution: &'a ExecutionContext,

    pub resolver: &'a dyn InputResolver,

    /// Event emitter for real-time updates
    pub events: EventEmitter,

    /// Cancellation token of the run
    pub cancellation: CancellationToken,
}

impl<'a> BlockContext<'a> {
    /// Get required input or return error
    pub fn require_input(&self, name: &str) -> Result<&Value, BlockError> {
        self.inputs
            .get(name)
            .filter(|v| !v.is_null())
            .ok_or_else(|| BlockError::MissingInput(name.to_string()))
    }

    /// Get required string input
    pub fn require_str(&self, name: &str) -> Result<&str, BlockError> {
        let value = self.require_input(name)?;
        value.as_str().ok_or_else(|| BlockError::InvalidInputType {
            field: name.to_string(),
            expected: "string".to_string(),
            actual: json_type_name(value).to_string(),
        })
    }

    /// Get input with default
    pub fn get_input_or(&self, name: &str, default: Value) -> Value {
        self.inputs.get(name).cloned().unwrap_or(default)
    }

    /// Resolve an additional template value against the run state
    pub fn resolve(&self, value: &Value) -> Result<Value, BlockError> {
        self.resolver
            .resolve_value(value, self.workflow, self.execution, &self.scope)
    }
}

/// Result of a handler: a finished record or a live stream
pub enum HandlerOutput {
    Output(BlockOutput),
    Stream(StreamingExecution),
}

impl From<BlockOutput> for HandlerOutput {
    fn from(output: BlockOutput) -> Self {
        HandlerOutput::Output(output)
    }
}

impl fmt::Debug for HandlerOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerOutput::Output(o) => f.debug_tuple("Output").field(o).finish(),
            HandlerOutput::Stream(s) => f.debug_tuple("Stream").field(s).finish(),
        }
    }
}

/// Live output of a streaming handler
pub struct StreamingExecution {
    pub block_id: String,
    pub stream: BoxStream<'static, Result<String, BlockError>>,
    /// Non-content output (token counts, tool calls) kept in the final state
    pub output: BlockOutput,
}

impl StreamingExecution {
    pub fn new(
        block_id: impl Into<String>,
        stream: BoxStream<'static, Result<String, BlockError>>,
    ) -> Self {
        Self {
            block_id: block_id.into(),
            stream,
            output: BlockOutput::new(),
        }
    }

    pub fn with_output(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.output.insert(key.into(), value.into());
        self
    }
}

impl fmt::Debug for StreamingExecution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingExecution")
            .field("block_id", &self.block_id)
            .field("output", &self.output)
            .finish_non_exhaustive()
    }
}

/// Metadata about a handler
#[derive(Debug, Clone)]
pub struct HandlerMetadata {
    pub name: String,
    pub description: String,
    pub category: String,
}

impl Default for HandlerMetadata {
    fn default() -> Self {
        Self {
            name: "custom".to_string(),
            description: String::new(),
            category: "general".to_string(),
        }
    }
}

pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
