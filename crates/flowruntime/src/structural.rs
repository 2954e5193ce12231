//! Handlers for the blocks that shape control flow: entry triggers, loops
//! and parallels. Their outputs seed the loop and parallel managers.

use async_trait::async_trait;
use flowcore::{
    Block, BlockContext, BlockError, BlockHandler, BlockOutput, BlockType, HandlerMetadata,
    HandlerOutput, LoopType, ParallelType,
};
use serde_json::{json, Value};

/// Parallels without an explicit count fan out this many times
const DEFAULT_PARALLEL_COUNT: usize = 5;

/// Entry blocks reached a second time pass their resolved inputs through
pub struct TriggerHandler;

#[async_trait]
impl BlockHandler for TriggerHandler {
    fn can_handle(&self, block: &Block) -> bool {
        block.is_trigger()
    }

    async fn execute(&self, ctx: BlockContext<'_>) -> Result<HandlerOutput, BlockError> {
        Ok(HandlerOutput::Output(ctx.inputs))
    }

    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata {
            name: "starter".to_string(),
            description: "Workflow entry point".to_string(),
            category: "triggers".to_string(),
        }
    }
}

pub struct LoopHandler;

#[async_trait]
impl BlockHandler for LoopHandler {
    fn can_handle(&self, block: &Block) -> bool {
        block.block_type == BlockType::Loop
    }

    async fn execute(&self, ctx: BlockContext<'_>) -> Result<HandlerOutput, BlockError> {
        let region = ctx.workflow.loops.get(&ctx.block.id).ok_or_else(|| {
            BlockError::Configuration(format!("no loop region for block '{}'", ctx.block.id))
        })?;

        let mut output = BlockOutput::new();
        output.insert("loopId".to_string(), json!(region.id));
        match region.loop_type {
            LoopType::Count => {
                output.insert("loopType".to_string(), json!("count"));
                output.insert("maxIterations".to_string(), json!(region.iterations));
            }
            LoopType::ForEach => {
                let source = region.for_each_items.as_ref().ok_or_else(|| {
                    BlockError::Configuration("forEach loop without items".to_string())
                })?;
                let items = resolve_collection(&ctx, source)?;
                output.insert("loopType".to_string(), json!("forEach"));
                output.insert("maxIterations".to_string(), json!(items.len()));
                output.insert("items".to_string(), Value::Array(items));
            }
        }
        output.insert("currentIteration".to_string(), json!(0));

        Ok(HandlerOutput::Output(output))
    }

    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata {
            name: "loop".to_string(),
            description: "Runs its body once per iteration or item".to_string(),
            category: "blocks".to_string(),
        }
    }
}

pub struct ParallelHandler;

#[async_trait]
impl BlockHandler for ParallelHandler {
    fn can_handle(&self, block: &Block) -> bool {
        block.block_type == BlockType::Parallel
    }

    async fn execute(&self, ctx: BlockContext<'_>) -> Result<HandlerOutput, BlockError> {
        let region = ctx.workflow.parallels.get(&ctx.block.id).ok_or_else(|| {
            BlockError::Configuration(format!("no parallel region for block '{}'", ctx.block.id))
        })?;

        let mut output = BlockOutput::new();
        output.insert("parallelId".to_string(), json!(region.id));
        match region.parallel_type {
            ParallelType::Count => {
                output.insert("parallelType".to_string(), json!("count"));
                output.insert(
                    "count".to_string(),
                    json!(region.count.unwrap_or(DEFAULT_PARALLEL_COUNT)),
                );
            }
            ParallelType::Collection => {
                let source = region.distribution.as_ref().ok_or_else(|| {
                    BlockError::Configuration("collection parallel without distribution".to_string())
                })?;
                let items = resolve_collection(&ctx, source)?;
                output.insert("parallelType".to_string(), json!("collection"));
                output.insert("count".to_string(), json!(items.len()));
                output.insert("items".to_string(), Value::Array(items));
            }
        }

        Ok(HandlerOutput::Output(output))
    }

    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata {
            name: "parallel".to_string(),
            description: "Runs its body once per instance, concurrently".to_string(),
            category: "blocks".to_string(),
        }
    }
}

/// Items of a collection expression: an array, an object (as `[key, value]`
/// pairs), JSON text, or a reference resolved against the run.
pub fn resolve_collection(ctx: &BlockContext<'_>, source: &Value) -> Result<Vec<Value>, BlockError> {
    match source {
        Value::Array(items) => Ok(items.clone()),
        Value::Object(map) => Ok(map
            .iter()
            .map(|(k, v)| json!([k, v]))
            .collect()),
        Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.starts_with('[') || trimmed.starts_with('{') {
                if let Ok(parsed) = serde_json::from_str::<Value>(trimmed) {
                    return resolve_collection(ctx, &parsed);
                }
            }
            match ctx.resolve(source)? {
                Value::String(s) if s == *text => Err(BlockError::Configuration(format!(
                    "cannot resolve collection from '{}'",
                    text
                ))),
                Value::Null => Ok(Vec::new()),
                resolved => resolve_collection(ctx, &resolved),
            }
        }
        Value::Null => Ok(Vec::new()),
        other => Err(BlockError::InvalidInputType {
            field: "items".to_string(),
            expected: "array or object".to_string(),
            actual: flowcore::json_type_name(other).to_string(),
        }),
    }
}
