use async_trait::async_trait;
use flowcore::{
    Block, BlockContext, BlockError, BlockHandler, BlockOutput, BlockType, HandlerMetadata,
    HandlerOutput,
};
use serde_json::Value;

/// Simple debug block that logs its inputs
pub struct DebugHandler;

#[async_trait]
impl BlockHandler for DebugHandler {
    fn can_handle(&self, block: &Block) -> bool {
        block.block_type == BlockType::Debug
    }

    async fn execute(&self, ctx: BlockContext<'_>) -> Result<HandlerOutput, BlockError> {
        let message = ctx
            .inputs
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("(no message)");

        tracing::debug!("{}: {}", ctx.execution_block_id, message);
        ctx.events.info(format!("DEBUG: {}", message));

        // Also log all inputs for visibility
        for (key, value) in &ctx.inputs {
            ctx.events.info(format!("  {}: {}", key, value));
        }

        let mut output = BlockOutput::new();
        output.insert("message".to_string(), Value::String(message.to_string()));
        Ok(output.into())
    }

    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata {
            name: "debug".to_string(),
            description: "Logs input values for debugging".to_string(),
            category: "debug".to_string(),
        }
    }
}
