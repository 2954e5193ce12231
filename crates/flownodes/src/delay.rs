use async_trait::async_trait;
use flowcore::{
    Block, BlockContext, BlockError, BlockHandler, BlockType, HandlerMetadata, HandlerOutput,
};
use serde_json::{json, Value};
use tokio::time::{sleep, Duration};

/// Delay execution for a specified duration
pub struct DelayHandler;

#[async_trait]
impl BlockHandler for DelayHandler {
    fn can_handle(&self, block: &Block) -> bool {
        block.block_type == BlockType::Delay
    }

    async fn execute(&self, ctx: BlockContext<'_>) -> Result<HandlerOutput, BlockError> {
        let delay_ms = ctx
            .inputs
            .get("delay_ms")
            .and_then(Value::as_f64)
            .unwrap_or(1000.0) as u64;

        ctx.events.info(format!("Delaying for {}ms", delay_ms));

        tokio::select! {
            _ = sleep(Duration::from_millis(delay_ms)) => {}
            _ = ctx.cancellation.cancelled() => return Err(BlockError::Cancelled),
        }

        // Pass through any inputs
        let mut output = ctx.inputs.clone();
        output.insert("waited_ms".to_string(), json!(delay_ms));
        Ok(output.into())
    }

    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata {
            name: "delay".to_string(),
            description: "Delay execution for specified milliseconds".to_string(),
            category: "time".to_string(),
        }
    }
}
