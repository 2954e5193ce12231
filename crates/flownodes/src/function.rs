use async_trait::async_trait;
use flowcore::{
    Block, BlockContext, BlockError, BlockHandler, BlockOutput, BlockType, HandlerMetadata,
    HandlerOutput,
};
use serde_json::Value;

/// Returns its resolved `output` template.
///
/// An object template becomes the block output as is; any other value is
/// wrapped as `{result}`. Without a template the resolved inputs pass
/// through. A `fail` message fails the block with that message.
pub struct FunctionHandler;

#[async_trait]
impl BlockHandler for FunctionHandler {
    fn can_handle(&self, block: &Block) -> bool {
        block.block_type == BlockType::Function
    }

    async fn execute(&self, ctx: BlockContext<'_>) -> Result<HandlerOutput, BlockError> {
        if let Some(Value::String(message)) = ctx.inputs.get("fail") {
            return Err(BlockError::ExecutionFailed(message.clone()));
        }

        let output = match ctx.inputs.get("output") {
            Some(Value::Object(fields)) => fields.clone(),
            Some(value) => {
                let mut output = BlockOutput::new();
                output.insert("result".to_string(), value.clone());
                output
            }
            None => ctx.inputs.clone(),
        };

        Ok(output.into())
    }

    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata {
            name: "function".to_string(),
            description: "Shapes data from earlier blocks".to_string(),
            category: "blocks".to_string(),
        }
    }
}
