use async_trait::async_trait;
use flowcore::{
    Block, BlockContext, BlockError, BlockHandler, BlockOutput, BlockType, HandlerMetadata,
    HandlerOutput,
};
use serde_json::{json, Value};

/// The workflow's answer: resolved `data`, a `status` and optional `headers`
pub struct ResponseHandler;

#[async_trait]
impl BlockHandler for ResponseHandler {
    fn can_handle(&self, block: &Block) -> bool {
        block.block_type == BlockType::Response
    }

    async fn execute(&self, ctx: BlockContext<'_>) -> Result<HandlerOutput, BlockError> {
        let status = match ctx.inputs.get("status") {
            None | Some(Value::Null) => 200,
            Some(value) => value
                .as_u64()
                .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
                .filter(|code| (100..600).contains(code))
                .ok_or_else(|| BlockError::InvalidInputType {
                    field: "status".to_string(),
                    expected: "HTTP status code".to_string(),
                    actual: value.to_string(),
                })?,
        };

        let mut output = BlockOutput::new();
        output.insert("data".to_string(), ctx.get_input_or("data", Value::Null));
        output.insert("status".to_string(), json!(status));
        output.insert(
            "headers".to_string(),
            ctx.get_input_or("headers", Value::Object(Default::default())),
        );
        Ok(output.into())
    }

    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata {
            name: "response".to_string(),
            description: "Returns data as the workflow result".to_string(),
            category: "blocks".to_string(),
        }
    }
}
