use crate::compare;
use async_trait::async_trait;
use flowcore::{
    Block, BlockContext, BlockError, BlockHandler, BlockOutput, BlockType, HandlerMetadata,
    HandlerOutput,
};
use serde_json::{json, Value};

/// Picks exactly one downstream block.
///
/// `routes` is an ordered list of `{target, left?, operator?, right?}`; the
/// first route whose comparison holds (or that has none) wins. Without
/// routes, the resolved `target` value names the block directly.
pub struct RouterHandler;

#[async_trait]
impl BlockHandler for RouterHandler {
    fn can_handle(&self, block: &Block) -> bool {
        block.block_type == BlockType::Router
    }

    async fn execute(&self, ctx: BlockContext<'_>) -> Result<HandlerOutput, BlockError> {
        let chosen = match ctx.inputs.get("routes") {
            Some(Value::Array(routes)) => first_matching(routes)?,
            Some(other) if !other.is_null() => {
                return Err(BlockError::InvalidInputType {
                    field: "routes".to_string(),
                    expected: "array".to_string(),
                    actual: flowcore::json_type_name(other).to_string(),
                })
            }
            _ => Some(ctx.require_str("target")?.trim().to_string()),
        };
        let chosen = chosen.ok_or_else(|| {
            BlockError::ExecutionFailed(format!("no route of block '{}' matched", ctx.block.id))
        })?;

        let target = ctx
            .workflow
            .outgoing(&ctx.block.id)
            .filter_map(|c| ctx.workflow.find_block(&c.target))
            .find(|b| b.id == chosen || b.name() == chosen)
            .ok_or_else(|| {
                BlockError::ExecutionFailed(format!(
                    "'{}' is not a destination of router '{}'",
                    chosen, ctx.block.id
                ))
            })?;

        ctx.events.info(format!("Routing to {}", target.id));
        let mut output = BlockOutput::new();
        output.insert(
            "selectedPath".to_string(),
            json!({
                "blockId": target.id,
                "blockType": target.block_type.as_str(),
                "blockTitle": target.name(),
            }),
        );
        Ok(output.into())
    }

    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata {
            name: "router".to_string(),
            description: "Sends control to one of its destinations".to_string(),
            category: "blocks".to_string(),
        }
    }
}

fn first_matching(routes: &[Value]) -> Result<Option<String>, BlockError> {
    for route in routes {
        let target = route
            .get("target")
            .and_then(Value::as_str)
            .ok_or_else(|| BlockError::Configuration("route without target".to_string()))?;
        let matched = match route.get("operator").and_then(Value::as_str) {
            None | Some("") => true,
            Some(operator) => compare::evaluate(
                route.get("left").unwrap_or(&Value::Null),
                operator,
                route.get("right").unwrap_or(&Value::Null),
            )?,
        };
        if matched {
            return Ok(Some(target.to_string()));
        }
    }
    Ok(None)
}
