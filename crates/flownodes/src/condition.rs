use crate::compare;
use async_trait::async_trait;
use flowcore::{
    BlockContext, BlockError, BlockHandler, BlockOutput, BlockType, HandlerMetadata,
    HandlerOutput, SourceHandle,
};
use serde_json::{json, Value};

/// Branches on the first matching rule.
///
/// Rules come from the `conditions` config, an ordered list (or JSON text of
/// one) of `{id, left, operator, right}`. A rule without an operator matches
/// unconditionally and serves as the `else` branch. Only the edge tagged
/// `condition-<id>` of the selected rule is taken.
pub struct ConditionHandler;

#[async_trait]
impl BlockHandler for ConditionHandler {
    fn can_handle(&self, block: &flowcore::Block) -> bool {
        block.block_type == BlockType::Condition
    }

    async fn execute(&self, ctx: BlockContext<'_>) -> Result<HandlerOutput, BlockError> {
        let rules = rules(&ctx)?;

        for rule in &rules {
            let id = rule
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| BlockError::Configuration("condition rule without id".to_string()))?;

            let matched = match rule.get("operator").and_then(Value::as_str) {
                None | Some("") | Some("else") => true,
                Some(operator) => {
                    let left = rule.get("left").unwrap_or(&Value::Null);
                    let right = rule.get("right").unwrap_or(&Value::Null);
                    compare::evaluate(left, operator, right)?
                }
            };
            if !matched {
                continue;
            }

            ctx.events.info(format!("Condition {} matched", id));
            let mut output = BlockOutput::new();
            output.insert("conditionResult".to_string(), json!(true));
            output.insert("selectedConditionId".to_string(), json!(id));
            if let Some(target) = target_of(&ctx, id) {
                output.insert("selectedPath".to_string(), target);
            }
            return Ok(output.into());
        }

        Err(BlockError::ExecutionFailed(format!(
            "no condition of block '{}' matched",
            ctx.block.id
        )))
    }

    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata {
            name: "condition".to_string(),
            description: "Takes the branch of the first matching rule".to_string(),
            category: "blocks".to_string(),
        }
    }
}

/// Rules with their operands resolved
fn rules(ctx: &BlockContext<'_>) -> Result<Vec<Value>, BlockError> {
    match ctx.inputs.get("conditions") {
        Some(Value::Array(rules)) => Ok(rules.clone()),
        // JSON text is parsed from the raw config so references resolve to values
        Some(Value::String(_)) => {
            let raw = ctx
                .block
                .config
                .get("conditions")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let parsed: Value = serde_json::from_str(raw)
                .map_err(|e| BlockError::Configuration(format!("invalid conditions: {}", e)))?;
            match ctx.resolve(&parsed)? {
                Value::Array(rules) => Ok(rules),
                other => Err(BlockError::InvalidInputType {
                    field: "conditions".to_string(),
                    expected: "array".to_string(),
                    actual: flowcore::json_type_name(&other).to_string(),
                }),
            }
        }
        Some(other) => Err(BlockError::InvalidInputType {
            field: "conditions".to_string(),
            expected: "array".to_string(),
            actual: flowcore::json_type_name(other).to_string(),
        }),
        None => Err(BlockError::MissingInput("conditions".to_string())),
    }
}

fn target_of(ctx: &BlockContext<'_>, condition_id: &str) -> Option<Value> {
    let handle = SourceHandle::condition(condition_id);
    let conn = ctx
        .workflow
        .outgoing(&ctx.block.id)
        .find(|c| c.handle() == handle)?;
    let target = ctx.workflow.find_block(&conn.target)?;
    Some(json!({
        "blockId": target.id,
        "blockType": target.block_type.as_str(),
        "blockTitle": target.name(),
    }))
}
