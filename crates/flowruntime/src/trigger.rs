//! Entry block resolution and the entry block's initial state.

use crate::graph::WorkflowGraph;
use flowcore::{Block, BlockOutput, BlockType, WorkflowError};
use serde_json::Value;

/// Find the single block a run starts from
pub fn resolve_entry<'a>(
    graph: &WorkflowGraph<'a>,
    start_block: Option<&str>,
) -> Result<&'a Block, WorkflowError> {
    let entry = match start_block {
        Some(id) => {
            let block = graph
                .block(id)
                .ok_or_else(|| WorkflowError::BlockNotFound(id.to_string()))?;
            if !block.enabled {
                return Err(WorkflowError::InvalidEntryPoint {
                    block_id: id.to_string(),
                    reason: "block is disabled".to_string(),
                });
            }
            block
        }
        None => {
            let candidates: Vec<&Block> = graph
                .blocks()
                .filter(|b| b.enabled && b.is_trigger())
                .collect();
            match candidates.as_slice() {
                [] => return Err(WorkflowError::NoEntryPoint),
                [single] => *single,
                many => {
                    return Err(WorkflowError::MultipleEntryPoints(
                        many.iter().map(|b| b.id.clone()).collect(),
                    ))
                }
            }
        }
    };

    if entry.block_type == BlockType::Starter {
        if !graph.incoming(&entry.id).is_empty() {
            return Err(WorkflowError::InvalidEntryPoint {
                block_id: entry.id.clone(),
                reason: "starter blocks cannot have incoming connections".to_string(),
            });
        }
        if graph.outgoing(&entry.id).is_empty() {
            return Err(WorkflowError::InvalidEntryPoint {
                block_id: entry.id.clone(),
                reason: "starter blocks need at least one outgoing connection".to_string(),
            });
        }
    }
    if graph.parallel_of(&entry.id).is_some() || graph.loop_of(&entry.id).is_some() {
        return Err(WorkflowError::InvalidEntryPoint {
            block_id: entry.id.clone(),
            reason: "entry blocks cannot sit inside a loop or parallel".to_string(),
        });
    }

    Ok(entry)
}

/// Shape the run's input payload by the trigger's declared `input_format`.
///
/// Declared fields are coerced to their type and fall back to the declared
/// default; the raw payload is always kept under `input`.
pub fn entry_output(block: &Block, input: &Value) -> BlockOutput {
    let mut output = BlockOutput::new();
    let payload = input.as_object();

    match block.config.get("input_format").and_then(Value::as_array) {
        Some(fields) if !fields.is_empty() => {
            for field in fields {
                let Some(name) = field.get("name").and_then(Value::as_str) else {
                    continue;
                };
                let declared = field.get("type").and_then(Value::as_str).unwrap_or("any");
                let value = payload
                    .and_then(|p| p.get(name))
                    .cloned()
                    .or_else(|| field.get("value").cloned())
                    .map(|v| coerce(v, declared))
                    .unwrap_or(Value::Null);
                output.insert(name.to_string(), value);
            }
        }
        _ => {
            if let Some(p) = payload {
                output.extend(p.clone());
            }
        }
    }

    output.insert("input".to_string(), input.clone());
    output
}

fn coerce(value: Value, declared: &str) -> Value {
    match (declared, value) {
        ("number", Value::String(s)) => parse_number(s.trim())
            .map(Value::Number)
            .unwrap_or(Value::String(s)),
        ("boolean", Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::String(s),
        },
        ("string", v @ (Value::Number(_) | Value::Bool(_))) => Value::String(v.to_string()),
        ("object" | "array", Value::String(s)) => {
            serde_json::from_str(&s).unwrap_or(Value::String(s))
        }
        (_, v) => v,
    }
}

/// Integral text stays integral; anything else goes through `f64`
fn parse_number(raw: &str) -> Option<serde_json::Number> {
    if let Ok(n) = raw.parse::<i64>() {
        return Some(n.into());
    }
    if let Ok(n) = raw.parse::<u64>() {
        return Some(n.into());
    }
    raw.parse::<f64>().ok().and_then(serde_json::Number::from_f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcore::Workflow;
    use serde_json::json;

    #[test]
    fn exposes_payload_fields_without_a_format() {
        let block = Block::new("start", BlockType::Starter);
        let out = entry_output(&block, &json!({"x": 1}));

        assert_eq!(out["x"], json!(1));
        assert_eq!(out["input"], json!({"x": 1}));
    }

    #[test]
    fn coerces_declared_fields() {
        let block = Block::new("start", BlockType::Starter).with_config(
            "input_format",
            json!([
                {"name": "count", "type": "number"},
                {"name": "flag", "type": "boolean", "value": "false"},
            ]),
        );
        let out = entry_output(&block, &json!({"count": "3", "ignored": true}));

        assert_eq!(out["count"], json!(3));
        assert_eq!(out["flag"], json!(false));
        assert!(!out.contains_key("ignored"));
    }

    #[test]
    fn rejects_multiple_triggers() {
        let mut wf = Workflow::new("wf");
        wf.add_block(Block::new("a", BlockType::Starter));
        wf.add_block(Block::new("b", BlockType::Trigger));
        wf.add_block(Block::new("c", BlockType::Function));
        wf.connect("a", "c");
        wf.connect("b", "c");
        let graph = WorkflowGraph::build(&wf).unwrap();

        assert!(matches!(
            resolve_entry(&graph, None),
            Err(WorkflowError::MultipleEntryPoints(_))
        ));
    }

    #[test]
    fn starter_needs_an_outgoing_edge() {
        let mut wf = Workflow::new("wf");
        wf.add_block(Block::new("a", BlockType::Starter));
        let graph = WorkflowGraph::build(&wf).unwrap();

        assert!(matches!(
            resolve_entry(&graph, None),
            Err(WorkflowError::InvalidEntryPoint { .. })
        ));
    }
}
