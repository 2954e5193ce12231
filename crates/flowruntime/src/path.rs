//! Active path tracking: grows the set of blocks eligible to run as
//! blocks finish and routers/conditions decide.

use crate::graph::WorkflowGraph;
use crate::resolver::instance_of;
use flowcore::{BlockType, ExecutionContext, SourceHandle};
use serde_json::Value;

/// Record decisions and activate successors of the blocks that just ran
pub fn update(graph: &WorkflowGraph<'_>, ctx: &mut ExecutionContext, executed: &[String]) {
    for id in executed {
        let original = ctx.original_id(id).to_string();
        let Some(block) = graph.block(&original) else {
            continue;
        };
        let instance = instance_of(ctx, id).map(|(p, i)| (p.to_string(), i));
        let instance = instance.as_ref().map(|(p, i)| (p.as_str(), *i));

        let mut activated: Vec<String> = Vec::new();

        if ctx.is_failed(id) {
            for conn in graph.outgoing(&original) {
                if conn.handle() == SourceHandle::Error {
                    activated.push(graph.scoped_id(&conn.target, instance));
                }
            }
        } else {
            match block.block_type {
                BlockType::Router => {
                    let chosen = ctx.output(id).and_then(selected_block).filter(|target| {
                        graph.outgoing(&original).iter().any(|c| &c.target == target)
                    });
                    match chosen {
                        Some(target) => {
                            tracing::debug!("Router {} selected {}", id, target);
                            activated.push(graph.scoped_id(&target, instance));
                            ctx.decisions.router.insert(id.clone(), target);
                        }
                        None => tracing::warn!("Router {} made no valid selection", id),
                    }
                }
                BlockType::Condition => {
                    let chosen = ctx
                        .output(id)
                        .and_then(|o| o.get("selectedConditionId"))
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    match chosen {
                        Some(condition_id) => {
                            tracing::debug!("Condition {} selected {}", id, condition_id);
                            for conn in graph.outgoing(&original) {
                                if conn.handle() == SourceHandle::Condition(condition_id.clone()) {
                                    activated.push(graph.scoped_id(&conn.target, instance));
                                }
                            }
                            ctx.decisions.condition.insert(id.clone(), condition_id);
                        }
                        None => tracing::warn!("Condition {} made no selection", id),
                    }
                }
                BlockType::Loop => {
                    let completed = ctx.is_completed(&original);
                    for conn in graph.outgoing(&original) {
                        match conn.handle() {
                            SourceHandle::Error => {}
                            SourceHandle::LoopStart if completed => {}
                            _ => activated.push(conn.target.clone()),
                        }
                    }
                }
                BlockType::Parallel => {
                    let count = ctx.parallels.get(&original).map(|p| p.count).unwrap_or(0);
                    let completed = ctx.is_completed(&original);
                    for conn in graph.outgoing(&original) {
                        match conn.handle() {
                            SourceHandle::Error => {}
                            SourceHandle::ParallelStart if completed => {}
                            SourceHandle::ParallelStart => {
                                for i in 0..count {
                                    activated.push(ctx.register_virtual(&conn.target, &original, i));
                                }
                            }
                            _ => activated.push(conn.target.clone()),
                        }
                    }
                }
                _ => {
                    for conn in graph.outgoing(&original) {
                        if conn.handle() == SourceHandle::Source {
                            activated.push(graph.scoped_id(&conn.target, instance));
                        }
                    }
                }
            }
        }

        for target in activated {
            // Parallel body blocks only ever run under their virtual ids
            if ctx.virtual_block(&target).is_none() && graph.parallel_of(&target).is_some() {
                continue;
            }
            ctx.active_path.insert(target);
        }
    }
}

/// Target id a router put in its `selectedPath`
fn selected_block(output: &flowcore::BlockOutput) -> Option<String> {
    match output.get("selectedPath")? {
        Value::String(id) => Some(id.clone()),
        Value::Object(path) => path
            .get("blockId")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}
