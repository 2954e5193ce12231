//! Loop manager: re-arms a loop body once per iteration.

use crate::graph::WorkflowGraph;
use crate::resolver::{can_still_run, pending_blocks};
use flowcore::{BlockOutput, ExecutionContext, LoopRegion, LoopState, SourceHandle};
use serde_json::Value;

/// What the loop manager did after a layer
#[derive(Debug, Clone, PartialEq)]
pub enum LoopProgress {
    NextIteration { loop_id: String, iteration: usize },
    Completed { loop_id: String },
}

/// Create the loop state right after the loop block itself ran
pub fn initialize(ctx: &mut ExecutionContext, loop_id: &str) -> Option<LoopProgress> {
    let output = ctx.output(loop_id)?;
    let max_iterations = output
        .get("maxIterations")
        .and_then(Value::as_u64)
        .unwrap_or(0) as usize;
    let items = output
        .get("items")
        .and_then(Value::as_array)
        .cloned();

    tracing::debug!("Loop {} starts with {} iterations", loop_id, max_iterations);
    ctx.loops.insert(
        loop_id.to_string(),
        LoopState {
            iteration: 0,
            max_iterations,
            items,
            results: Default::default(),
        },
    );

    if max_iterations == 0 {
        complete(ctx, loop_id);
        return Some(LoopProgress::Completed {
            loop_id: loop_id.to_string(),
        });
    }
    None
}

/// Advance every loop whose current iteration has nothing left to run
pub fn advance(graph: &WorkflowGraph<'_>, ctx: &mut ExecutionContext) -> Vec<LoopProgress> {
    let mut progress = Vec::new();

    for region in graph.workflow.loops.values() {
        if !ctx.is_executed(&region.id) || ctx.is_completed(&region.id) {
            continue;
        }
        if !ctx.loops.contains_key(&region.id) || iteration_running(graph, ctx, region) {
            continue;
        }

        let results = iteration_results(ctx, region);
        let Some(state) = ctx.loops.get_mut(&region.id) else {
            continue;
        };
        let finished = state.iteration;
        state.results.insert(finished, results);
        let has_next = finished + 1 < state.max_iterations;
        if has_next {
            state.iteration = finished + 1;
        }

        if has_next {
            rearm(graph, ctx, region);
            tracing::debug!("Loop {} starts iteration {}", region.id, finished + 1);
            progress.push(LoopProgress::NextIteration {
                loop_id: region.id.clone(),
                iteration: finished + 1,
            });
        } else {
            complete(ctx, &region.id);
            tracing::info!("Loop {} completed after {} iterations", region.id, finished + 1);
            progress.push(LoopProgress::Completed {
                loop_id: region.id.clone(),
            });
        }
    }

    progress
}

/// A body block can still run in this iteration, possibly after blocks
/// outside the loop it depends on
fn iteration_running(graph: &WorkflowGraph<'_>, ctx: &ExecutionContext, region: &LoopRegion) -> bool {
    let pending = pending_blocks(graph, ctx);
    region.nodes.iter().any(|node| {
        graph.block(node).is_some_and(|b| b.enabled) && can_still_run(graph, ctx, node, &pending)
    })
}

fn iteration_results(ctx: &ExecutionContext, region: &LoopRegion) -> BlockOutput {
    region
        .nodes
        .iter()
        .filter(|node| ctx.is_executed(node))
        .filter_map(|node| {
            ctx.output(node)
                .map(|o| (node.clone(), Value::Object(o.clone())))
        })
        .collect()
}

/// Clear the body so the resolver admits it again, then re-enter it
fn rearm(graph: &WorkflowGraph<'_>, ctx: &mut ExecutionContext, region: &LoopRegion) {
    for node in &region.nodes {
        ctx.reset_block(node);
    }
    for conn in graph.outgoing(&region.id) {
        if conn.handle() == SourceHandle::LoopStart {
            ctx.active_path.insert(conn.target.clone());
        }
    }
}

/// Mark the loop completed and expose its per-iteration results on the
/// loop block's state
fn complete(ctx: &mut ExecutionContext, loop_id: &str) {
    ctx.completed_regions.insert(loop_id.to_string());

    let results: Vec<Value> = ctx
        .loops
        .get(loop_id)
        .map(|s| s.results.values().cloned().map(Value::Object).collect())
        .unwrap_or_default();
    if let Some(state) = ctx.block_states.get_mut(loop_id) {
        state.output.insert("results".to_string(), Value::Array(results));
        state.output.insert("completed".to_string(), Value::Bool(true));
    }
}
