//! Parallel manager: fans a region out into independent virtual instances
//! and aggregates them once every instance has settled.

use crate::graph::WorkflowGraph;
use crate::resolver::{can_still_run, is_ready, pending_blocks};
use flowcore::{virtual_block_id, BlockOutput, ExecutionContext, ParallelRegion, ParallelState};
use serde_json::Value;
use std::collections::HashSet;

/// Create per-instance bookkeeping right after the parallel block ran.
///
/// Returns true when the region has no instances and completed at once.
pub fn initialize(ctx: &mut ExecutionContext, region: &ParallelRegion) -> bool {
    let Some(output) = ctx.output(&region.id) else {
        return false;
    };
    let count = output.get("count").and_then(Value::as_u64).unwrap_or(0) as usize;
    let items = output.get("items").and_then(Value::as_array).cloned();

    tracing::debug!("Parallel {} fans out into {} instances", region.id, count);
    ctx.parallels.insert(
        region.id.clone(),
        ParallelState {
            count,
            items,
            ..Default::default()
        },
    );
    for i in 0..count {
        for node in &region.nodes {
            ctx.register_virtual(node, &region.id, i);
        }
    }

    if count == 0 {
        complete(ctx, &region.id);
        return true;
    }
    false
}

/// Virtual ids of every instance node that is ready to run
pub fn ready_instances(
    graph: &WorkflowGraph<'_>,
    ctx: &ExecutionContext,
    pending: &HashSet<String>,
) -> Vec<String> {
    let mut ready = Vec::new();

    for region in graph.workflow.parallels.values() {
        if !ctx.is_executed(&region.id) || ctx.is_completed(&region.id) {
            continue;
        }
        let Some(state) = ctx.parallels.get(&region.id) else {
            continue;
        };
        for i in 0..state.count {
            ready.extend(ready_in_instance(graph, ctx, region, i, pending));
        }
    }

    ready
}

fn ready_in_instance(
    graph: &WorkflowGraph<'_>,
    ctx: &ExecutionContext,
    region: &ParallelRegion,
    index: usize,
    pending: &HashSet<String>,
) -> Vec<String> {
    region
        .nodes
        .iter()
        .filter(|node| graph.block(node).is_some_and(|b| b.enabled))
        .map(|node| virtual_block_id(node, &region.id, index))
        .filter(|vid| ctx.is_active(vid) && !ctx.is_executed(vid))
        .filter(|vid| is_ready(graph, ctx, vid, pending))
        .collect()
}

/// An instance body block can still run, possibly after blocks outside
/// the region it depends on
fn instance_running(
    graph: &WorkflowGraph<'_>,
    ctx: &ExecutionContext,
    region: &ParallelRegion,
    index: usize,
    pending: &HashSet<String>,
) -> bool {
    region
        .nodes
        .iter()
        .filter(|node| graph.block(node).is_some_and(|b| b.enabled))
        .map(|node| virtual_block_id(node, &region.id, index))
        .any(|vid| can_still_run(graph, ctx, &vid, pending))
}

/// Close finished instances and regions; returns ids of regions that
/// completed
pub fn update_completion(graph: &WorkflowGraph<'_>, ctx: &mut ExecutionContext) -> Vec<String> {
    let mut completed = Vec::new();
    let pending = pending_blocks(graph, ctx);

    for region in graph.workflow.parallels.values() {
        if !ctx.is_executed(&region.id) || ctx.is_completed(&region.id) {
            continue;
        }
        let Some(count) = ctx.parallels.get(&region.id).map(|s| s.count) else {
            continue;
        };

        for i in 0..count {
            let done = ctx
                .parallels
                .get(&region.id)
                .is_some_and(|s| s.completed_instances.contains(&i));
            if done || instance_running(graph, ctx, region, i, &pending) {
                continue;
            }
            let results = instance_results(ctx, region, i);
            if let Some(state) = ctx.parallels.get_mut(&region.id) {
                state.completed_instances.insert(i);
                state.results.insert(i, results);
            }
            tracing::debug!("Parallel {} instance {} finished", region.id, i);
        }

        if ctx.parallels.get(&region.id).is_some_and(ParallelState::is_complete) {
            complete(ctx, &region.id);
            tracing::info!("Parallel {} completed with {} instances", region.id, count);
            completed.push(region.id.clone());
        }
    }

    completed
}

fn instance_results(ctx: &ExecutionContext, region: &ParallelRegion, index: usize) -> BlockOutput {
    region
        .nodes
        .iter()
        .filter_map(|node| {
            let vid = virtual_block_id(node, &region.id, index);
            if !ctx.is_executed(&vid) {
                return None;
            }
            ctx.output(&vid)
                .map(|o| (node.clone(), Value::Object(o.clone())))
        })
        .collect()
}

/// Mark the region completed and expose results in instance order
fn complete(ctx: &mut ExecutionContext, parallel_id: &str) {
    ctx.completed_regions.insert(parallel_id.to_string());

    let results: Vec<Value> = ctx
        .parallels
        .get(parallel_id)
        .map(|s| s.results.values().cloned().map(Value::Object).collect())
        .unwrap_or_default();
    if let Some(state) = ctx.block_states.get_mut(parallel_id) {
        state.output.insert("results".to_string(), Value::Array(results));
        state.output.insert("completed".to_string(), Value::Bool(true));
    }
}
