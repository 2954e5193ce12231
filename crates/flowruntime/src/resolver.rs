//! Dependency resolution: which blocks may run next.

use crate::graph::WorkflowGraph;
use crate::parallels;
use flowcore::{BlockType, Connection, ExecutionContext, SourceHandle};
use std::collections::{HashSet, VecDeque};

/// Next layer of ready blocks: real blocks first in definition order,
/// then ready parallel instances.
///
/// Pure with respect to the context: calling it twice without executing
/// anything yields the same layer.
pub fn next_layer(graph: &WorkflowGraph<'_>, ctx: &ExecutionContext) -> Vec<String> {
    let pending = pending_blocks(graph, ctx);

    let mut layer: Vec<String> = graph
        .blocks()
        .filter(|b| b.enabled && graph.parallel_of(&b.id).is_none())
        .filter(|b| ctx.is_active(&b.id) && !ctx.is_executed(&b.id))
        .filter(|b| is_ready(graph, ctx, &b.id, &pending))
        .map(|b| b.id.clone())
        .collect();

    layer.extend(parallels::ready_instances(graph, ctx, &pending));
    layer
}

/// Whether every incoming connection of the (real or virtual) block is satisfied
pub fn is_ready(
    graph: &WorkflowGraph<'_>,
    ctx: &ExecutionContext,
    id: &str,
    pending: &HashSet<String>,
) -> bool {
    let original = ctx.original_id(id);
    let instance = instance_of(ctx, id);

    graph
        .incoming(original)
        .iter()
        .all(|conn| edge_satisfied(graph, ctx, conn, instance, pending))
}

/// Whether the (real or virtual) block is on the active path and may still
/// execute: every incoming connection is satisfied or its source can still
/// fire it.
pub fn can_still_run(
    graph: &WorkflowGraph<'_>,
    ctx: &ExecutionContext,
    id: &str,
    pending: &HashSet<String>,
) -> bool {
    if !ctx.is_active(id) || ctx.is_executed(id) {
        return false;
    }
    let original = ctx.original_id(id);
    let instance = instance_of(ctx, id);

    graph.incoming(original).iter().all(|conn| {
        if edge_satisfied(graph, ctx, conn, instance, pending) {
            return true;
        }
        let source = graph.scoped_id(&conn.source, instance);
        pending.contains(&source) && edge_can_fire(graph, ctx, &source, conn)
    })
}

/// (parallel id, instance index) a virtual id belongs to
pub fn instance_of<'c>(ctx: &'c ExecutionContext, id: &str) -> Option<(&'c str, usize)> {
    ctx.virtual_block(id)
        .map(|v| (v.parallel_id.as_str(), v.iteration))
}

fn edge_satisfied(
    graph: &WorkflowGraph<'_>,
    ctx: &ExecutionContext,
    conn: &Connection,
    instance: Option<(&str, usize)>,
    pending: &HashSet<String>,
) -> bool {
    let source = graph.scoped_id(&conn.source, instance);

    // Abandoned branch: the source can no longer run, so it must not block.
    if !ctx.is_active(&source) && !pending.contains(&source) {
        return true;
    }

    let executed = ctx.is_executed(&source);
    match conn.handle() {
        SourceHandle::LoopStart | SourceHandle::ParallelStart => executed,
        SourceHandle::LoopEnd | SourceHandle::ParallelEnd => ctx.is_completed(&conn.source),
        SourceHandle::Error => executed && ctx.is_failed(&source),
        // A non-selected condition id does not block, it just never activates
        SourceHandle::Condition(_) => executed && ctx.decisions.condition.contains_key(&source),
        SourceHandle::Source => {
            if is_router(graph, &conn.source) {
                executed
                    && ctx
                        .decisions
                        .router
                        .get(&source)
                        .is_some_and(|chosen| *chosen == conn.target)
            } else {
                executed && !ctx.is_failed(&source)
            }
        }
    }
}

fn is_router(graph: &WorkflowGraph<'_>, id: &str) -> bool {
    graph
        .block(id)
        .is_some_and(|b| b.block_type == BlockType::Router)
}

/// Whether an edge out of `id` can still carry control, given what `id`
/// already did
fn edge_can_fire(graph: &WorkflowGraph<'_>, ctx: &ExecutionContext, id: &str, conn: &Connection) -> bool {
    if !ctx.is_executed(id) {
        return true;
    }
    let failed = ctx.is_failed(id);
    match conn.handle() {
        SourceHandle::Error => failed,
        SourceHandle::Condition(cid) => ctx.decisions.condition.get(id) == Some(&cid),
        SourceHandle::Source if is_router(graph, &conn.source) => {
            ctx.decisions.router.get(id) == Some(&conn.target)
        }
        SourceHandle::Source => !failed,
        SourceHandle::LoopStart | SourceHandle::ParallelStart => !ctx.is_completed(&conn.source),
        SourceHandle::LoopEnd | SourceHandle::ParallelEnd => true,
    }
}

/// Every id that may still execute: unexecuted active blocks, unfinished
/// regions, and everything downstream of them along edges that can fire.
///
/// A connection whose source is neither active nor pending belongs to an
/// abandoned branch.
pub fn pending_blocks(graph: &WorkflowGraph<'_>, ctx: &ExecutionContext) -> HashSet<String> {
    let mut queue: VecDeque<String> = ctx
        .active_path
        .iter()
        .filter(|id| {
            !ctx.is_executed(id)
                || (is_region_block(graph, ctx.original_id(id)) && !ctx.is_completed(id))
        })
        .cloned()
        .collect();

    let mut pending = HashSet::new();
    while let Some(id) = queue.pop_front() {
        if !pending.insert(id.clone()) {
            continue;
        }
        let original = ctx.original_id(&id).to_string();
        let instance = instance_of(ctx, &id);

        for conn in graph.outgoing(&original) {
            if !edge_can_fire(graph, ctx, &id, conn) {
                continue;
            }
            // Body nodes of a parallel only ever run under virtual ids
            if instance.is_none() && graph.parallel_of(&conn.target).is_some() {
                continue;
            }
            let target = graph.scoped_id(&conn.target, instance);
            if !pending.contains(&target) {
                queue.push_back(target);
            }
        }
    }
    pending
}

fn is_region_block(graph: &WorkflowGraph<'_>, id: &str) -> bool {
    graph
        .block(id)
        .is_some_and(|b| matches!(b.block_type, BlockType::Loop | BlockType::Parallel))
}
