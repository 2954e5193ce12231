use crate::graph::WorkflowGraph;
use crate::loops::{self, LoopProgress};
use crate::registry::HandlerRegistry;
use crate::resolver::next_layer;
use crate::runtime::RuntimeConfig;
use crate::{parallels, path, streaming, trigger};
use chrono::{DateTime, Utc};
use flowcore::{
    Block, BlockContext, BlockError, BlockHandler, BlockLog, BlockOutput, BlockState, BlockType,
    Connection, EventBus, ExecutionContext, ExecutionEvent, ExecutionId, ExecutionObserver,
    FlowError, HandlerOutput, InputResolver, SourceHandle, Workflow, WorkflowId,
};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

/// Drives a workflow from its entry block to completion, one layer at a time
pub struct WorkflowExecutor {
    config: RuntimeConfig,
}

/// Per-run options
#[derive(Clone, Default)]
pub struct ExecutionOptions {
    /// Payload handed to the entry block
    pub input: Value,
    /// Explicit entry block, instead of the workflow's single trigger
    pub start_block: Option<String>,
    pub environment_variables: HashMap<String, String>,
    pub workflow_variables: Map<String, Value>,
    /// `blockId.field` selections applied to caller-facing streams
    pub selected_outputs: Vec<String>,
    /// Return before every layer instead of executing it
    pub debug: bool,
    pub cancellation: CancellationToken,
    pub observer: Option<Arc<dyn ExecutionObserver>>,
}

impl ExecutionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_start_block(mut self, block_id: impl Into<String>) -> Self {
        self.start_block = Some(block_id.into());
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment_variables.insert(name.into(), value.into());
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.workflow_variables.insert(name.into(), value);
        self
    }

    pub fn with_selected_outputs(mut self, selected: Vec<String>) -> Self {
        self.selected_outputs = selected;
        self
    }

    pub fn debug(mut self) -> Self {
        self.debug = true;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }
}

/// Result of workflow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    /// Output of the last block that finished successfully
    pub output: BlockOutput,
    pub error: Option<String>,
    pub logs: Vec<BlockLog>,
    pub metadata: ExecutionMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub connections: Vec<Connection>,
    pub completed_blocks: usize,
    pub total_blocks: usize,
    pub is_debug_session: bool,
    /// Layer waiting for `continue_execution` in debug mode
    pub pending_blocks: Vec<String>,
    /// Paused run state, present only for debug sessions
    pub context: Option<ExecutionContext>,
    pub cancelled: bool,
}

impl ExecutionResult {
    /// Output of one block, by real or virtual id
    pub fn block_output(&self, block_id: &str) -> Option<&BlockOutput> {
        self.metadata
            .context
            .as_ref()
            .and_then(|ctx| ctx.output(block_id))
            .or_else(|| {
                self.logs
                    .iter()
                    .rev()
                    .find(|l| l.block_id == block_id)
                    .and_then(|l| l.output.as_ref())
            })
    }

    /// How many times a block ran, counting every virtual instance
    pub fn executions_of(&self, block_id: &str) -> usize {
        self.logs
            .iter()
            .filter(|l| {
                l.block_id == block_id || l.block_id.starts_with(&format!("{}_parallel_", block_id))
            })
            .count()
    }
}

struct BlockOutcome<'a> {
    id: String,
    block: &'a Block,
    state: BlockState,
    log: BlockLog,
}

impl WorkflowExecutor {
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Execute a workflow.
    ///
    /// Only validation failures return `Err`; every failure once the run
    /// has started is reported through the returned result.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        registry: &HandlerRegistry,
        resolver: &dyn InputResolver,
        event_bus: &EventBus,
        options: ExecutionOptions,
    ) -> Result<ExecutionResult, FlowError> {
        let graph = WorkflowGraph::build(workflow)?;
        let entry = trigger::resolve_entry(&graph, options.start_block.as_deref())?;

        let mut ctx = ExecutionContext::new(workflow.id, entry.id.as_str());
        ctx.environment_variables = options.environment_variables.clone();
        ctx.workflow_variables = options.workflow_variables.clone();

        tracing::info!(
            "Starting workflow execution: {} ({}) from {}",
            workflow.name,
            ctx.execution_id,
            entry.id
        );
        event_bus.emit(ExecutionEvent::WorkflowStarted {
            execution_id: ctx.execution_id,
            workflow_id: workflow.id,
            entry_block: entry.id.clone(),
            timestamp: Utc::now(),
        });

        let output = trigger::entry_output(entry, &options.input);
        let now = Utc::now();
        ctx.block_logs.push(BlockLog {
            block_id: entry.id.clone(),
            block_name: entry.name().to_string(),
            block_type: entry.block_type,
            started_at: now,
            ended_at: now,
            duration_ms: 0,
            success: true,
            input: options.input.as_object().cloned(),
            output: Some(output.clone()),
            error: None,
        });
        ctx.set_state(entry.id.as_str(), BlockState::success(output, 0));
        ctx.active_path.insert(entry.id.clone());
        self.after_layer(&graph, &mut ctx, event_bus, &[entry.id.clone()]);

        Ok(self
            .run(&graph, registry, resolver, event_bus, ctx, &options)
            .await)
    }

    /// Resume a debug session by executing exactly `block_ids` out of the
    /// pending layer, then pause again before the next layer.
    #[allow(clippy::too_many_arguments)]
    pub async fn continue_execution(
        &self,
        workflow: &Workflow,
        registry: &HandlerRegistry,
        resolver: &dyn InputResolver,
        event_bus: &EventBus,
        mut ctx: ExecutionContext,
        block_ids: &[String],
        options: ExecutionOptions,
    ) -> Result<ExecutionResult, FlowError> {
        let graph = WorkflowGraph::build(workflow)?;

        if ctx.workflow_id != workflow.id {
            return Err(FlowError::Debug(format!(
                "context belongs to workflow {}, not {}",
                ctx.workflow_id, workflow.id
            )));
        }
        if ctx.pending_blocks.is_empty() {
            return Err(FlowError::Debug("no layer is pending".to_string()));
        }
        if block_ids.is_empty() {
            return Err(FlowError::Debug("no blocks requested".to_string()));
        }
        if let Some(unknown) = block_ids.iter().find(|id| !ctx.pending_blocks.contains(id)) {
            return Err(FlowError::Debug(format!(
                "block '{}' is not in the pending layer {:?}",
                unknown, ctx.pending_blocks
            )));
        }

        let options = ExecutionOptions {
            debug: true,
            ..options
        };
        ctx.pending_blocks.clear();

        if options.cancellation.is_cancelled() {
            return Ok(self.cancelled(&graph, ctx, event_bus));
        }
        if let Err(e) = self
            .execute_layer(&graph, registry, resolver, event_bus, &mut ctx, block_ids, &options)
            .await
        {
            return Ok(self.finish(&graph, ctx, event_bus, Some(e)));
        }

        Ok(self
            .run(&graph, registry, resolver, event_bus, ctx, &options)
            .await)
    }

    async fn run(
        &self,
        graph: &WorkflowGraph<'_>,
        registry: &HandlerRegistry,
        resolver: &dyn InputResolver,
        event_bus: &EventBus,
        mut ctx: ExecutionContext,
        options: &ExecutionOptions,
    ) -> ExecutionResult {
        let mut iteration = 0;

        loop {
            if options.cancellation.is_cancelled() {
                return self.cancelled(graph, ctx, event_bus);
            }

            iteration += 1;
            if iteration > self.config.max_iterations {
                let error = FlowError::IterationLimit(self.config.max_iterations);
                return self.finish(graph, ctx, event_bus, Some(error));
            }

            let layer = next_layer(graph, &ctx);
            if layer.is_empty() {
                // Regions may still close once nothing else can run
                if self.settle(graph, &mut ctx, event_bus) {
                    continue;
                }
                return self.finish(graph, ctx, event_bus, None);
            }

            if options.debug {
                return self.pending(graph, ctx, event_bus, layer);
            }

            if let Err(e) = self
                .execute_layer(graph, registry, resolver, event_bus, &mut ctx, &layer, options)
                .await
            {
                return self.finish(graph, ctx, event_bus, Some(e));
            }
        }
    }

    /// Run one layer to completion, then apply its writes in layer order.
    ///
    /// Blocks inside the layer only read the context; states, logs, path
    /// changes and region progress are applied after every block settled.
    #[allow(clippy::too_many_arguments)]
    async fn execute_layer(
        &self,
        graph: &WorkflowGraph<'_>,
        registry: &HandlerRegistry,
        resolver: &dyn InputResolver,
        event_bus: &EventBus,
        ctx: &mut ExecutionContext,
        layer: &[String],
        options: &ExecutionOptions,
    ) -> Result<(), FlowError> {
        tracing::debug!("Executing layer: {:?}", layer);
        event_bus.emit(ExecutionEvent::LayerStarted {
            execution_id: ctx.execution_id,
            blocks: layer.to_vec(),
            timestamp: Utc::now(),
        });

        let mut jobs = Vec::with_capacity(layer.len());
        for id in layer {
            let original = ctx.original_id(id);
            let block = graph
                .block(original)
                .ok_or_else(|| flowcore::WorkflowError::BlockNotFound(original.to_string()))?;
            let handler = registry.find(block).ok_or_else(|| FlowError::NoHandler {
                block_id: block.id.clone(),
                block_type: block.block_type.to_string(),
            })?;
            jobs.push((id.clone(), block, handler));
        }

        let timeout_ms = graph
            .workflow
            .settings
            .block_timeout_ms
            .or(self.config.block_timeout_ms);

        let outcomes: Vec<BlockOutcome<'_>> = {
            let shared: &ExecutionContext = &*ctx;
            stream::iter(jobs.into_iter().map(move |(id, block, handler)| {
                self.execute_block(
                    graph, shared, resolver, event_bus, id, block, handler, timeout_ms, options,
                )
            }))
            .buffered(self.config.max_parallel_blocks.max(1))
            .collect()
            .await
        };

        let mut executed = Vec::with_capacity(outcomes.len());
        let mut unhandled = Vec::new();

        for outcome in outcomes {
            let BlockOutcome {
                id,
                block,
                state,
                log,
            } = outcome;

            match &state.error {
                None => {
                    tracing::info!("Block {} completed in {}ms", id, state.execution_time_ms);
                    if let Some(observer) = &options.observer {
                        if let Err(e) = observer.on_block_complete(&id, &state.output).await {
                            tracing::warn!("Completion callback for block {} failed: {}", id, e);
                        }
                    }
                    event_bus.emit(ExecutionEvent::BlockCompleted {
                        execution_id: ctx.execution_id,
                        block_id: id.clone(),
                        output: state.output.clone(),
                        duration_ms: state.execution_time_ms,
                        timestamp: Utc::now(),
                    });
                }
                Some(error) => {
                    let handled = has_error_path(graph, block);
                    if handled {
                        tracing::warn!("Block {} failed, taking its error path: {}", id, error);
                    } else {
                        tracing::error!("Block {} failed: {}", id, error);
                        unhandled.push(format!("Block '{}' failed: {}", id, error));
                    }
                    event_bus.emit(ExecutionEvent::BlockFailed {
                        execution_id: ctx.execution_id,
                        block_id: id.clone(),
                        error: error.clone(),
                        handled,
                        timestamp: Utc::now(),
                    });
                }
            }

            ctx.block_logs.push(log);
            ctx.set_state(id.as_str(), state);
            executed.push(id);
        }

        if !unhandled.is_empty() {
            return Err(FlowError::Execution(unhandled.join("; ")));
        }

        self.after_layer(graph, ctx, event_bus, &executed);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_block<'a>(
        &self,
        graph: &WorkflowGraph<'a>,
        ctx: &ExecutionContext,
        resolver: &dyn InputResolver,
        event_bus: &EventBus,
        id: String,
        block: &'a Block,
        handler: Arc<dyn BlockHandler>,
        timeout_ms: Option<u64>,
        options: &ExecutionOptions,
    ) -> BlockOutcome<'a> {
        let started_at = Utc::now();
        let start = Instant::now();

        tracing::info!("Executing block {} ({})", id, block.block_type);
        event_bus.emit(ExecutionEvent::BlockStarted {
            execution_id: ctx.execution_id,
            block_id: id.clone(),
            block_type: block.block_type.to_string(),
            timestamp: started_at,
        });

        let scope = ctx.scope_for(graph.workflow, &id);
        let (input, (output, error)) =
            match resolver.resolve_inputs(block, graph.workflow, ctx, &scope) {
                Err(e) => (None, (BlockOutput::new(), Some(e))),
                Ok(inputs) => {
                    let block_ctx = BlockContext {
                        block,
                        execution_block_id: id.clone(),
                        inputs: inputs.clone(),
                        scope,
                        workflow: graph.workflow,
                        execution: ctx,
                        resolver,
                        events: event_bus.create_emitter(ctx.execution_id, &id),
                        cancellation: options.cancellation.child_token(),
                    };
                    let run = invoke(handler.as_ref(), block_ctx, block, options);
                    let result = match timeout_ms {
                        Some(millis) => timeout(Duration::from_millis(millis), run)
                            .await
                            .unwrap_or_else(|_| {
                                (BlockOutput::new(), Some(BlockError::Timeout { millis }))
                            }),
                        None => run.await,
                    };
                    (Some(inputs), result)
                }
            };

        let duration_ms = start.elapsed().as_millis() as u64;
        let error = error.map(|e| e.to_string());
        let state = match &error {
            None => BlockState::success(output.clone(), duration_ms),
            Some(e) => BlockState::failure(output.clone(), e.clone(), duration_ms),
        };
        let log = BlockLog {
            block_id: id.clone(),
            block_name: block.name().to_string(),
            block_type: block.block_type,
            started_at,
            ended_at: Utc::now(),
            duration_ms,
            success: error.is_none(),
            input,
            output: Some(output),
            error,
        };

        BlockOutcome {
            id,
            block,
            state,
            log,
        }
    }

    /// Region setup, path tracking and region progress for blocks that
    /// just finished
    fn after_layer(
        &self,
        graph: &WorkflowGraph<'_>,
        ctx: &mut ExecutionContext,
        event_bus: &EventBus,
        executed: &[String],
    ) {
        let execution_id = ctx.execution_id;

        for id in executed {
            if ctx.is_failed(id) || ctx.virtual_block(id).is_some() {
                continue;
            }
            match graph.block(id).map(|b| b.block_type) {
                Some(BlockType::Loop) => match loops::initialize(ctx, id) {
                    Some(progress) => report_loop(event_bus, execution_id, &progress),
                    None => report_loop(
                        event_bus,
                        execution_id,
                        &LoopProgress::NextIteration {
                            loop_id: id.clone(),
                            iteration: 0,
                        },
                    ),
                },
                Some(BlockType::Parallel) => {
                    let Some(region) = graph.workflow.parallels.get(id) else {
                        continue;
                    };
                    if parallels::initialize(ctx, region) {
                        event_bus.emit(ExecutionEvent::RegionCompleted {
                            execution_id,
                            region_id: id.clone(),
                            timestamp: Utc::now(),
                        });
                    }
                }
                _ => {}
            }
        }

        path::update(graph, ctx, executed);
        self.settle(graph, ctx, event_bus);
    }

    /// Advance loops and close parallel regions; true when anything moved
    fn settle(
        &self,
        graph: &WorkflowGraph<'_>,
        ctx: &mut ExecutionContext,
        event_bus: &EventBus,
    ) -> bool {
        let execution_id = ctx.execution_id;
        let progress = loops::advance(graph, ctx);
        let completed = parallels::update_completion(graph, ctx);

        for p in &progress {
            report_loop(event_bus, execution_id, p);
        }
        for region_id in &completed {
            event_bus.emit(ExecutionEvent::RegionCompleted {
                execution_id,
                region_id: region_id.clone(),
                timestamp: Utc::now(),
            });
        }

        !progress.is_empty() || !completed.is_empty()
    }

    fn pending(
        &self,
        graph: &WorkflowGraph<'_>,
        mut ctx: ExecutionContext,
        event_bus: &EventBus,
        layer: Vec<String>,
    ) -> ExecutionResult {
        tracing::info!("Debug session paused before layer {:?}", layer);
        event_bus.emit(ExecutionEvent::LayerPending {
            execution_id: ctx.execution_id,
            blocks: layer.clone(),
            timestamp: Utc::now(),
        });

        ctx.pending_blocks = layer.clone();
        let mut metadata = self.metadata(graph, &ctx);
        metadata.is_debug_session = true;
        metadata.pending_blocks = layer;

        ExecutionResult {
            success: true,
            output: final_output(&ctx),
            error: None,
            logs: ctx.block_logs.clone(),
            metadata: ExecutionMetadata {
                context: Some(ctx),
                ..metadata
            },
        }
    }

    fn cancelled(
        &self,
        graph: &WorkflowGraph<'_>,
        ctx: ExecutionContext,
        event_bus: &EventBus,
    ) -> ExecutionResult {
        tracing::info!("Workflow execution {} was cancelled", ctx.execution_id);
        event_bus.emit(ExecutionEvent::WorkflowCancelled {
            execution_id: ctx.execution_id,
            timestamp: Utc::now(),
        });

        let mut metadata = self.metadata(graph, &ctx);
        metadata.cancelled = true;

        ExecutionResult {
            success: false,
            output: BlockOutput::new(),
            error: Some(FlowError::Cancelled.to_string()),
            logs: ctx.block_logs,
            metadata,
        }
    }

    fn finish(
        &self,
        graph: &WorkflowGraph<'_>,
        ctx: ExecutionContext,
        event_bus: &EventBus,
        error: Option<FlowError>,
    ) -> ExecutionResult {
        let metadata = self.metadata(graph, &ctx);
        let success = error.is_none();

        match &error {
            None => tracing::info!(
                "Workflow execution {} completed in {}ms",
                ctx.execution_id,
                metadata.duration_ms
            ),
            Some(e) => tracing::error!("Workflow execution {} failed: {}", ctx.execution_id, e),
        }
        event_bus.emit(ExecutionEvent::WorkflowCompleted {
            execution_id: ctx.execution_id,
            success,
            duration_ms: metadata.duration_ms,
            timestamp: Utc::now(),
        });

        ExecutionResult {
            success,
            output: if success {
                final_output(&ctx)
            } else {
                BlockOutput::new()
            },
            error: error.map(|e| e.to_string()),
            logs: ctx.block_logs,
            metadata,
        }
    }

    fn metadata(&self, graph: &WorkflowGraph<'_>, ctx: &ExecutionContext) -> ExecutionMetadata {
        let ended_at = Utc::now();
        ExecutionMetadata {
            execution_id: ctx.execution_id,
            workflow_id: ctx.workflow_id,
            started_at: ctx.started_at,
            ended_at,
            duration_ms: (ended_at - ctx.started_at).num_milliseconds().max(0) as u64,
            connections: graph.workflow.connections.clone(),
            completed_blocks: ctx.executed_blocks.len(),
            total_blocks: graph.workflow.blocks.len(),
            is_debug_session: false,
            pending_blocks: Vec::new(),
            context: None,
            cancelled: false,
        }
    }
}

/// Call the handler and turn a live stream into its finalized output
async fn invoke(
    handler: &dyn BlockHandler,
    ctx: BlockContext<'_>,
    block: &Block,
    options: &ExecutionOptions,
) -> (BlockOutput, Option<BlockError>) {
    match handler.execute(ctx).await {
        Ok(HandlerOutput::Output(output)) => (output, None),
        Ok(HandlerOutput::Stream(execution)) => {
            streaming::consume(
                execution,
                block,
                &options.selected_outputs,
                options.observer.as_ref(),
            )
            .await
        }
        Err(e) => (BlockOutput::new(), Some(e)),
    }
}

/// A failure is recovered locally only through an outgoing error edge
fn has_error_path(graph: &WorkflowGraph<'_>, block: &Block) -> bool {
    block.block_type.supports_error_edge()
        && graph
            .outgoing(&block.id)
            .iter()
            .any(|c| c.handle() == SourceHandle::Error)
}

fn report_loop(event_bus: &EventBus, execution_id: ExecutionId, progress: &LoopProgress) {
    let event = match progress {
        LoopProgress::NextIteration { loop_id, iteration } => ExecutionEvent::LoopIteration {
            execution_id,
            loop_id: loop_id.clone(),
            iteration: *iteration,
            timestamp: Utc::now(),
        },
        LoopProgress::Completed { loop_id } => ExecutionEvent::RegionCompleted {
            execution_id,
            region_id: loop_id.clone(),
            timestamp: Utc::now(),
        },
    };
    event_bus.emit(event);
}

/// Current output of the block behind the last successful log entry
fn final_output(ctx: &ExecutionContext) -> BlockOutput {
    ctx.block_logs
        .iter()
        .rev()
        .find(|log| log.success)
        .and_then(|log| {
            ctx.output(&log.block_id)
                .filter(|_| !ctx.is_failed(&log.block_id))
                .or(log.output.as_ref())
        })
        .cloned()
        .unwrap_or_default()
}
