mod common;

use async_trait::async_trait;
use common::{function, log_ids, runtime, runtime_with_config, workflow};
use flowcore::{
    Block, BlockContext, BlockError, BlockHandler, BlockOutput, BlockType, ExecutionEvent,
    FlowError, HandlerOutput, LoopRegion, SourceHandle, Workflow,
};
use flowruntime::{
    next_layer, ExecutionOptions, FlowRuntime, FnHandler, HandlerRegistry, RuntimeConfig,
    WorkflowGraph,
};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn diamond() -> Workflow {
    let mut wf = workflow("diamond");
    wf.add_block(function("a").with_config("v", 1));
    wf.add_block(function("b").with_config("v", 2));
    wf.add_block(function("c").with_config("sum", "<a.v>+<b.v>"));
    wf.connect("start", "a");
    wf.connect("start", "b");
    wf.connect("a", "c");
    wf.connect("b", "c");
    wf
}

#[tokio::test]
async fn test_next_layer_is_pure() {
    let wf = diamond();
    let rt = runtime(vec![]);
    let paused = rt
        .execute(&wf, ExecutionOptions::new().debug())
        .await
        .unwrap();
    let ctx = paused.metadata.context.clone().unwrap();
    let graph = WorkflowGraph::build(&wf).unwrap();

    let first = next_layer(&graph, &ctx);
    let second = next_layer(&graph, &ctx);

    assert_eq!(first, vec!["a", "b"]);
    assert_eq!(first, second);
    assert_eq!(paused.metadata.pending_blocks, first);
}

#[tokio::test]
async fn test_debug_session_steps_through_requested_blocks() {
    let wf = diamond();
    let rt = runtime(vec![]);

    let paused = rt
        .execute(&wf, ExecutionOptions::new().debug())
        .await
        .unwrap();
    assert!(paused.metadata.is_debug_session);
    assert_eq!(paused.metadata.pending_blocks, vec!["a", "b"]);
    assert_eq!(log_ids(&paused), vec!["start"]);

    let step = rt
        .continue_execution(
            &wf,
            paused.metadata.context.unwrap(),
            &["a".to_string()],
            ExecutionOptions::new(),
        )
        .await
        .unwrap();
    assert_eq!(step.metadata.pending_blocks, vec!["b"]);
    assert_eq!(log_ids(&step), vec!["start", "a"]);

    let step = rt
        .continue_execution(
            &wf,
            step.metadata.context.unwrap(),
            &["b".to_string()],
            ExecutionOptions::new(),
        )
        .await
        .unwrap();
    assert_eq!(step.metadata.pending_blocks, vec!["c"]);

    let done = rt
        .continue_execution(
            &wf,
            step.metadata.context.unwrap(),
            &["c".to_string()],
            ExecutionOptions::new(),
        )
        .await
        .unwrap();
    assert!(done.success);
    assert!(!done.metadata.is_debug_session);
    assert_eq!(done.output["sum"], json!("1+2"));
    assert_eq!(log_ids(&done), vec!["start", "a", "b", "c"]);
}

#[tokio::test]
async fn test_continuing_with_a_block_outside_the_layer_is_rejected() {
    let wf = diamond();
    let rt = runtime(vec![]);
    let paused = rt
        .execute(&wf, ExecutionOptions::new().debug())
        .await
        .unwrap();

    let result = rt
        .continue_execution(
            &wf,
            paused.metadata.context.unwrap(),
            &["c".to_string()],
            ExecutionOptions::new(),
        )
        .await;

    assert!(matches!(result, Err(FlowError::Debug(_))));
}

#[tokio::test]
async fn test_cancellation_stops_at_the_next_layer() {
    let mut wf = workflow("cancel");
    wf.add_block(function("a"));
    wf.add_block(function("b"));
    wf.connect("start", "a");
    wf.connect("a", "b");

    let token = CancellationToken::new();
    let trigger = token.clone();
    let cancel_in_a = FnHandler::for_block("a", move |_| {
        trigger.cancel();
        Ok(HandlerOutput::Output(BlockOutput::new()))
    });
    let rt = runtime(vec![cancel_in_a]);

    let result = rt
        .execute(&wf, ExecutionOptions::new().with_cancellation(token))
        .await
        .unwrap();

    assert!(!result.success);
    assert!(result.metadata.cancelled);
    assert_eq!(result.error.as_deref(), Some("Workflow execution was cancelled"));
    assert_eq!(log_ids(&result), vec!["start", "a"]);
}

#[tokio::test]
async fn test_iteration_ceiling_ends_runaway_runs() {
    let mut wf = workflow("long-loop");
    wf.add_block(Block::new("spin", BlockType::Loop));
    wf.add_block(function("body"));
    wf.connect("start", "spin");
    wf.connect_handle("spin", "body", SourceHandle::LoopStart);
    wf.add_loop(LoopRegion::count("spin", vec!["body"], 50));

    let config = RuntimeConfig {
        max_iterations: 5,
        ..RuntimeConfig::default()
    };
    let rt = runtime_with_config(vec![], config);
    let result = rt.execute(&wf, ExecutionOptions::new()).await.unwrap();

    assert!(!result.success);
    assert!(result
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("Maximum iteration count (5) exceeded"));
    assert!(!result.logs.is_empty());
}

#[tokio::test]
async fn test_block_timeout_fails_slow_blocks() {
    let mut wf = workflow("slow");
    wf.add_block(Block::new("wait", BlockType::Delay));
    wf.add_block(function("fallback").with_config("timed_out", true));
    wf.connect("start", "wait");
    wf.connect_handle("wait", "fallback", SourceHandle::Error);
    wf.settings.block_timeout_ms = Some(20);

    let mut registry = HandlerRegistry::with_structural();
    registry.register(Arc::new(common::echo()));
    registry.register(Arc::new(SlowHandler));
    let rt = FlowRuntime::with_registry(Arc::new(registry), RuntimeConfig::default());

    let result = rt.execute(&wf, ExecutionOptions::new()).await.unwrap();

    assert!(result.success, "run failed: {:?}", result.error);
    let wait = result.logs.iter().find(|l| l.block_id == "wait").unwrap();
    assert_eq!(
        wait.error.as_deref(),
        Some(BlockError::Timeout { millis: 20 }.to_string().as_str())
    );
    assert_eq!(result.output["timed_out"], json!(true));
}

struct SlowHandler;

#[async_trait]
impl BlockHandler for SlowHandler {
    fn can_handle(&self, block: &Block) -> bool {
        block.block_type == BlockType::Delay
    }

    async fn execute(&self, _ctx: BlockContext<'_>) -> Result<HandlerOutput, BlockError> {
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        Ok(HandlerOutput::Output(BlockOutput::new()))
    }
}

#[tokio::test]
async fn test_events_describe_the_run() {
    let wf = diamond();
    let rt = runtime(vec![]);
    let mut events = rt.subscribe_events();

    let result = rt.execute(&wf, ExecutionOptions::new()).await.unwrap();
    assert!(result.success);

    let mut started = Vec::new();
    let mut finished = None;
    while let Ok(event) = events.try_recv() {
        match event {
            ExecutionEvent::BlockStarted { block_id, .. } => started.push(block_id),
            ExecutionEvent::WorkflowCompleted { success, .. } => finished = Some(success),
            _ => {}
        }
    }

    assert_eq!(started, vec!["a", "b", "c"]);
    assert_eq!(finished, Some(true));
}
