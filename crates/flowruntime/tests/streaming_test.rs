mod common;

use async_trait::async_trait;
use common::{runtime, workflow};
use flowcore::{
    Block, BlockError, BlockOutput, BlockType, ExecutionObserver, HandlerOutput,
    StreamingExecution,
};
use flowruntime::{ExecutionOptions, FnHandler};
use futures::stream::{self, StreamExt};
use serde_json::json;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Recorder {
    chunks: Mutex<Vec<String>>,
    completed: Mutex<Vec<String>>,
}

#[async_trait]
impl ExecutionObserver for Recorder {
    async fn on_stream(&self, mut execution: StreamingExecution) -> anyhow::Result<()> {
        while let Some(chunk) = execution.stream.next().await {
            self.chunks.lock().unwrap().push(chunk?);
        }
        Ok(())
    }

    async fn on_block_complete(&self, block_id: &str, _output: &BlockOutput) -> anyhow::Result<()> {
        self.completed.lock().unwrap().push(block_id.to_string());
        Ok(())
    }
}

struct Failing;

#[async_trait]
impl ExecutionObserver for Failing {
    async fn on_stream(&self, _execution: StreamingExecution) -> anyhow::Result<()> {
        anyhow::bail!("caller went away")
    }

    async fn on_block_complete(&self, _block_id: &str, _output: &BlockOutput) -> anyhow::Result<()> {
        anyhow::bail!("caller went away")
    }
}

fn streaming_agent(chunks: Vec<Result<&'static str, BlockError>>) -> FnHandler {
    FnHandler::for_type(BlockType::Agent, move |ctx| {
        let items: Vec<Result<String, BlockError>> = chunks
            .iter()
            .map(|c| c.clone().map(str::to_string))
            .collect();
        Ok(HandlerOutput::Stream(
            StreamingExecution::new(ctx.execution_block_id.clone(), stream::iter(items).boxed())
                .with_output("tokens", 3),
        ))
    })
}

fn agent_workflow(agent: Block) -> flowcore::Workflow {
    let mut wf = workflow("streaming");
    wf.add_block(agent);
    wf.connect("start", "agent");
    wf
}

#[tokio::test]
async fn test_stream_is_teed_to_caller_and_state() {
    let recorder = Arc::new(Recorder::default());
    let rt = runtime(vec![streaming_agent(vec![Ok("a"), Ok("b"), Ok("c")])]);

    let result = rt
        .execute(
            &agent_workflow(Block::new("agent", BlockType::Agent)),
            ExecutionOptions::new().with_observer(recorder.clone()),
        )
        .await
        .unwrap();

    assert!(result.success, "run failed: {:?}", result.error);
    assert_eq!(result.output["content"], json!("abc"));
    assert_eq!(result.output["tokens"], json!(3));
    assert_eq!(*recorder.chunks.lock().unwrap(), vec!["a", "b", "c"]);
    assert_eq!(*recorder.completed.lock().unwrap(), vec!["agent"]);
}

#[tokio::test]
async fn test_structured_stream_is_parsed_and_field_filtered() {
    let recorder = Arc::new(Recorder::default());
    let agent = Block::new("agent", BlockType::Agent)
        .with_config("response_format", json!({"type": "object"}));
    let rt = runtime(vec![streaming_agent(vec![
        Ok("{\"score\": "),
        Ok("7, \"why\": \"ok\"}"),
    ])]);

    let options = ExecutionOptions::new()
        .with_observer(recorder.clone())
        .with_selected_outputs(vec!["agent.score".to_string()]);
    let result = rt.execute(&agent_workflow(agent), options).await.unwrap();

    assert!(result.success, "run failed: {:?}", result.error);
    assert_eq!(result.output["score"], json!(7));
    assert_eq!(result.output["why"], json!("ok"));
    assert_eq!(*recorder.chunks.lock().unwrap(), vec!["7"]);
}

#[tokio::test]
async fn test_stream_error_keeps_partial_content_and_fails_block() {
    let rt = runtime(vec![streaming_agent(vec![
        Ok("par"),
        Ok("tial"),
        Err(BlockError::Stream("connection reset".to_string())),
        Ok("never"),
    ])]);

    let result = rt
        .execute(
            &agent_workflow(Block::new("agent", BlockType::Agent)),
            ExecutionOptions::new(),
        )
        .await
        .unwrap();

    assert!(!result.success);
    let log = result.logs.iter().find(|l| l.block_id == "agent").unwrap();
    assert!(!log.success);
    assert_eq!(log.output.as_ref().unwrap()["content"], json!("partial"));
    assert!(log.error.as_deref().unwrap().contains("connection reset"));
}

#[tokio::test]
async fn test_callback_failures_never_abort_the_run() {
    let rt = runtime(vec![streaming_agent(vec![Ok("x")])]);

    let result = rt
        .execute(
            &agent_workflow(Block::new("agent", BlockType::Agent)),
            ExecutionOptions::new().with_observer(Arc::new(Failing)),
        )
        .await
        .unwrap();

    assert!(result.success, "run failed: {:?}", result.error);
    assert_eq!(result.output["content"], json!("x"));
}
