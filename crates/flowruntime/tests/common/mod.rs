#![allow(dead_code)]

use flowcore::{Block, BlockType, HandlerOutput, Workflow};
use flowruntime::{FlowRuntime, FnHandler, HandlerRegistry, RuntimeConfig};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Function blocks echo their resolved config
pub fn echo() -> FnHandler {
    FnHandler::for_type(BlockType::Function, |ctx| {
        Ok(HandlerOutput::Output(ctx.inputs.clone()))
    })
}

pub fn runtime(handlers: Vec<FnHandler>) -> FlowRuntime {
    runtime_with_config(handlers, RuntimeConfig::default())
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn runtime_with_config(handlers: Vec<FnHandler>, config: RuntimeConfig) -> FlowRuntime {
    init_tracing();
    let mut registry = HandlerRegistry::with_structural();
    registry.register(Arc::new(echo()));
    for handler in handlers {
        registry.register(Arc::new(handler));
    }
    FlowRuntime::with_registry(Arc::new(registry), config)
}

/// Workflow with a starter block called `start`
pub fn workflow(name: &str) -> Workflow {
    let mut wf = Workflow::new(name);
    wf.add_block(Block::new("start", BlockType::Starter));
    wf
}

pub fn function(id: &str) -> Block {
    Block::new(id, BlockType::Function)
}

/// Ids of the logged blocks, in log order
pub fn log_ids(result: &flowruntime::ExecutionResult) -> Vec<String> {
    result.logs.iter().map(|l| l.block_id.clone()).collect()
}
