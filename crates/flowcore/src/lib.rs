//! Core abstractions for the flow engine
//!
//! This crate provides the graph model, the run state and the contracts
//! every block handler implements. It carries no scheduling logic.

mod block;
mod context;
mod error;
pub mod events;
mod workflow;

pub use block::{
    json_type_name, BlockContext, BlockHandler, HandlerMetadata, HandlerOutput, InputResolver,
    StreamingExecution,
};
pub use context::{
    virtual_block_id, BlockLog, BlockOutput, BlockScope, BlockState, Decisions, ExecutionContext,
    ExecutionId, LoopScope, LoopState, ParallelScope, ParallelState, VirtualBlock,
};
pub use error::{BlockError, FlowError, WorkflowError};
pub use events::{BlockEvent, EventBus, EventEmitter, ExecutionEvent, ExecutionObserver};
pub use workflow::{
    Block, BlockId, BlockMetadata, BlockType, Connection, LoopRegion, LoopType, ParallelRegion,
    ParallelType, SourceHandle, Workflow, WorkflowId, WorkflowSettings,
};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
