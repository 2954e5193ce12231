//! Workflow execution runtime
//!
//! This crate provides the scheduler that drives a workflow layer by layer,
//! together with the pieces it coordinates: dependency resolution, path
//! tracking, loop and parallel managers, the streaming pipeline and the
//! block handler registry.

mod executor;
mod graph;
mod inputs;
pub mod loops;
pub mod parallels;
pub mod path;
mod registry;
pub mod resolver;
mod runtime;
mod streaming;
mod structural;
pub mod trigger;

pub use executor::{ExecutionMetadata, ExecutionOptions, ExecutionResult, WorkflowExecutor};
pub use graph::WorkflowGraph;
pub use inputs::{normalize_name, ReferenceResolver};
pub use registry::{FnHandler, HandlerRegistry};
pub use resolver::{next_layer, pending_blocks};
pub use runtime::{FlowRuntime, RuntimeConfig};
pub use streaming::{finalize_output, ResponseFieldFilter};
pub use structural::{resolve_collection, LoopHandler, ParallelHandler, TriggerHandler};
