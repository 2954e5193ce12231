use crate::{BlockOutput, ExecutionId, StreamingExecution, WorkflowId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Events emitted during workflow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    WorkflowStarted {
        execution_id: ExecutionId,
        workflow_id: WorkflowId,
        entry_block: String,
        timestamp: DateTime<Utc>,
    },
    WorkflowCompleted {
        execution_id: ExecutionId,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    WorkflowCancelled {
        execution_id: ExecutionId,
        timestamp: DateTime<Utc>,
    },
    LayerStarted {
        execution_id: ExecutionId,
        blocks: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    /// Debug mode: a layer is ready and waits for an explicit continue
    LayerPending {
        execution_id: ExecutionId,
        blocks: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    BlockStarted {
        execution_id: ExecutionId,
        block_id: String,
        block_type: String,
        timestamp: DateTime<Utc>,
    },
    BlockCompleted {
        execution_id: ExecutionId,
        block_id: String,
        output: BlockOutput,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    BlockFailed {
        execution_id: ExecutionId,
        block_id: String,
        error: String,
        handled: bool,
        timestamp: DateTime<Utc>,
    },
    LoopIteration {
        execution_id: ExecutionId,
        loop_id: String,
        iteration: usize,
        timestamp: DateTime<Utc>,
    },
    RegionCompleted {
        execution_id: ExecutionId,
        region_id: String,
        timestamp: DateTime<Utc>,
    },
    BlockEvent {
        execution_id: ExecutionId,
        block_id: String,
        event: BlockEvent,
        timestamp: DateTime<Utc>,
    },
}

/// Events specific to block execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum BlockEvent {
    Info { message: String },
    Warning { message: String },
    Progress { percent: f64, message: Option<String> },
    Data { key: String, value: Value },
}

/// Event emitter for blocks to send real-time updates
#[derive(Clone)]
pub struct EventEmitter {
    execution_id: ExecutionId,
    block_id: String,
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventEmitter {
    pub fn new(
        execution_id: ExecutionId,
        block_id: impl Into<String>,
        sender: broadcast::Sender<ExecutionEvent>,
    ) -> Self {
        Self {
            execution_id,
            block_id: block_id.into(),
            sender,
        }
    }

    /// Emit a block-specific event
    pub fn emit(&self, event: BlockEvent) {
        let _ = self.sender.send(ExecutionEvent::BlockEvent {
            execution_id: self.execution_id,
            block_id: self.block_id.clone(),
            event,
            timestamp: Utc::now(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(BlockEvent::Info {
            message: message.into(),
        });
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(BlockEvent::Warning {
            message: message.into(),
        });
    }

    pub fn progress(&self, percent: f64, message: Option<String>) {
        self.emit(BlockEvent::Progress { percent, message });
    }

    pub fn data(&self, key: impl Into<String>, value: Value) {
        self.emit(BlockEvent::Data {
            key: key.into(),
            value,
        });
    }
}

/// Broadcast bus every run publishes to
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    /// Sending without subscribers is not an error
    pub fn emit(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }

    pub fn create_emitter(&self, execution_id: ExecutionId, block_id: &str) -> EventEmitter {
        EventEmitter::new(execution_id, block_id, self.sender.clone())
    }
}

/// Caller-facing callbacks.
///
/// Errors returned here are logged by the scheduler and never abort a run.
#[async_trait]
pub trait ExecutionObserver: Send + Sync {
    /// Receives the caller copy of a block's live stream
    async fn on_stream(&self, _execution: StreamingExecution) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once a block finished successfully
    async fn on_block_complete(&self, _block_id: &str, _output: &BlockOutput) -> anyhow::Result<()> {
        Ok(())
    }
}
