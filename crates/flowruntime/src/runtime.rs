use crate::executor::{ExecutionOptions, ExecutionResult, WorkflowExecutor};
use crate::inputs::ReferenceResolver;
use crate::registry::HandlerRegistry;
use flowcore::{
    EventBus, ExecutionContext, FlowError, InputResolver, Workflow, WorkflowError, WorkflowId,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Main runtime for executing workflows
pub struct FlowRuntime {
    registry: Arc<HandlerRegistry>,
    resolver: Arc<dyn InputResolver>,
    executor: Arc<WorkflowExecutor>,
    event_bus: Arc<EventBus>,
    workflows: Arc<RwLock<HashMap<WorkflowId, Workflow>>>,
}

impl FlowRuntime {
    /// Create a new runtime with default settings
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a new runtime with custom configuration
    pub fn with_config(config: RuntimeConfig) -> Self {
        let registry = Arc::new(HandlerRegistry::with_structural());
        Self::with_registry(registry, config)
    }

    /// Create a new runtime with a pre-configured registry
    pub fn with_registry(registry: Arc<HandlerRegistry>, config: RuntimeConfig) -> Self {
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        let executor = Arc::new(WorkflowExecutor::new(config));

        Self {
            registry,
            resolver: Arc::new(ReferenceResolver::new()),
            executor,
            event_bus,
            workflows: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Replace the default reference resolver
    pub fn with_resolver(mut self, resolver: Arc<dyn InputResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &RuntimeConfig {
        self.executor.config()
    }

    /// Register a workflow
    pub async fn register_workflow(&self, workflow: Workflow) -> Result<WorkflowId, FlowError> {
        crate::WorkflowGraph::build(&workflow)?;
        let id = workflow.id;
        let mut workflows = self.workflows.write().await;
        workflows.insert(id, workflow);
        Ok(id)
    }

    /// Execute a registered workflow by ID
    pub async fn execute_workflow(
        &self,
        workflow_id: WorkflowId,
        options: ExecutionOptions,
    ) -> Result<ExecutionResult, FlowError> {
        let workflows = self.workflows.read().await;
        let workflow = workflows.get(&workflow_id).ok_or_else(|| {
            FlowError::Workflow(WorkflowError::Invalid(format!(
                "workflow {} is not registered",
                workflow_id
            )))
        })?;

        self.execute(workflow, options).await
    }

    /// Execute a workflow directly (without registration)
    pub async fn execute(
        &self,
        workflow: &Workflow,
        options: ExecutionOptions,
    ) -> Result<ExecutionResult, FlowError> {
        self.executor
            .execute(
                workflow,
                &self.registry,
                self.resolver.as_ref(),
                &self.event_bus,
                options,
            )
            .await
    }

    /// Continue a paused debug session with a subset of its pending layer
    pub async fn continue_execution(
        &self,
        workflow: &Workflow,
        context: ExecutionContext,
        block_ids: &[String],
        options: ExecutionOptions,
    ) -> Result<ExecutionResult, FlowError> {
        self.executor
            .continue_execution(
                workflow,
                &self.registry,
                self.resolver.as_ref(),
                &self.event_bus,
                context,
                block_ids,
                options,
            )
            .await
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<flowcore::ExecutionEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }
}

impl Default for FlowRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Scheduler iterations before a run is declared runaway
    pub max_iterations: usize,
    /// Handlers in flight at once within one layer
    pub max_parallel_blocks: usize,
    pub event_buffer_size: usize,
    pub block_timeout_ms: Option<u64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            max_parallel_blocks: 10,
            event_buffer_size: 1000,
            block_timeout_ms: None,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `FLOW_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_number("FLOW_MAX_ITERATIONS") {
            config.max_iterations = v as usize;
        }
        if let Some(v) = env_number("FLOW_MAX_PARALLEL_BLOCKS") {
            config.max_parallel_blocks = v as usize;
        }
        if let Some(v) = env_number("FLOW_EVENT_BUFFER_SIZE") {
            config.event_buffer_size = v as usize;
        }
        if let Some(v) = env_number("FLOW_BLOCK_TIMEOUT_MS") {
            config.block_timeout_ms = Some(v);
        }
        config
    }
}

fn env_number(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring {}={:?}: not a number", name, raw);
            None
        }
    }
}
