use crate::structural::{LoopHandler, ParallelHandler, TriggerHandler};
use async_trait::async_trait;
use flowcore::{
    Block, BlockContext, BlockError, BlockHandler, BlockType, HandlerMetadata, HandlerOutput,
};
use std::sync::Arc;

/// Registry of available block handlers.
///
/// Lookup goes from the most recently registered handler to the oldest, so
/// a later registration overrides an earlier one for the same blocks.
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn BlockHandler>>,
}

impl HandlerRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Registry with the trigger, loop and parallel handlers every run needs
    pub fn with_structural() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(TriggerHandler));
        registry.register(Arc::new(LoopHandler));
        registry.register(Arc::new(ParallelHandler));
        registry
    }

    /// Register a block handler
    pub fn register(&mut self, handler: Arc<dyn BlockHandler>) {
        tracing::info!("Registering block handler: {}", handler.metadata().name);
        self.handlers.push(handler);
    }

    /// Handler able to execute the block
    pub fn find(&self, block: &Block) -> Option<Arc<dyn BlockHandler>> {
        self.handlers
            .iter()
            .rev()
            .find(|h| h.can_handle(block))
            .cloned()
    }

    /// Get metadata of every registered handler
    pub fn list(&self) -> Vec<HandlerMetadata> {
        self.handlers.iter().map(|h| h.metadata()).collect()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_structural()
    }
}

type HandlerFn = dyn Fn(&BlockContext<'_>) -> Result<HandlerOutput, BlockError> + Send + Sync;

enum Target {
    Type(BlockType),
    Block(String),
}

/// Handler built from a synchronous closure
pub struct FnHandler {
    target: Target,
    name: String,
    f: Box<HandlerFn>,
}

impl FnHandler {
    /// Handle every block of `block_type`
    pub fn for_type<F>(block_type: BlockType, f: F) -> Self
    where
        F: Fn(&BlockContext<'_>) -> Result<HandlerOutput, BlockError> + Send + Sync + 'static,
    {
        Self {
            target: Target::Type(block_type),
            name: block_type.to_string(),
            f: Box::new(f),
        }
    }

    /// Handle only the block with this id
    pub fn for_block<F>(block_id: impl Into<String>, f: F) -> Self
    where
        F: Fn(&BlockContext<'_>) -> Result<HandlerOutput, BlockError> + Send + Sync + 'static,
    {
        let block_id = block_id.into();
        Self {
            name: block_id.clone(),
            target: Target::Block(block_id),
            f: Box::new(f),
        }
    }
}

#[async_trait]
impl BlockHandler for FnHandler {
    fn can_handle(&self, block: &Block) -> bool {
        match &self.target {
            Target::Type(t) => block.block_type == *t,
            Target::Block(id) => block.id == *id,
        }
    }

    async fn execute(&self, ctx: BlockContext<'_>) -> Result<HandlerOutput, BlockError> {
        (self.f)(&ctx)
    }

    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata {
            name: self.name.clone(),
            description: "Closure handler".to_string(),
            category: "custom".to_string(),
        }
    }
}
