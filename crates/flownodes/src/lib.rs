//! Standard block library
//!
//! Collection of built-in handlers for common block types

mod compare;
mod condition;
mod debug;
mod delay;
mod function;
mod response;
mod router;

pub use compare::{evaluate, is_truthy};
pub use condition::ConditionHandler;
pub use debug::DebugHandler;
pub use delay::DelayHandler;
pub use function::FunctionHandler;
pub use response::ResponseHandler;
pub use router::RouterHandler;

use flowruntime::HandlerRegistry;
use std::sync::Arc;

/// Register all standard handlers with a registry
pub fn register_all(registry: &mut HandlerRegistry) {
    registry.register(Arc::new(ConditionHandler));
    registry.register(Arc::new(RouterHandler));
    registry.register(Arc::new(FunctionHandler));
    registry.register(Arc::new(ResponseHandler));
    registry.register(Arc::new(DelayHandler));
    registry.register(Arc::new(DebugHandler));
}

/// Structural handlers plus the standard library
pub fn default_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::with_structural();
    register_all(&mut registry);
    registry
}
