pub mod context;
pub mod executor;
pub mod graph;
pub mod node;
pub mod resolver;
pub mod retry;
pub mod wiring;

pub use context::{ContextRegistry, ExecutionContext};
pub use executor::{ExecutionEngine, StartOptions, NODE_QUEUE, WORKFLOW_QUEUE};
pub use graph::ExecutionGraph;
pub use node::{
    NodeDefinition, NodeDispatchOptions, NodeExecutionRequest, NodeExecutor, NodeHandlerError,
    NodeHandlerResult, NodeProperty,
};
pub use resolver::DependencyResolver;
