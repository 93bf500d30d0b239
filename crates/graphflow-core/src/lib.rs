pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod execution;
pub mod expression;
pub mod graph;
pub mod security;
pub mod template;
pub mod traits;
pub mod types;
pub mod validation;

pub use config::EngineConfig;
pub use context::{ContextUpdate, ExecutionContext};
pub use error::{FlowError, Result};
pub use event::EventBus;
pub use execution::{ExecutionRecord, ExecutionRequest, ExecutionResult, ExecutionStatus};
pub use graph::{EdgeDef, GraphDefinition, NodeConfig, NodeDef, NodeKind};
pub use validation::ValidationResult;
pub use types::*;
