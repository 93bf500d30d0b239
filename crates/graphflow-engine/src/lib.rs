pub mod assembler;
pub mod engine;
pub mod interpreter;
pub mod metrics;
pub mod retry;
pub mod run_log;
pub mod store;
pub mod tracker;
pub mod validator;

pub use assembler::{assemble, resolve_source, Outcome};
pub use engine::GraphEngine;
pub use interpreter::Interpreter;
pub use metrics::{ExecutionMetrics, MetricsSnapshot};
pub use run_log::RunLogger;
pub use store::InMemoryExecutionStore;
pub use tracker::{TrackedRun, Tracker};
pub use validator::Validator;
