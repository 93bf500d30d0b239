pub mod builtin;
pub mod executor;
pub mod nodes;
pub mod registry;
pub mod tokens;
pub mod transport;

pub use executor::{NodeEnv, NodeExecutor, NodeRegistry};
pub use nodes::delay::delay_for;
pub use nodes::error_handler::ERROR_VARIABLE;
pub use nodes::memory::trim_to_window;
pub use registry::{execute_tool, RetrieverRegistry, ToolRegistry};
pub use tokens::estimate_tokens;
pub use transport::{EchoModel, KeywordIndex};
