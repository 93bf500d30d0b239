use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    // Pre-execution errors
    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Invalid configuration for node {node}: {message}")]
    Configuration { node: String, message: String },

    // Runtime errors
    #[error("Node {node} failed: {message}")]
    Execution { node: String, message: String },

    #[error("Node {node} timed out after {timeout_ms}ms")]
    Timeout { node: String, timeout_ms: u64 },

    #[error("Execution cancelled")]
    Cancelled,

    // Transport errors
    #[error("Model request failed: {0}")]
    ModelRequest(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    #[error("Tool input validation failed: {0}")]
    ToolValidation(String),

    #[error("Retrieval failed: {0}")]
    Retrieval(String),

    // Evaluation errors
    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Template error: {0}")]
    Template(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Execution record not found: {0}")]
    RecordNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowError {
    /// Whether an error handler may retry the node that raised this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FlowError::Execution { .. }
                | FlowError::Timeout { .. }
                | FlowError::ModelRequest(_)
                | FlowError::ToolExecution { .. }
                | FlowError::ToolTimeout { .. }
                | FlowError::Retrieval(_)
        )
    }

    /// Short machine-readable name of the error class.
    pub fn kind(&self) -> &'static str {
        match self {
            FlowError::Validation(_) => "validation",
            FlowError::Configuration { .. } => "configuration",
            FlowError::Execution { .. } => "execution",
            FlowError::Timeout { .. } | FlowError::ToolTimeout { .. } => "timeout",
            FlowError::Cancelled => "cancelled",
            FlowError::ModelRequest(_) => "model",
            FlowError::ToolNotFound(_)
            | FlowError::ToolExecution { .. }
            | FlowError::ToolValidation(_) => "tool",
            FlowError::Retrieval(_) => "retrieval",
            FlowError::Expression(_) | FlowError::Template(_) => "expression",
            FlowError::Config(_) | FlowError::ConfigNotFound(_) => "config",
            FlowError::Database(_) | FlowError::RecordNotFound(_) => "store",
            FlowError::Io(_) => "io",
            FlowError::Json(_) => "json",
        }
    }

    /// Wrap any error raised while a node ran into a node-scoped execution error.
    pub fn at_node(node: &str, err: impl std::fmt::Display) -> Self {
        FlowError::Execution {
            node: node.to_string(),
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
