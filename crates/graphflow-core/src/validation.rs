//! Validation records produced before any node runs.

use serde::{Deserialize, Serialize};

use crate::error::FlowError;

/// The four validation layers, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationLayer {
    Structure,
    Security,
    Capability,
    Resource,
}

impl ValidationLayer {
    pub const ALL: [ValidationLayer; 4] = [
        ValidationLayer::Structure,
        ValidationLayer::Security,
        ValidationLayer::Capability,
        ValidationLayer::Resource,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Structure => "structure",
            Self::Security => "security",
            Self::Capability => "capability",
            Self::Resource => "resource",
        }
    }
}

impl std::fmt::Display for ValidationLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Stable machine-readable code, e.g. `cycle` or `dangling_edge`.
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

impl ValidationIssue {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            node_id: None,
        }
    }

    pub fn at(code: &str, node_id: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            node_id: Some(node_id.to_string()),
        }
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.node_id {
            Some(node) => write!(f, "[{}] {}: {}", self.code, node, self.message),
            None => write!(f, "[{}] {}", self.code, self.message),
        }
    }
}

/// Findings from one layer. Errors block execution; warnings do not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerReport {
    pub layer: ValidationLayer,
    #[serde(default)]
    pub errors: Vec<ValidationIssue>,
    #[serde(default)]
    pub warnings: Vec<ValidationIssue>,
}

impl LayerReport {
    pub fn new(layer: ValidationLayer) -> Self {
        Self {
            layer,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn error(&mut self, issue: ValidationIssue) {
        self.errors.push(issue);
    }

    pub fn warning(&mut self, issue: ValidationIssue) {
        self.warnings.push(issue);
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Merged result of the layers that ran.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub layers: Vec<LayerReport>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, report: LayerReport) {
        self.layers.push(report);
    }

    /// True iff no layer that ran reported a blocking error.
    pub fn is_valid(&self) -> bool {
        self.layers.iter().all(LayerReport::is_ok)
    }

    pub fn layers_run(&self) -> Vec<ValidationLayer> {
        self.layers.iter().map(|l| l.layer).collect()
    }

    pub fn layer(&self, layer: ValidationLayer) -> Option<&LayerReport> {
        self.layers.iter().find(|l| l.layer == layer)
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.layers.iter().flat_map(|l| l.errors.iter())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.layers.iter().flat_map(|l| l.warnings.iter())
    }

    pub fn has_error_code(&self, code: &str) -> bool {
        self.errors().any(|e| e.code == code)
    }

    /// `Ok(())` when valid, otherwise a `Validation` error listing every blocking issue.
    pub fn into_error(&self) -> Result<(), FlowError> {
        if self.is_valid() {
            return Ok(());
        }
        Err(FlowError::Validation(
            self.layers
                .iter()
                .flat_map(|l| l.errors.iter().map(move |e| format!("{}: {}", l.layer, e)))
                .collect(),
        ))
    }
}

/// A node config that fails its own schema or semantic check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigError {
    pub field: String,
    pub message: String,
}

impl ConfigError {
    pub fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
