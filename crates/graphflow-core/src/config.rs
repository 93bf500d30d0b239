use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};
use crate::security::{CallerIdentity, SecurityPolicy};
use crate::types::Usage;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default)]
    pub security: SecurityPolicy,
    #[serde(default)]
    pub platform: PlatformCapabilities,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub store: StoreConfig,
    /// Per-model pricing, keyed by model id.
    #[serde(default)]
    pub pricing: HashMap<String, ModelPricing>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Upper bound on node visits per execution, independent of loop bounds.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Capacity of the lifecycle event channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Model used by model nodes that do not name one.
    #[serde(default = "default_model")]
    pub default_model: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            event_capacity: default_event_capacity(),
            default_model: default_model(),
        }
    }
}

fn default_max_steps() -> usize { 10_000 }
fn default_event_capacity() -> usize { 256 }
fn default_model() -> String { "echo".to_string() }

/// Quotas checked by the resource validation layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default = "default_max_nodes")]
    pub max_nodes: usize,
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls: usize,
    /// Largest `max_iterations` a single loop may declare.
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: u32,
    /// Executions a caller may start per rolling minute (0 = unlimited).
    #[serde(default)]
    pub max_executions_per_minute: u32,
    /// Percentage of a limit at which a warning is reported.
    #[serde(default = "default_warn_pct")]
    pub warn_pct: u8,
    /// Per-caller overrides keyed by caller id.
    #[serde(default)]
    pub callers: HashMap<String, LimitOverrides>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_nodes: default_max_nodes(),
            max_tool_calls: default_max_tool_calls(),
            max_loop_iterations: default_max_loop_iterations(),
            max_executions_per_minute: 0,
            warn_pct: default_warn_pct(),
            callers: HashMap::new(),
        }
    }
}

fn default_max_nodes() -> usize { 200 }
fn default_max_tool_calls() -> usize { 50 }
fn default_max_loop_iterations() -> u32 { 1_000 }
fn default_warn_pct() -> u8 { 80 }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitOverrides {
    #[serde(default)]
    pub max_nodes: Option<usize>,
    #[serde(default)]
    pub max_tool_calls: Option<usize>,
    #[serde(default)]
    pub max_loop_iterations: Option<u32>,
    #[serde(default)]
    pub max_executions_per_minute: Option<u32>,
}

impl ResourceLimits {
    /// Effective limits for a caller, with its overrides applied.
    pub fn for_caller(&self, caller: &CallerIdentity) -> ResourceLimits {
        let mut limits = ResourceLimits {
            callers: HashMap::new(),
            ..self.clone()
        };
        if let Some(o) = self.callers.get(&caller.id) {
            if let Some(v) = o.max_nodes {
                limits.max_nodes = v;
            }
            if let Some(v) = o.max_tool_calls {
                limits.max_tool_calls = v;
            }
            if let Some(v) = o.max_loop_iterations {
                limits.max_loop_iterations = v;
            }
            if let Some(v) = o.max_executions_per_minute {
                limits.max_executions_per_minute = v;
            }
        }
        limits
    }

    /// Whether `used` has reached the warning threshold of `limit`.
    pub fn near_limit(&self, used: usize, limit: usize) -> bool {
        limit > 0 && used * 100 >= limit * self.warn_pct as usize
    }
}

/// Features the hosting platform supports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformCapabilities {
    #[serde(default = "default_true")]
    pub parallel_tools: bool,
    #[serde(default = "default_max_parallel_tools")]
    pub max_parallel_tools: usize,
    /// Whether memory nodes may call a model to summarize history.
    #[serde(default = "default_true")]
    pub summarization: bool,
}

impl Default for PlatformCapabilities {
    fn default() -> Self {
        Self {
            parallel_tools: true,
            max_parallel_tools: default_max_parallel_tools(),
            summarization: true,
        }
    }
}

fn default_true() -> bool { true }
fn default_max_parallel_tools() -> usize { 8 }

/// JSONL runtime logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Directory for log files. Default: ~/.graphflow/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = run lifecycle, 2 = + node completions and checkpoints, 3 = + node starts and retries.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_dir: None,
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> u8 { 2 }

impl LogConfig {
    pub fn resolved_dir(&self) -> PathBuf {
        expand_home(self.log_dir.as_deref().unwrap_or("~/.graphflow/logs"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path.
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String { "~/.graphflow/executions.db".to_string() }

impl StoreConfig {
    pub fn resolved_path(&self) -> PathBuf {
        expand_home(&self.path)
    }
}

/// USD price per million tokens.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelPricing {
    #[serde(default)]
    pub input_per_million: f64,
    #[serde(default)]
    pub output_per_million: f64,
}

impl ModelPricing {
    pub fn cost(&self, usage: &Usage) -> f64 {
        (usage.input_tokens as f64 * self.input_per_million
            + usage.output_tokens as f64 * self.output_per_million)
            / 1_000_000.0
    }
}

impl EngineConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| FlowError::Config(e.to_string()))
    }

    /// Default config location: ~/.graphflow/config.toml
    pub fn default_path() -> PathBuf {
        expand_home("~/.graphflow/config.toml")
    }

    pub fn pricing_for(&self, model: &str) -> Option<&ModelPricing> {
        self.pricing.get(model)
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
pub fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeKind;
    use crate::security::SecurityTier;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_GRAPHFLOW_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_GRAPHFLOW_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_GRAPHFLOW_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_GRAPHFLOW_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_GRAPHFLOW_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.max_steps, 10_000);
        assert_eq!(config.engine.event_capacity, 256);
        assert_eq!(config.limits.max_nodes, 200);
        assert_eq!(config.limits.warn_pct, 80);
        assert!(config.platform.parallel_tools);
        assert!(!config.log.enabled);
        assert_eq!(config.log.level, 2);
        assert_eq!(config.security.auto_approve_up_to, SecurityTier::T1);
    }

    #[test]
    fn test_full_config() {
        let toml_str = r#"
[engine]
max_steps = 500
default_model = "gpt-4o-mini"

[limits]
max_nodes = 10
max_executions_per_minute = 30

[limits.callers.batch]
max_nodes = 50

[security]
deny_above = "t3"
denied_node_kinds = ["delay"]

[security.callers.guest]
allowed_tools = ["echo"]
max_tier = "t0"

[platform]
parallel_tools = false

[pricing.gpt-4o-mini]
input_per_million = 0.15
output_per_million = 0.6
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.max_steps, 500);
        assert_eq!(config.engine.default_model, "gpt-4o-mini");
        assert_eq!(config.limits.max_nodes, 10);
        assert_eq!(
            config.limits.for_caller(&CallerIdentity::new("batch")).max_nodes,
            50
        );
        assert_eq!(
            config.limits.for_caller(&CallerIdentity::anonymous()).max_nodes,
            10
        );
        assert_eq!(config.security.denied_node_kinds, vec![NodeKind::Delay]);
        assert_eq!(
            config.security.callers["guest"].max_tier,
            Some(SecurityTier::T0)
        );
        assert!(!config.platform.parallel_tools);
        let pricing = config.pricing_for("gpt-4o-mini").unwrap();
        let cost = pricing.cost(&Usage::new(1_000_000, 1_000_000));
        assert!((cost - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_near_limit() {
        let limits = ResourceLimits::default();
        assert!(limits.near_limit(8, 10));
        assert!(!limits.near_limit(7, 10));
        assert!(!limits.near_limit(5, 0));
    }
}
