use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::graph::NodeKind;

/// Security tier for tool classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityTier {
    T0,
    T1,
    T2,
    T3,
    T4,
}

impl fmt::Display for SecurityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::T0 => write!(f, "T0"),
            Self::T1 => write!(f, "T1"),
            Self::T2 => write!(f, "T2"),
            Self::T3 => write!(f, "T3"),
            Self::T4 => write!(f, "T4"),
        }
    }
}

impl std::str::FromStr for SecurityTier {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "t0" => Ok(Self::T0),
            "t1" => Ok(Self::T1),
            "t2" => Ok(Self::T2),
            "t3" => Ok(Self::T3),
            "t4" => Ok(Self::T4),
            other => Err(format!("unknown security tier: {}", other)),
        }
    }
}

/// Decision from the security layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    NeedsApproval,
    Deny,
}

/// Who is asking to run a workflow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub id: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl CallerIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            roles: Vec::new(),
        }
    }

    /// The unauthenticated local caller used by the CLI.
    pub fn anonymous() -> Self {
        Self::new("anonymous")
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }
}

/// Per-caller permission rules. Empty allow-lists mean "no restriction".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallerRules {
    #[serde(default)]
    pub allowed_node_kinds: Vec<NodeKind>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub denied_tools: Vec<String>,
    /// Tools above this tier are denied for this caller.
    #[serde(default)]
    pub max_tier: Option<SecurityTier>,
}

/// Security policy governing which nodes and tools a caller may run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityPolicy {
    /// Tools at or below this tier are auto-approved.
    #[serde(default = "default_auto_approve")]
    pub auto_approve_up_to: SecurityTier,

    /// Tools above this tier are denied outright.
    #[serde(default)]
    pub deny_above: Option<SecurityTier>,

    /// Per-tool tier overrides.
    #[serde(default)]
    pub tool_overrides: HashMap<String, SecurityTier>,

    /// Patterns in tool input that escalate a call to T4.
    #[serde(default = "SecurityPolicy::default_patterns")]
    pub dangerous_patterns: Vec<DangerousPattern>,

    /// Node kinds nobody may run.
    #[serde(default)]
    pub denied_node_kinds: Vec<NodeKind>,

    /// Per-caller rules keyed by caller id.
    #[serde(default)]
    pub callers: HashMap<String, CallerRules>,
}

fn default_auto_approve() -> SecurityTier {
    SecurityTier::T1
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            auto_approve_up_to: SecurityTier::T1,
            deny_above: None,
            tool_overrides: HashMap::new(),
            dangerous_patterns: Self::default_patterns(),
            denied_node_kinds: Vec::new(),
            callers: HashMap::new(),
        }
    }
}

impl SecurityPolicy {
    /// Built-in patterns for tool input that reaches outside the workflow:
    /// destructive SQL, filesystem escapes and internal network targets.
    pub fn default_patterns() -> Vec<DangerousPattern> {
        [
            (r"(?i)\bDROP\s+(TABLE|DATABASE|SCHEMA)\b", "SQL drop"),
            (r#"(?i)\bDELETE\s+FROM\s+[\w.]+\s*(;|"|$)"#, "unbounded SQL delete"),
            (r"\.\.[/\\]", "path traversal"),
            (r"(?i)\bfile://", "local file URL"),
            (
                r"169\.254\.169\.254|(?i)metadata\.google\.internal",
                "cloud metadata endpoint",
            ),
            (r"(?i)(curl|wget)\s[^|]*\|\s*(ba)?sh", "remote script execution"),
        ]
        .into_iter()
        .map(|(pattern, label)| DangerousPattern {
            pattern: pattern.to_string(),
            label: label.to_string(),
        })
        .collect()
    }

    /// Rules for a caller, if any are configured.
    pub fn rules_for(&self, caller: &CallerIdentity) -> Option<&CallerRules> {
        self.callers.get(&caller.id)
    }

    /// Decide what to do for a given effective tier and tool name.
    pub fn decide(&self, tier: SecurityTier, tool_name: &str) -> GateDecision {
        // Per-tool overrides replace the tool's own tier
        let effective_tier = self.tool_overrides.get(tool_name).copied().unwrap_or(tier);

        if let Some(deny_above) = self.deny_above {
            if effective_tier > deny_above {
                return GateDecision::Deny;
            }
        }

        if effective_tier <= self.auto_approve_up_to {
            return GateDecision::Allow;
        }

        GateDecision::NeedsApproval
    }

    /// `decide`, narrowed by the caller's own rules.
    pub fn decide_for(
        &self,
        caller: &CallerIdentity,
        tier: SecurityTier,
        tool_name: &str,
    ) -> GateDecision {
        if let Some(rules) = self.rules_for(caller) {
            if rules.denied_tools.iter().any(|t| t == tool_name) {
                return GateDecision::Deny;
            }
            if !rules.allowed_tools.is_empty() && !rules.allowed_tools.iter().any(|t| t == tool_name)
            {
                return GateDecision::Deny;
            }
            let effective_tier = self.tool_overrides.get(tool_name).copied().unwrap_or(tier);
            if let Some(max) = rules.max_tier {
                if effective_tier > max {
                    return GateDecision::Deny;
                }
            }
        }
        self.decide(tier, tool_name)
    }

    /// Whether the caller may run nodes of this kind.
    pub fn node_kind_permitted(&self, caller: &CallerIdentity, kind: NodeKind) -> bool {
        if self.denied_node_kinds.contains(&kind) {
            return false;
        }
        match self.rules_for(caller) {
            Some(rules) if !rules.allowed_node_kinds.is_empty() => {
                // Start and end carry no work; they are always permitted.
                matches!(kind, NodeKind::Start | NodeKind::End)
                    || rules.allowed_node_kinds.contains(&kind)
            }
            _ => true,
        }
    }
}

/// A pattern that marks a tool input as dangerous (T4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DangerousPattern {
    pub pattern: String,
    pub label: String,
}

/// Compiled regex cache for dangerous input detection.
pub struct DangerousPatternMatcher {
    patterns: Vec<(regex::Regex, String)>,
}

impl DangerousPatternMatcher {
    /// Compile patterns into regex cache. Invalid patterns are skipped with a warning.
    pub fn new(patterns: &[DangerousPattern]) -> Self {
        let compiled = patterns
            .iter()
            .filter_map(|p| match regex::Regex::new(&p.pattern) {
                Ok(re) => Some((re, p.label.clone())),
                Err(e) => {
                    tracing::warn!(
                        pattern = %p.pattern,
                        error = %e,
                        "Invalid dangerous pattern regex, skipping"
                    );
                    None
                }
            })
            .collect();
        Self { patterns: compiled }
    }

    /// Check if a text matches any dangerous pattern. Returns the label if matched.
    pub fn is_dangerous(&self, text: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|(re, _)| re.is_match(text))
            .map(|(_, label)| label.as_str())
    }
}
