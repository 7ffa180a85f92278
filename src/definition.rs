//! Agent definitions and the definition document format.
//!
//! A definition document is a YAML header fenced by `---` lines followed by
//! free-form instructions:
//!
//! ```text
//! ---
//! name: web_search
//! description: Searches the web
//! trigger_type: on_demand
//! capabilities:
//! - search
//! resource_limits:
//!   memory: 512Mi
//!   cpu: '0.5'
//! ---
//!
//! You are a search agent...
//! ```
//!
//! The instructions are never interpreted; they are handed to the agent as
//! its operating instructions.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::error::{OrchestratorError, Result};

const FENCE: &str = "---";

/// When an agent is expected to be activated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    #[default]
    Always,
    OnDemand,
    #[serde(alias = "repository-event", alias = "repository_event")]
    Repository,
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerType::Always => write!(f, "always"),
            TriggerType::OnDemand => write!(f, "on_demand"),
            TriggerType::Repository => write!(f, "repository"),
        }
    }
}

impl std::str::FromStr for TriggerType {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "always" => Ok(TriggerType::Always),
            "on_demand" | "on-demand" => Ok(TriggerType::OnDemand),
            "repository" | "repository-event" | "repository_event" => Ok(TriggerType::Repository),
            other => Err(OrchestratorError::Validation(format!(
                "unknown trigger type '{}' (expected always, on_demand or repository)",
                other
            ))),
        }
    }
}

/// Resource limits as declared in the definition header.
///
/// `memory` and `cpu` keep their textual form so documents survive a
/// parse/render cycle unchanged; use [`ResourceLimits::memory_bytes`] and
/// [`ResourceLimits::cpu_share`] for the numeric values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default = "default_cpu")]
    pub cpu: String,
    /// Maximum number of tasks this agent executes at once.
    #[serde(default = "default_concurrency", skip_serializing_if = "is_one")]
    pub concurrency: u32,
}

fn default_memory() -> String {
    "512Mi".to_string()
}

fn default_cpu() -> String {
    "0.5".to_string()
}

fn default_concurrency() -> u32 {
    1
}

fn is_one(val: &u32) -> bool {
    *val == 1
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory: default_memory(),
            cpu: default_cpu(),
            concurrency: default_concurrency(),
        }
    }
}

impl ResourceLimits {
    /// Memory limit in bytes. Accepts binary (`Ki`, `Mi`, `Gi`, `Ti`) and
    /// decimal (`K`, `M`, `G`, `T`) suffixes or a bare byte count.
    pub fn memory_bytes(&self) -> Result<u64> {
        parse_memory(&self.memory)
    }

    /// CPU share as a fraction of one core. Accepts `"0.5"` or millicores
    /// (`"500m"`).
    pub fn cpu_share(&self) -> Result<f64> {
        parse_cpu(&self.cpu)
    }
}

/// Parse a memory quantity like `"512Mi"` or `"1.5G"` into bytes.
pub fn parse_memory(s: &str) -> Result<u64> {
    let s = s.trim();
    let invalid = || OrchestratorError::Validation(format!("invalid memory limit '{}'", s));
    if s.is_empty() {
        return Err(invalid());
    }
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))
        .unwrap_or(s.len());
    let (num_part, unit) = s.split_at(split);
    let num: f64 = num_part.parse().map_err(|_| invalid())?;
    if num < 0.0 {
        return Err(OrchestratorError::Validation(format!(
            "memory limit '{}' must not be negative",
            s
        )));
    }
    let multiplier: f64 = match unit {
        "" => 1.0,
        "K" | "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "Ki" => 1024.0,
        "Mi" => 1024.0 * 1024.0,
        "Gi" => 1024.0 * 1024.0 * 1024.0,
        "Ti" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return Err(invalid()),
    };
    Ok((num * multiplier).round() as u64)
}

/// Parse a CPU quantity like `"0.5"` or `"250m"` into a core fraction.
pub fn parse_cpu(s: &str) -> Result<f64> {
    let s = s.trim();
    let invalid = || OrchestratorError::Validation(format!("invalid cpu limit '{}'", s));
    let value = match s.strip_suffix('m') {
        Some(millis) => millis.parse::<f64>().map_err(|_| invalid())? / 1000.0,
        None => s.parse::<f64>().map_err(|_| invalid())?,
    };
    if !value.is_finite() {
        return Err(invalid());
    }
    if value < 0.0 {
        return Err(OrchestratorError::Validation(format!(
            "cpu limit '{}' must not be negative",
            s
        )));
    }
    Ok(value)
}

/// A registered agent's declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Capability tags or agent names this agent needs before it may run.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub environment_vars: BTreeMap<String, String>,
    #[serde(default)]
    pub resource_limits: ResourceLimits,
    /// Base URL of a remote agent service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_image: Option<String>,
    /// Name of the invoker that runs this agent (defaults to `local`, or
    /// `http` when an endpoint is set).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<String>,
    /// Operating instructions handed to the agent verbatim.
    #[serde(default, alias = "prompt", skip_serializing_if = "String::is_empty")]
    pub instructions: String,
}

impl AgentDefinition {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: format!("Microagent {}", name),
            trigger_type: TriggerType::default(),
            capabilities: vec![],
            dependencies: vec![],
            environment_vars: BTreeMap::new(),
            resource_limits: ResourceLimits::default(),
            endpoint: None,
            container_image: None,
            executor: None,
            instructions: String::new(),
        }
    }

    pub fn with_capabilities(mut self, caps: &[&str]) -> Self {
        self.capabilities = caps.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_dependencies(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_concurrency(mut self, limit: u32) -> Self {
        self.resource_limits.concurrency = limit;
        self
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    /// Whether this agent satisfies a dependency tag, either by name or by
    /// declaring it as a capability.
    pub fn provides(&self, tag: &str) -> bool {
        self.name == tag || self.has_capability(tag)
    }

    /// Check the invariants that do not depend on other registered agents.
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;

        check_tags("capability", &self.capabilities)?;
        check_tags("dependency", &self.dependencies)?;

        if self.dependencies.iter().any(|d| d == &self.name) {
            return Err(OrchestratorError::Validation(format!(
                "agent '{}' depends on itself",
                self.name
            )));
        }
        if let Some(dep) = self.dependencies.iter().find(|d| self.has_capability(d)) {
            return Err(OrchestratorError::Validation(format!(
                "agent '{}' depends on capability '{}' it provides itself",
                self.name, dep
            )));
        }

        for key in self.environment_vars.keys() {
            if key.is_empty() || key.contains('=') {
                return Err(OrchestratorError::Validation(format!(
                    "invalid environment variable name '{}'",
                    key
                )));
            }
        }

        self.resource_limits.memory_bytes()?;
        self.resource_limits.cpu_share()?;
        if self.resource_limits.concurrency == 0 {
            return Err(OrchestratorError::Validation(
                "concurrency limit must be at least 1".to_string(),
            ));
        }

        if let Some(endpoint) = &self.endpoint
            && !(endpoint.starts_with("http://") || endpoint.starts_with("https://"))
        {
            return Err(OrchestratorError::Validation(format!(
                "endpoint '{}' must be an http(s) URL",
                endpoint
            )));
        }

        Ok(())
    }
}

/// Agent names double as file names in [`crate::store::DirStore`].
fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(OrchestratorError::Validation(
            "agent name must not be empty".to_string(),
        ));
    }
    if name.starts_with('.')
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(OrchestratorError::Validation(format!(
            "agent name '{}' may only contain letters, digits, '-', '_' and '.'",
            name
        )));
    }
    Ok(())
}

fn check_tags(kind: &str, tags: &[String]) -> Result<()> {
    let mut seen = HashSet::new();
    for tag in tags {
        if tag.trim().is_empty() {
            return Err(OrchestratorError::Validation(format!("empty {} tag", kind)));
        }
        if !seen.insert(tag.as_str()) {
            return Err(OrchestratorError::Validation(format!(
                "{} '{}' listed more than once",
                kind, tag
            )));
        }
    }
    Ok(())
}

/// Parse a definition document.
///
/// `fallback_name` is used when the header has no `name` (typically the
/// file stem). Documents without a header are treated as pure
/// instructions.
pub fn parse_document(content: &str, fallback_name: Option<&str>) -> Result<AgentDefinition> {
    let (header, body) = split_document(content);

    let mut def: AgentDefinition = match header {
        Some(h) if !h.trim().is_empty() => serde_yaml::from_str(h)?,
        _ => AgentDefinition {
            description: String::new(),
            ..AgentDefinition::new("")
        },
    };

    if def.name.is_empty() {
        def.name = fallback_name.unwrap_or_default().to_string();
    }
    if def.description.is_empty() {
        def.description = format!("Microagent {}", def.name);
    }
    let body = body.trim();
    if !body.is_empty() || header.is_some() {
        def.instructions = body.to_string();
    }

    Ok(def)
}

fn split_document(content: &str) -> (Option<&str>, &str) {
    let Some(rest) = content.strip_prefix(FENCE) else {
        return (None, content);
    };
    let rest = rest.strip_prefix('\r').unwrap_or(rest);
    let Some(rest) = rest.strip_prefix('\n') else {
        return (None, content);
    };
    if let Some(body) = rest.strip_prefix(FENCE) {
        return (Some(""), body);
    }
    match rest.find("\n---") {
        Some(end) => {
            let header = &rest[..end + 1];
            let body = &rest[end + 1 + FENCE.len()..];
            (Some(header), body)
        }
        None => (None, content),
    }
}

/// Render a definition as a document that [`parse_document`] reads back
/// into an identical definition.
pub fn render_document(def: &AgentDefinition) -> Result<String> {
    let header = AgentDefinition {
        instructions: String::new(),
        ..def.clone()
    };
    let yaml = serde_yaml::to_string(&header)?;
    Ok(format!(
        "{fence}\n{yaml}{fence}\n\n{body}\n",
        fence = FENCE,
        yaml = yaml,
        body = def.instructions.trim()
    ))
}
