//! Configuration for turnflow, read from `turnflow.toml`.
//!
//! Layered: file → environment. Every field has a default so an absent file
//! yields a working configuration.
//!
//! # Configuration File Format
//!
//! ```toml
//! [pipeline]
//! max_retries = 2
//! max_revisions = 2
//! max_plan_iterations = 3
//! approve_confidence_threshold = 0.7
//!
//! [tools]
//! max_tool_calls = 12
//! max_consecutive_failures = 3
//! call_timeout_secs = 30
//! high_cost_tools = ["web_search"]
//!
//! [index]
//! quality_floor = 0.1
//!
//! [approval]
//! timeout_secs = 120
//! safe_tools = ["web_search", "memory_recall"]
//!
//! [storage]
//! data_dir = "/var/lib/turnflow"
//! file_lock = true
//!
//! [logging]
//! json = false
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "turnflow.toml";

/// Retry/revision bounds and thresholds for the controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineSection {
    /// Total LOOP passes allowed per turn (the initial pass included).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// REVISE cycles allowed per turn; separate from the retry budget.
    #[serde(default = "default_max_revisions")]
    pub max_revisions: u32,
    /// Planner iterations within one LOOP pass.
    #[serde(default = "default_max_plan_iterations")]
    pub max_plan_iterations: u32,
    /// Validator approvals below this confidence are forced into RETRY.
    #[serde(default = "default_approve_confidence_threshold")]
    pub approve_confidence_threshold: f64,
    /// Maximum entries kept in the document's decision history.
    #[serde(default = "default_decision_history_cap")]
    pub decision_history_cap: usize,
    /// Character budget handed to each strategy.
    #[serde(default = "default_view_budget_chars")]
    pub view_budget_chars: usize,
    /// Prior turns injected into the gathered context.
    #[serde(default = "default_relevant_turns")]
    pub relevant_turns: usize,
}

fn default_max_retries() -> u32 {
    2
}

fn default_max_revisions() -> u32 {
    2
}

fn default_max_plan_iterations() -> u32 {
    3
}

fn default_approve_confidence_threshold() -> f64 {
    0.7
}

fn default_decision_history_cap() -> usize {
    10
}

fn default_view_budget_chars() -> usize {
    16_000
}

fn default_relevant_turns() -> usize {
    3
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_revisions: default_max_revisions(),
            max_plan_iterations: default_max_plan_iterations(),
            approve_confidence_threshold: default_approve_confidence_threshold(),
            decision_history_cap: default_decision_history_cap(),
            view_budget_chars: default_view_budget_chars(),
            relevant_turns: default_relevant_turns(),
        }
    }
}

/// Tool-call limits for one turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolsSection {
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls: u32,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// Tools subject to the per-turn duplicate-call guard.
    #[serde(default = "default_high_cost_tools")]
    pub high_cost_tools: Vec<String>,
}

fn default_max_tool_calls() -> u32 {
    12
}

fn default_max_consecutive_failures() -> u32 {
    3
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_high_cost_tools() -> Vec<String> {
    vec!["web_search".to_string(), "deep_research".to_string()]
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            max_tool_calls: default_max_tool_calls(),
            max_consecutive_failures: default_max_consecutive_failures(),
            call_timeout_secs: default_call_timeout_secs(),
            high_cost_tools: default_high_cost_tools(),
        }
    }
}

impl ToolsSection {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

/// Turn index settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexSection {
    /// Lower bound for degraded quality scores.
    #[serde(default = "default_quality_floor")]
    pub quality_floor: f64,
    /// Database file name inside the data directory.
    #[serde(default = "default_index_file")]
    pub file_name: String,
}

fn default_quality_floor() -> f64 {
    0.1
}

fn default_index_file() -> String {
    "turn_index.sqlite".to_string()
}

impl Default for IndexSection {
    fn default() -> Self {
        Self {
            quality_floor: default_quality_floor(),
            file_name: default_index_file(),
        }
    }
}

/// Claim lifetime settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClaimsSection {
    #[serde(default = "default_claim_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_claim_ttl_secs() -> u64 {
    24 * 60 * 60
}

impl Default for ClaimsSection {
    fn default() -> Self {
        Self {
            ttl_secs: default_claim_ttl_secs(),
        }
    }
}

/// Permission gate and human-intervention settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalSection {
    /// Seconds to wait for a human decision before defaulting to "not approved".
    #[serde(default = "default_approval_timeout_secs")]
    pub timeout_secs: u64,
    /// Tools that never need approval.
    #[serde(default = "default_safe_tools")]
    pub safe_tools: Vec<String>,
    /// Tools that are always refused.
    #[serde(default)]
    pub denied_tools: Vec<String>,
}

fn default_approval_timeout_secs() -> u64 {
    120
}

fn default_safe_tools() -> Vec<String> {
    vec![
        "web_search".to_string(),
        "deep_research".to_string(),
        "memory_recall".to_string(),
        "file_read".to_string(),
    ]
}

impl Default for ApprovalSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_approval_timeout_secs(),
            safe_tools: default_safe_tools(),
            denied_tools: Vec::new(),
        }
    }
}

impl ApprovalSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Where turns and the index live.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StorageSection {
    /// Root data directory (default: platform data dir + "/turnflow").
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Use the cross-process file-lock turn allocator instead of the in-process one.
    #[serde(default)]
    pub file_lock: bool,
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingSection {
    /// Emit JSON lines on stderr.
    #[serde(default)]
    pub json: bool,
    /// Also write a daily rolling log file under `<data_dir>/logs`.
    #[serde(default)]
    pub file: bool,
    /// Filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    "turnflow=info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            json: false,
            file: false,
            filter: default_log_filter(),
        }
    }
}

/// The complete turnflow.toml configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TurnflowConfig {
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub tools: ToolsSection,
    #[serde(default)]
    pub index: IndexSection,
    #[serde(default)]
    pub claims: ClaimsSection,
    #[serde(default)]
    pub approval: ApprovalSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl TurnflowConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse turnflow.toml")
    }

    /// Load `turnflow.toml` from `dir` (defaults if absent), then apply
    /// environment overrides.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE_NAME);
        let mut config = if config_path.exists() {
            Self::load(&config_path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize turnflow.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `TURNFLOW_*` environment variables on top of file values.
    /// Unparseable values are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse::<u32>("TURNFLOW_MAX_RETRIES") {
            self.pipeline.max_retries = v;
        }
        if let Some(v) = env_parse::<u32>("TURNFLOW_MAX_REVISIONS") {
            self.pipeline.max_revisions = v;
        }
        if let Some(v) = env_parse::<u64>("TURNFLOW_APPROVAL_TIMEOUT_SECS") {
            self.approval.timeout_secs = v;
        }
        if let Ok(dir) = std::env::var("TURNFLOW_DATA_DIR")
            && !dir.trim().is_empty()
        {
            self.storage.data_dir = Some(PathBuf::from(dir));
        }
        if let Ok(val) = std::env::var("TURNFLOW_LOG_JSON") {
            self.logging.json = val != "false" && val != "0";
        }
    }

    /// Resolved data directory (file → env → platform default).
    pub fn data_dir(&self) -> PathBuf {
        self.storage.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|d| d.join("turnflow"))
                .unwrap_or_else(|| PathBuf::from(".turnflow"))
        })
    }

    /// Path of the SQLite turn index.
    pub fn index_path(&self) -> PathBuf {
        self.data_dir().join(&self.index.file_name)
    }

    /// Validate the configuration and return any problems found.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.pipeline.max_retries == 0 {
            problems.push("pipeline.max_retries must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.pipeline.approve_confidence_threshold) {
            problems.push(format!(
                "pipeline.approve_confidence_threshold {} is outside [0, 1]",
                self.pipeline.approve_confidence_threshold
            ));
        }
        if self.pipeline.decision_history_cap == 0 {
            problems.push("pipeline.decision_history_cap must be at least 1".to_string());
        }
        if !(0.0..1.0).contains(&self.index.quality_floor) {
            problems.push(format!(
                "index.quality_floor {} is outside [0, 1)",
                self.index.quality_floor
            ));
        }
        if self.tools.call_timeout_secs == 0 {
            problems.push("tools.call_timeout_secs must be at least 1".to_string());
        }
        for tool in &self.approval.denied_tools {
            if self.approval.safe_tools.contains(tool) {
                problems.push(format!("tool '{}' is listed as both safe and denied", tool));
            }
        }

        problems
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Serializes tests that mutate environment variables.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_default_config_is_valid() {
        let config = TurnflowConfig::default();
        assert!(config.validate().is_empty());
        assert_eq!(config.pipeline.max_retries, 2);
        assert_eq!(config.pipeline.max_revisions, 2);
        assert_eq!(config.index.quality_floor, 0.1);
    }

    #[test]
    fn test_parse_partial_file_keeps_defaults() {
        let content = r#"
[pipeline]
max_retries = 3

[tools]
call_timeout_secs = 5
"#;
        let config = TurnflowConfig::parse(content).unwrap();
        assert_eq!(config.pipeline.max_retries, 3);
        assert_eq!(config.pipeline.max_revisions, 2);
        assert_eq!(config.tools.call_timeout(), Duration::from_secs(5));
        assert_eq!(config.tools.max_tool_calls, 12);
    }

    #[test]
    fn test_parse_invalid_toml_errors() {
        let result = TurnflowConfig::parse("[pipeline\nmax_retries = ");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("turnflow.toml"));
    }

    #[test]
    fn test_validate_reports_out_of_range_values() {
        let content = r#"
[pipeline]
max_retries = 0
approve_confidence_threshold = 1.5

[index]
quality_floor = 1.0
"#;
        let config = TurnflowConfig::parse(content).unwrap();
        let problems = config.validate();
        assert_eq!(problems.len(), 3);
        assert!(problems.iter().any(|p| p.contains("max_retries")));
        assert!(problems.iter().any(|p| p.contains("quality_floor")));
    }

    #[test]
    fn test_validate_detects_safe_and_denied_overlap() {
        let mut config = TurnflowConfig::default();
        config.approval.denied_tools = vec!["web_search".to_string()];
        let problems = config.validate();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("web_search"));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let mut config = TurnflowConfig::default();
        config.pipeline.max_revisions = 4;
        config.storage.file_lock = true;
        let path = dir.path().join(CONFIG_FILE_NAME);
        config.save(&path).unwrap();

        let loaded = TurnflowConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_env_overrides_file_values() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "[pipeline]\nmax_retries = 5\n",
        )
        .unwrap();

        unsafe { std::env::set_var("TURNFLOW_MAX_RETRIES", "1") };
        unsafe { std::env::set_var("TURNFLOW_DATA_DIR", "/tmp/turnflow-env") };
        let config = TurnflowConfig::load_or_default(dir.path()).unwrap();
        unsafe { std::env::remove_var("TURNFLOW_MAX_RETRIES") };
        unsafe { std::env::remove_var("TURNFLOW_DATA_DIR") };

        assert_eq!(config.pipeline.max_retries, 1);
        assert_eq!(config.data_dir(), PathBuf::from("/tmp/turnflow-env"));
    }

    #[test]
    fn test_load_or_default_without_file() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let dir = tempdir().unwrap();
        let config = TurnflowConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.pipeline, PipelineSection::default());
    }
}
