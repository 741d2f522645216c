mod llm;
mod memory;
mod orchestrator;
mod recipes;
mod reflector;
mod server;
mod storage;
mod tools;

pub use llm::*;
pub use memory::*;
pub use orchestrator::*;
pub use recipes::*;
pub use reflector::*;
pub use server::*;
pub use storage::*;
pub use tools::*;

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub interventions: InterventionConfig,
    #[serde(default)]
    pub reflector: ReflectorConfig,
    #[serde(default)]
    pub recipes: RecipesConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub workflows: WorkflowsConfig,
}

impl Config {
    /// Load from a TOML file, then apply env-var overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let mut cfg: Config = toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("cannot parse {}: {e}", path.display())))?;
        cfg.apply_env();
        Ok(cfg)
    }

    /// Defaults plus env-var overrides (no config file).
    pub fn from_env() -> Self {
        let mut cfg = Config::default();
        cfg.apply_env();
        cfg
    }

    /// Apply the recognized environment variables on top of the file values.
    pub fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("GATEWAY_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("GATEWAY_PORT") {
            match port.parse() {
                Ok(p) => self.server.port = p,
                Err(_) => tracing::warn!(value = %port, "GATEWAY_PORT is not a number; ignored"),
            }
        }
        if let Ok(url) = std::env::var("LLM_URL") {
            self.llm.base_url = url;
        }
        if let Ok(key) = std::env::var("LLM_API_KEY") {
            self.llm.api_key = key;
        }
        if let Ok(model) = std::env::var("LLM_MODEL") {
            self.llm.model = model;
        }
        if let Ok(url) = std::env::var("TOOL_URL") {
            self.tools.base_url = url;
        }
        if let Ok(repo) = std::env::var("SAVED_REPO") {
            self.tools.saved_repo = Some(repo.into());
        }
        if let Ok(flag) = std::env::var("ENFORCE_MODE_GATES") {
            self.tools.enforce_mode_gates = flag != "0";
        }
        if let Ok(timeout) = std::env::var("EXTERNAL_REPO_TIMEOUT") {
            match timeout.parse() {
                Ok(t) => self.tools.approval_timeout_secs = t,
                Err(_) => {
                    tracing::warn!(value = %timeout, "EXTERNAL_REPO_TIMEOUT is not a number; ignored")
                }
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues. Empty vec
    /// means everything looks good.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        fn err(issues: &mut Vec<ConfigIssue>, field: &str, message: String) {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: field.into(),
                message,
            });
        }
        fn warn(issues: &mut Vec<ConfigIssue>, field: &str, message: String) {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: field.into(),
                message,
            });
        }

        let mut issues = Vec::new();

        if self.server.port == 0 {
            err(&mut issues, "server.port", "port must be greater than 0".into());
        }
        if self.server.host.is_empty() {
            err(&mut issues, "server.host", "host must not be empty".into());
        }

        for (field, url) in [
            ("llm.base_url", &self.llm.base_url),
            ("tools.base_url", &self.tools.base_url),
        ] {
            if url.is_empty() {
                err(&mut issues, field, "must not be empty".into());
            } else if !url.starts_with("http://") && !url.starts_with("https://") {
                err(
                    &mut issues,
                    field,
                    format!("must start with http:// or https:// (got \"{url}\")"),
                );
            }
        }

        if self.llm.embedding_dims == 0 {
            err(&mut issues, "llm.embedding_dims", "embedding width must be non-zero".into());
        }

        if !(0.0..=1.0).contains(&self.memory.confidence_floor) {
            err(
                &mut issues,
                "memory.confidence_floor",
                format!("must be within [0, 1] (got {})", self.memory.confidence_floor),
            );
        }
        for (name, params) in &self.memory.decay.table {
            if params.lambda_per_day < 0.0 {
                err(
                    &mut issues,
                    &format!("memory.decay.table.{name}"),
                    "lambda_per_day must be non-negative".into(),
                );
            }
            if !(0.0..=1.0).contains(&params.floor) {
                err(
                    &mut issues,
                    &format!("memory.decay.table.{name}"),
                    format!("floor must be within [0, 1] (got {})", params.floor),
                );
            }
        }

        if self.orchestrator.max_executor_iterations == 0 {
            err(
                &mut issues,
                "orchestrator.max_executor_iterations",
                "must be at least 1".into(),
            );
        }

        if self.tools.approval_timeout_secs == 0 {
            warn(
                &mut issues,
                "tools.approval_timeout_secs",
                "zero timeout denies every out-of-scope request immediately".into(),
            );
        }
        if self.tools.write_set.is_empty() && self.tools.enforce_mode_gates {
            warn(
                &mut issues,
                "tools.write_set",
                "mode gates enabled but the write set is empty".into(),
            );
        }

        if self.interventions.max_per_session > self.interventions.max_total {
            err(
                &mut issues,
                "interventions.max_per_session",
                "per-session cap exceeds the total cap".into(),
            );
        }

        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn find_issue<'a>(issues: &'a [ConfigIssue], field_prefix: &str) -> Option<&'a ConfigIssue> {
        issues.iter().find(|e| e.field.starts_with(field_prefix))
    }

    #[test]
    fn default_config_passes() {
        let issues = Config::default().validate();
        let errors: Vec<_> = issues
            .iter()
            .filter(|e| e.severity == ConfigSeverity::Error)
            .collect();
        assert!(errors.is_empty(), "expected no errors, got: {errors:?}");
    }

    #[test]
    fn port_zero_is_error() {
        let mut cfg = Config::default();
        cfg.server.port = 0;
        let issues = cfg.validate();
        assert_eq!(
            find_issue(&issues, "server.port").unwrap().severity,
            ConfigSeverity::Error
        );
    }

    #[test]
    fn bad_llm_url_scheme_is_error() {
        let mut cfg = Config::default();
        cfg.llm.base_url = "ftp://example".into();
        let issues = cfg.validate();
        assert!(find_issue(&issues, "llm.base_url").is_some());
    }

    #[test]
    fn confidence_floor_out_of_range_is_error() {
        let mut cfg = Config::default();
        cfg.memory.confidence_floor = 1.5;
        let issues = cfg.validate();
        assert!(find_issue(&issues, "memory.confidence_floor").is_some());
    }

    #[test]
    fn bad_decay_floor_is_error() {
        let mut cfg = Config::default();
        cfg.memory
            .decay
            .table
            .insert("price".into(), DecayParams { lambda_per_day: 0.1, floor: 2.0 });
        let issues = cfg.validate();
        assert!(find_issue(&issues, "memory.decay.table.price").is_some());
    }

    #[test]
    fn per_session_cap_above_total_is_error() {
        let mut cfg = Config::default();
        cfg.interventions.max_per_session = 100;
        let issues = cfg.validate();
        assert!(find_issue(&issues, "interventions.max_per_session").is_some());
    }

    #[test]
    fn zero_approval_timeout_is_warning() {
        let mut cfg = Config::default();
        cfg.tools.approval_timeout_secs = 0;
        let issues = cfg.validate();
        let issue = find_issue(&issues, "tools.approval_timeout_secs").unwrap();
        assert_eq!(issue.severity, ConfigSeverity::Warning);
    }

    #[test]
    fn issue_display_format() {
        let issue = ConfigIssue {
            severity: ConfigSeverity::Error,
            field: "server.port".into(),
            message: "port must be greater than 0".into(),
        };
        assert_eq!(format!("{issue}"), "[ERROR] server.port: port must be greater than 0");
    }

    #[test]
    fn toml_round_trip_with_partial_file() {
        let toml_src = r#"
[server]
port = 9000

[llm]
base_url = "http://llm.internal:8000"

[memory]
top_k = 10
"#;
        let cfg: Config = toml::from_str(toml_src).unwrap();
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.server.host, "127.0.0.1"); // default fills in
        assert_eq!(cfg.memory.top_k, 10);
        assert_eq!(cfg.memory.rrf_k, 60.0);
        assert_eq!(cfg.llm.base_url, "http://llm.internal:8000");
    }
}
