//! Bridge configuration read from `.ralph/bridge.toml`.
//!
//! Settings are layered file → environment → CLI flags. The file is optional;
//! every field has a default, so an empty or missing file yields a working
//! configuration.
//!
//! ```toml
//! [agent]
//! command = "ralph"
//! args = []
//! working_dir = "."
//! kill_grace_secs = 5
//!
//! [defaults]
//! mode = "build"
//! model = "sonnet"
//! max_iterations = 10
//! auto_push = false
//!
//! [sessions]
//! history_limit = 500
//! cleanup_delay_secs = 300
//! subscriber_buffer = 256
//!
//! [server]
//! host = "127.0.0.1"
//! port = 3001
//!
//! [ci]
//! repo = "owner/name"
//! interval_secs = 30
//! max_attempts = 40
//! auto_fix = false
//! fix_command = "ralph --fix-ci"
//!
//! [logging]
//! level = "info"
//! json = false
//! file = ".ralph/logs/bridge.log"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ci::PollConfig;
use crate::orchestrator::AgentCommand;
use crate::session::{ProcessingMode, ProcessingOptions, RegistryConfig};

/// Directory holding bridge state inside a project.
pub const CONFIG_DIR: &str = ".ralph";
pub const CONFIG_FILE: &str = "bridge.toml";

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "off"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentSection {
    /// Agent CLI; `RALPH_CMD` overrides, `ralph` when neither is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Relative paths resolve against the project directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// Seconds a cancelled agent gets between SIGTERM and SIGKILL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill_grace_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultsSection {
    #[serde(default)]
    pub mode: ProcessingMode,
    #[serde(default = "crate::session::models::default_model")]
    pub model: String,
    #[serde(default = "crate::session::models::default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default)]
    pub auto_push: bool,
}

impl Default for DefaultsSection {
    fn default() -> Self {
        let options = ProcessingOptions::default();
        Self {
            mode: options.mode,
            model: options.model,
            max_iterations: options.max_iterations,
            auto_push: options.auto_push,
        }
    }
}

impl DefaultsSection {
    pub fn to_options(&self) -> ProcessingOptions {
        ProcessingOptions {
            mode: self.mode,
            model: self.model.clone(),
            max_iterations: self.max_iterations,
            auto_push: self.auto_push,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionsSection {
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_cleanup_delay_secs")]
    pub cleanup_delay_secs: u64,
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

fn default_history_limit() -> usize {
    500
}

fn default_cleanup_delay_secs() -> u64 {
    300
}

fn default_subscriber_buffer() -> usize {
    256
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            cleanup_delay_secs: default_cleanup_delay_secs(),
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3001
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CiSection {
    /// GitHub repository as `owner/name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    #[serde(default = "default_ci_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_ci_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub auto_fix: bool,
    /// Shell command run once when CI fails and auto-fix is on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix_command: Option<String>,
}

fn default_ci_interval_secs() -> u64 {
    30
}

fn default_ci_max_attempts() -> u32 {
    40
}

impl Default for CiSection {
    fn default() -> Self {
        Self {
            repo: None,
            interval_secs: default_ci_interval_secs(),
            max_attempts: default_ci_max_attempts(),
            auto_fix: false,
            fix_command: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            file: None,
        }
    }
}

/// Contents of `bridge.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeToml {
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub defaults: DefaultsSection,
    #[serde(default)]
    pub sessions: SessionsSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub ci: CiSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl BridgeToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse bridge.toml")
    }

    /// Load `bridge.toml` from `config_dir`, or defaults if it does not exist.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize bridge.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Some(cmd) = &self.agent.command
            && cmd.trim().is_empty()
        {
            warnings.push("agent.command is empty".to_string());
        }
        if self.defaults.max_iterations == 0 {
            warnings.push("defaults.max_iterations is 0; the agent will not iterate".to_string());
        }
        if self.defaults.model.trim().is_empty() {
            warnings.push("defaults.model is empty".to_string());
        }
        if self.sessions.history_limit == 0 {
            warnings.push("sessions.history_limit is 0; no activity history will be kept".to_string());
        }
        if self.sessions.subscriber_buffer == 0 {
            warnings.push("sessions.subscriber_buffer must be at least 1".to_string());
        }
        if self.server.port == 0 {
            warnings.push("server.port is 0; an ephemeral port will be chosen".to_string());
        }
        if let Some(repo) = &self.ci.repo
            && !is_valid_repo(repo)
        {
            warnings.push(format!("ci.repo '{}' is not in owner/name form", repo));
        }
        if self.ci.interval_secs == 0 {
            warnings.push("ci.interval_secs is 0; CI would be polled without delay".to_string());
        }
        if self.ci.max_attempts == 0 {
            warnings.push("ci.max_attempts is 0; CI will never be polled".to_string());
        }
        if self.ci.auto_fix && self.ci.fix_command.is_none() {
            warnings.push("ci.auto_fix is enabled but ci.fix_command is not set".to_string());
        }
        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            warnings.push(format!(
                "logging.level '{}' is not one of {}",
                self.logging.level,
                LOG_LEVELS.join(", ")
            ));
        }

        warnings
    }
}

fn is_valid_repo(repo: &str) -> bool {
    match repo.split_once('/') {
        Some((owner, name)) => !owner.is_empty() && !name.is_empty() && !name.contains('/'),
        None => false,
    }
}

/// Resolved runtime configuration: the file plus environment overrides.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub project_dir: PathBuf,
    pub toml: BridgeToml,
    /// From `GITHUB_TOKEN`; never read from or written to the file.
    pub github_token: Option<String>,
}

impl BridgeConfig {
    pub fn load(project_dir: PathBuf) -> Result<Self> {
        let toml = BridgeToml::load_or_default(&project_dir.join(CONFIG_DIR))?;
        let mut config = Self {
            project_dir,
            toml,
            github_token: None,
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn config_path(&self) -> PathBuf {
        self.project_dir.join(CONFIG_DIR).join(CONFIG_FILE)
    }

    /// Apply `RALPH_CMD`, `RALPH_BRIDGE_PORT` and `GITHUB_TOKEN`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(cmd) = lookup("RALPH_CMD").filter(|c| !c.trim().is_empty()) {
            self.toml.agent.command = Some(cmd);
        }
        if let Some(port) = lookup("RALPH_BRIDGE_PORT") {
            match port.trim().parse::<u16>() {
                Ok(port) => self.toml.server.port = port,
                Err(_) => {
                    tracing::warn!(value = %port, "Ignoring invalid RALPH_BRIDGE_PORT");
                }
            }
        }
        if let Some(token) = lookup("GITHUB_TOKEN").filter(|t| !t.is_empty()) {
            self.github_token = Some(token);
        }
    }

    pub fn agent_command(&self) -> AgentCommand {
        let program = self
            .toml
            .agent
            .command
            .clone()
            .unwrap_or_else(|| "ralph".to_string());
        let working_dir = match &self.toml.agent.working_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.project_dir.join(dir),
            None => self.project_dir.clone(),
        };
        let agent = AgentCommand::new(program)
            .with_args(self.toml.agent.args.clone())
            .with_working_dir(working_dir);
        match self.toml.agent.kill_grace_secs {
            Some(secs) => agent.with_kill_grace(Duration::from_secs(secs)),
            None => agent,
        }
    }

    pub fn default_options(&self) -> ProcessingOptions {
        self.toml.defaults.to_options()
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            history_limit: self.toml.sessions.history_limit,
            cleanup_delay: Duration::from_secs(self.toml.sessions.cleanup_delay_secs),
            subscriber_buffer: self.toml.sessions.subscriber_buffer.max(1),
        }
    }

    pub fn poll_config(&self) -> PollConfig {
        PollConfig {
            interval: Duration::from_secs(self.toml.ci.interval_secs),
            max_attempts: self.toml.ci.max_attempts,
            auto_fix: self.toml.ci.auto_fix,
        }
    }

    /// Log file resolved against the project directory.
    pub fn log_file(&self) -> Option<PathBuf> {
        self.toml.logging.file.as_ref().map(|file| {
            if file.is_absolute() {
                file.clone()
            } else {
                self.project_dir.join(file)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_parse_empty_config_uses_defaults() {
        let config = BridgeToml::parse("").unwrap();
        assert_eq!(config, BridgeToml::default());
        assert_eq!(config.sessions.history_limit, 500);
        assert_eq!(config.sessions.cleanup_delay_secs, 300);
        assert_eq!(config.server.port, 3001);
        assert_eq!(config.ci.interval_secs, 30);
        assert_eq!(config.defaults.model, "sonnet");
        assert_eq!(config.defaults.max_iterations, 10);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let content = r#"
[agent]
command = "/usr/local/bin/ralph"
args = ["--stream"]
working_dir = "workspace"

[defaults]
mode = "plan"
model = "opus"
max_iterations = 3
auto_push = true

[sessions]
history_limit = 100
cleanup_delay_secs = 60

[server]
port = 8080

[ci]
repo = "acme/widgets"
auto_fix = true
fix_command = "ralph --fix"

[logging]
level = "debug"
json = true
"#;
        let config = BridgeToml::parse(content).unwrap();
        assert_eq!(config.agent.command.as_deref(), Some("/usr/local/bin/ralph"));
        assert_eq!(config.agent.args, vec!["--stream"]);
        assert_eq!(config.defaults.mode, ProcessingMode::Plan);
        assert!(config.defaults.auto_push);
        assert_eq!(config.sessions.history_limit, 100);
        assert_eq!(config.sessions.subscriber_buffer, 256);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.ci.repo.as_deref(), Some("acme/widgets"));
        assert!(config.logging.json);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_parse_invalid_toml_is_error() {
        let err = BridgeToml::parse("[server\nport = ").unwrap_err();
        assert!(err.to_string().contains("bridge.toml"));
    }

    #[test]
    fn test_validate_reports_problems() {
        let mut config = BridgeToml::default();
        config.defaults.max_iterations = 0;
        config.sessions.subscriber_buffer = 0;
        config.ci.repo = Some("not-a-repo".to_string());
        config.ci.auto_fix = true;
        config.logging.level = "loud".to_string();

        let warnings = config.validate();
        assert_eq!(warnings.len(), 5, "{:?}", warnings);
        assert!(warnings.iter().any(|w| w.contains("max_iterations")));
        assert!(warnings.iter().any(|w| w.contains("not-a-repo")));
        assert!(warnings.iter().any(|w| w.contains("fix_command")));
        assert!(warnings.iter().any(|w| w.contains("loud")));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let mut config = BridgeToml::default();
        config.ci.repo = Some("acme/widgets".to_string());
        config.defaults.mode = ProcessingMode::Plan;

        let path = dir.path().join(CONFIG_FILE);
        config.save(&path).unwrap();
        assert_eq!(BridgeToml::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = tempdir().unwrap();
        let config = BridgeToml::load_or_default(dir.path()).unwrap();
        assert_eq!(config, BridgeToml::default());
    }

    #[test]
    fn test_env_overrides() {
        let dir = tempdir().unwrap();
        let mut config = BridgeConfig {
            project_dir: dir.path().to_path_buf(),
            toml: BridgeToml::default(),
            github_token: None,
        };
        let env: HashMap<&str, &str> = [
            ("RALPH_CMD", "my-agent"),
            ("RALPH_BRIDGE_PORT", "4000"),
            ("GITHUB_TOKEN", "ghp_test"),
        ]
        .into_iter()
        .collect();

        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.agent_command().program, "my-agent");
        assert_eq!(config.toml.server.port, 4000);
        assert_eq!(config.github_token.as_deref(), Some("ghp_test"));
    }

    #[test]
    fn test_invalid_port_env_is_ignored() {
        let dir = tempdir().unwrap();
        let mut config = BridgeConfig {
            project_dir: dir.path().to_path_buf(),
            toml: BridgeToml::default(),
            github_token: None,
        };
        config.apply_env(|key| (key == "RALPH_BRIDGE_PORT").then(|| "http".to_string()));
        assert_eq!(config.toml.server.port, 3001);
    }

    #[test]
    fn test_agent_command_resolves_working_dir() {
        let dir = tempdir().unwrap();
        let mut toml = BridgeToml::default();
        toml.agent.working_dir = Some(PathBuf::from("workspace"));
        let config = BridgeConfig {
            project_dir: dir.path().to_path_buf(),
            toml,
            github_token: None,
        };

        let agent = config.agent_command();
        assert_eq!(agent.program, "ralph");
        assert_eq!(agent.working_dir, Some(dir.path().join("workspace")));
        assert_eq!(agent.kill_grace, crate::orchestrator::DEFAULT_KILL_GRACE);
    }

    #[test]
    fn test_agent_kill_grace_from_file() {
        let toml = BridgeToml::parse("[agent]\nkill_grace_secs = 12\n").unwrap();
        let config = BridgeConfig {
            project_dir: PathBuf::from("/tmp/project"),
            toml,
            github_token: None,
        };
        assert_eq!(config.agent_command().kill_grace, Duration::from_secs(12));
    }

    #[test]
    fn test_load_reads_project_config() {
        let dir = tempdir().unwrap();
        let config_dir = dir.path().join(CONFIG_DIR);
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(
            config_dir.join(CONFIG_FILE),
            "[sessions]\nhistory_limit = 42\ncleanup_delay_secs = 5\n",
        )
        .unwrap();

        let config = BridgeConfig::load(dir.path().to_path_buf()).unwrap();
        let registry = config.registry_config();
        assert_eq!(registry.history_limit, 42);
        assert_eq!(registry.cleanup_delay, Duration::from_secs(5));
    }
}
