use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

use super::poller::{CheckRun, FixTrigger};
use crate::errors::CiError;

/// Runs a shell command to start a fix for failing checks.
///
/// The command sees `RALPH_CI_SHA` and `RALPH_CI_FAILURES` (comma-separated
/// check names) in its environment.
#[derive(Debug, Clone)]
pub struct CommandFixTrigger {
    command: String,
    working_dir: Option<PathBuf>,
}

impl CommandFixTrigger {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl FixTrigger for CommandFixTrigger {
    async fn trigger(&self, sha: &str, failed: &[CheckRun]) -> Result<(), CiError> {
        let names: Vec<&str> = failed.iter().map(|r| r.name.as_str()).collect();
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .env("RALPH_CI_SHA", sha)
            .env("RALPH_CI_FAILURES", names.join(","))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let output = cmd
            .output()
            .await
            .map_err(|e| CiError::FixTrigger(format!("failed to run '{}': {}", self.command, e)))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(CiError::FixTrigger(format!(
            "'{}' exited with {}: {}",
            self.command,
            output.status,
            stderr.trim()
        )))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn failed(names: &[&str]) -> Vec<CheckRun> {
        names
            .iter()
            .map(|n| CheckRun {
                name: n.to_string(),
                status: "completed".to_string(),
                conclusion: Some("failure".to_string()),
                html_url: None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_fix_command_receives_context() {
        let dir = TempDir::new().unwrap();
        let trigger = CommandFixTrigger::new(r#"echo "$RALPH_CI_SHA $RALPH_CI_FAILURES" > fix.txt"#)
            .with_working_dir(dir.path());

        trigger.trigger("abc1234", &failed(&["test", "lint"])).await.unwrap();

        let written = std::fs::read_to_string(dir.path().join("fix.txt")).unwrap();
        assert_eq!(written.trim(), "abc1234 test,lint");
    }

    #[tokio::test]
    async fn test_fix_command_failure_is_error() {
        let trigger = CommandFixTrigger::new("echo nope >&2; exit 2");
        let err = trigger.trigger("abc1234", &failed(&["test"])).await.unwrap_err();
        match err {
            CiError::FixTrigger(msg) => assert!(msg.contains("nope"), "{}", msg),
            other => panic!("Expected FixTrigger, got {:?}", other),
        }
    }
}
