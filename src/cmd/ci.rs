//! CI watching: `ralph-bridge ci`.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use ralph_bridge::ci::{CiPoller, CiStatus, CommandFixTrigger, GitHubChecks, github::normalize_repo};
use ralph_bridge::config::BridgeConfig;
use ralph_bridge::errors::CiError;
use ralph_bridge::ui::CiProgress;

/// Resolve the repository: explicit flag, then `ci.repo`, then the `origin`
/// remote of the project checkout.
pub async fn resolve_repo(config: &BridgeConfig, repo: Option<&str>) -> Option<String> {
    if let Some(repo) = repo.or(config.toml.ci.repo.as_deref()) {
        return Some(repo.to_string());
    }
    detect_origin_repo(&config.project_dir).await
}

async fn detect_origin_repo(project_dir: &Path) -> Option<String> {
    let output = tokio::process::Command::new("git")
        .arg("-C")
        .arg(project_dir)
        .args(["remote", "get-url", "origin"])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let url = String::from_utf8_lossy(&output.stdout);
    let repo = normalize_repo(url.trim());
    if let Some(repo) = &repo {
        tracing::debug!(repo = %repo, "Detected GitHub repository from origin remote");
    }
    repo
}

/// Build a poller against GitHub, with the configured fix command attached.
pub async fn build_ci_poller(config: &BridgeConfig, repo: Option<&str>) -> Result<CiPoller, CiError> {
    let repo = resolve_repo(config, repo).await.ok_or(CiError::MissingRepo)?;
    let checks = GitHubChecks::new(&repo, config.github_token.clone())?;
    let mut poller = CiPoller::new(Arc::new(checks), config.poll_config());
    if let Some(command) = &config.toml.ci.fix_command {
        let trigger = CommandFixTrigger::new(command.clone()).with_working_dir(&config.project_dir);
        poller = poller.with_fix_trigger(Arc::new(trigger));
    }
    Ok(poller)
}

/// Poll CI for `sha` until it settles. Returns whether the checks passed.
pub async fn cmd_ci(
    config: &BridgeConfig,
    sha: &str,
    auto_fix: bool,
    repo: Option<&str>,
) -> Result<bool> {
    let poller = build_ci_poller(config, repo).await?;
    let auto_fix = auto_fix || config.toml.ci.auto_fix;
    let mut handle = poller.spawn(sha, auto_fix)?;

    let progress = CiProgress::new(sha);
    while handle.updates.changed().await.is_ok() {
        let result = handle.updates.borrow_and_update().clone();
        progress.update(&result);
        if result.done {
            break;
        }
    }

    let result = handle.task.await.context("CI poll task failed")?;
    progress.finish(&result);
    Ok(matches!(result.status, CiStatus::Success | CiStatus::Mixed))
}
