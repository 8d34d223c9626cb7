//! Typed error hierarchy for the bridge.
//!
//! - `OrchestratorError`: agent process lifecycle failures
//! - `CiError`: CI status polling and fix-trigger failures
//!
//! Neither escapes the public pipeline entry points: the orchestrator turns
//! its errors into failed sessions, and the poller reports them on its
//! result channel. HTTP-level errors live in `server::api::ApiError`.

use thiserror::Error;

/// Errors from driving the agent subprocess.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Failed to spawn agent process '{program}': {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Agent process did not expose its {0} pipe")]
    MissingPipe(&'static str),

    #[error("Failed to wait for agent process: {0}")]
    WaitFailed(#[source] std::io::Error),

    #[error("Agent exited with code {0}")]
    NonZeroExit(i32),

    #[error("Agent terminated by signal")]
    Killed,

    #[error("No issues to process")]
    EmptyBatch,
}

/// Errors from CI status polling.
#[derive(Debug, Error)]
pub enum CiError {
    #[error("No GitHub repository configured for CI polling")]
    MissingRepo,

    #[error("Invalid commit SHA '{0}'")]
    InvalidSha(String),

    #[error("GitHub request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("GitHub API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Fix trigger failed: {0}")]
    FixTrigger(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
