//! CI status polling for pushed commits.
//!
//! | Module   | Purpose                                              |
//! |----------|------------------------------------------------------|
//! | `poller` | Check-run classification and the bounded poll loop   |
//! | `github` | GitHub check-runs API source                         |
//! | `fix`    | Shell-command fix trigger                            |
//!
//! Results travel on their own watch channel, separate from session events.

pub mod fix;
pub mod github;
pub mod poller;

pub use fix::CommandFixTrigger;
pub use github::GitHubChecks;
pub use poller::{
    CheckRun, CheckState, CheckSummary, CiPollResult, CiPoller, CiStatus, CiStatusSource,
    FixTrigger, PollConfig, PollHandle, validate_sha,
};
