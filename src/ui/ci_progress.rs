use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

use super::icons::{CHECK, CROSS, HOURGLASS};
use crate::ci::{CiPollResult, CiStatus};

/// Spinner tracking a CI poll in the terminal.
pub struct CiProgress {
    bar: ProgressBar,
}

impl CiProgress {
    pub fn new(sha: &str) -> Self {
        let spinner_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        let bar = ProgressBar::new_spinner();
        bar.set_style(spinner_style);
        bar.set_prefix(format!("CI {}", short_sha(sha)));
        bar.set_message("waiting for check runs");
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }

    pub fn update(&self, result: &CiPollResult) {
        self.bar.set_message(status_line(result));
    }

    pub fn finish(&self, result: &CiPollResult) {
        let icon = match result.status {
            CiStatus::Success => &CHECK,
            CiStatus::Failure => &CROSS,
            _ => &HOURGLASS,
        };
        self.bar
            .finish_with_message(format!("{}{}", icon, status_line(result)));

        for run in &result.checks.failed {
            let conclusion = run.conclusion.as_deref().unwrap_or("failed");
            match &run.html_url {
                Some(url) => println!("    {} {} {}", style(&run.name).red(), conclusion, style(url).dim()),
                None => println!("    {} {}", style(&run.name).red(), conclusion),
            }
        }
        if result.fix_triggered {
            println!("    {}", style("fix triggered").yellow());
        }
    }
}

pub fn status_line(result: &CiPollResult) -> String {
    let checks = &result.checks;
    let mut line = format!(
        "{} ({} passed, {} failed, {} running, {} other) attempt {}/{}",
        result.status,
        checks.passed.len(),
        checks.failed.len(),
        checks.running.len(),
        checks.other.len(),
        result.attempt,
        result.max_attempts
    );
    if result.exhausted() {
        line.push_str(" - gave up");
    }
    if let Some(error) = &result.error {
        line.push_str(&format!(" - last error: {}", error));
    }
    line
}

fn short_sha(sha: &str) -> &str {
    sha.get(..7).unwrap_or(sha)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ci::{CheckRun, CheckSummary};

    #[test]
    fn test_status_line_counts() {
        let mut result = CiPollResult::initial("abcdef1234", 5);
        result.attempt = 2;
        result.checks = CheckSummary::from_runs(vec![
            CheckRun {
                name: "build".to_string(),
                status: "completed".to_string(),
                conclusion: Some("success".to_string()),
                html_url: None,
            },
            CheckRun {
                name: "test".to_string(),
                status: "in_progress".to_string(),
                conclusion: None,
                html_url: None,
            },
        ]);
        result.status = result.checks.status();

        let line = status_line(&result);
        assert_eq!(
            line,
            "running (1 passed, 0 failed, 1 running, 0 other) attempt 2/5"
        );
    }

    #[test]
    fn test_status_line_exhausted_with_error() {
        let mut result = CiPollResult::initial("abcdef1234", 1);
        result.attempt = 1;
        result.done = true;
        result.error = Some("GitHub API returned 404: Not Found".to_string());
        let line = status_line(&result);
        assert!(line.contains("gave up"));
        assert!(line.contains("404"));
    }

    #[test]
    fn test_short_sha() {
        assert_eq!(short_sha("abcdef1234"), "abcdef1");
        assert_eq!(short_sha("abc"), "abc");
    }
}
