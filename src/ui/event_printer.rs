use console::style;

use super::icons::{CHECK, CI, CROSS, GEAR, HOURGLASS, PROGRESS, PUSH, SPARKLE};
use crate::session::{Activity, ActivityStatus, ActivityType, StreamEvent, StreamEventKind};
use crate::stream::tool_emoji;

/// Render one event as a terminal line. Pending tool placeholders and system
/// chatter are hidden unless `verbose`.
pub fn format_event(event: &StreamEvent, verbose: bool) -> Option<String> {
    let prefix = style(format!("[{}]", event.issue_id)).cyan().bold();
    let body = match &event.kind {
        StreamEventKind::Activity(activity) => format_activity(activity, verbose)?,
        StreamEventKind::Metrics(m) => {
            if !verbose {
                return None;
            }
            format!(
                "{}iteration {}/{} - ${:.4} total, {:.1}s",
                PROGRESS,
                m.iteration,
                m.max_iterations,
                m.total_cost_usd,
                m.total_duration_ms as f64 / 1000.0
            )
        }
        StreamEventKind::Complete(payload) => {
            let detail = payload.message.as_deref().unwrap_or("completed");
            format!("{}{}", CHECK, style(detail).green().bold())
        }
        StreamEventKind::Error(payload) => {
            format!("{}{}", CROSS, style(format!("failed: {}", payload.message)).red().bold())
        }
    };
    Some(format!("{} {}", prefix, body))
}

fn format_activity(activity: &Activity, verbose: bool) -> Option<String> {
    let details = activity.details.as_deref().unwrap_or_default();
    let line = match activity.activity_type {
        ActivityType::Tool => {
            let tool = activity.tool.as_deref().unwrap_or("tool");
            match activity.status {
                Some(ActivityStatus::Pending) | Some(ActivityStatus::Running) => {
                    if !verbose {
                        return None;
                    }
                    format!("{}{}", HOURGLASS, style(details).dim())
                }
                _ => {
                    let duration = activity
                        .duration
                        .map(|ms| format!(" {}", style(format!("({}ms)", ms)).dim()))
                        .unwrap_or_default();
                    format!("{} {} {}{}", tool_emoji(tool), style(tool).bold(), details, duration)
                }
            }
        }
        ActivityType::Message => format!("  {}", details),
        ActivityType::Result => {
            let icon = if activity.status == Some(ActivityStatus::Error) {
                &CROSS
            } else {
                &PROGRESS
            };
            format!("{}{}", icon, style(details).yellow())
        }
        ActivityType::Error => format!("{}{}", CROSS, style(details).red()),
        ActivityType::System => {
            if !verbose && activity.status != Some(ActivityStatus::Running) {
                return None;
            }
            format!("{}{}", GEAR, style(details).dim())
        }
        ActivityType::Push => format!("{}{}", PUSH, details),
        ActivityType::Ci => format!("{}{}", CI, details),
    };
    Some(line)
}

/// Prints a batch's events and the agent's free-text output.
#[derive(Debug, Clone, Copy)]
pub struct EventPrinter {
    verbose: bool,
}

impl EventPrinter {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    pub fn print_event(&self, event: &StreamEvent) {
        if let Some(line) = format_event(event, self.verbose) {
            println!("{}", line);
        }
    }

    pub fn print_log(&self, line: &str) {
        if self.verbose {
            println!("    {} {}", style("│").dim(), style(line).dim());
        }
    }

    pub fn print_header(&self, issue_ids: &[String], mode: &str, model: &str) {
        println!();
        println!(
            "{}Processing {} in {} mode with {}",
            SPARKLE,
            style(issue_ids.join(", ")).cyan().bold(),
            style(mode).yellow(),
            style(model).yellow()
        );
        println!();
    }
}
