//! Terminal batch processing: `ralph-bridge run`.

use anyhow::{Result, bail};
use console::style;

use ralph_bridge::config::BridgeConfig;
use ralph_bridge::orchestrator::{BatchCallbacks, IssueProcessor};
use ralph_bridge::session::{ProcessingMode, SessionRegistry, SessionStatus, Subscription};
use ralph_bridge::ui::EventPrinter;
use ralph_bridge::ui::icons::{CHECK, CROSS};

/// Per-run overrides of the configured processing defaults.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub mode: Option<ProcessingMode>,
    pub model: Option<String>,
    pub max_iterations: Option<u32>,
    pub auto_push: bool,
}

/// Process `issue_ids` in one agent run, printing events as they arrive.
/// Returns whether every issue completed. Ctrl-C cancels the batch.
pub async fn cmd_run(
    config: &BridgeConfig,
    issue_ids: Vec<String>,
    overrides: RunOverrides,
    verbose: bool,
) -> Result<bool> {
    let mut options = config.default_options();
    if let Some(mode) = overrides.mode {
        options.mode = mode;
    }
    if let Some(model) = overrides.model {
        options.model = model;
    }
    if let Some(max_iterations) = overrides.max_iterations {
        options.max_iterations = max_iterations;
    }
    options.auto_push |= overrides.auto_push;
    if options.max_iterations == 0 {
        bail!("--max-iterations must be at least 1");
    }

    let registry = SessionRegistry::new(config.registry_config());
    let printer = EventPrinter::new(verbose);
    printer.print_header(&issue_ids, &options.mode.to_string(), &options.model);

    let subscriptions: Vec<Subscription> = issue_ids
        .iter()
        .map(|id| {
            registry.subscribe(id, move |event| {
                printer.print_event(event);
                Ok(())
            })
        })
        .collect();

    let processor = IssueProcessor::new(registry.clone(), config.agent_command());
    let callbacks = BatchCallbacks::new().on_log(move |line| printer.print_log(line));
    let handle = processor.process_issues(issue_ids.clone(), options, callbacks);
    tracing::info!(batch_id = %handle.id(), issues = issue_ids.len(), "Batch started");

    let canceller = handle.canceller();
    let wait = handle.wait();
    tokio::pin!(wait);
    let outcome = tokio::select! {
        outcome = &mut wait => outcome,
        Ok(()) = tokio::signal::ctrl_c() => {
            println!();
            println!("{}", style("Interrupted, cancelling batch...").yellow());
            canceller.cancel();
            wait.await
        }
    };
    drop(subscriptions);

    println!();
    let mut all_completed = true;
    for issue_id in &issue_ids {
        let Some(session) = registry.get_session(issue_id) else {
            all_completed = false;
            continue;
        };
        match session.status {
            SessionStatus::Completed => {
                println!("{}{} completed", CHECK, style(issue_id).bold());
            }
            status => {
                all_completed = false;
                let reason = session.error.as_deref().unwrap_or(status.as_str());
                println!("{}{} {}", CROSS, style(issue_id).bold(), style(reason).red());
            }
        }
    }

    if let Some(error) = &outcome.error {
        tracing::debug!(error = %error, "Batch finished with error");
    }
    Ok(outcome.success && all_completed)
}
