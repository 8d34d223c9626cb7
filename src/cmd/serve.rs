//! Dashboard bridge server: `ralph-bridge serve`.

use anyhow::Result;

use super::ci::build_ci_poller;
use ralph_bridge::config::BridgeConfig;
use ralph_bridge::orchestrator::IssueProcessor;
use ralph_bridge::server::{AppState, ServerConfig, start_server};
use ralph_bridge::session::SessionRegistry;

pub async fn cmd_serve(
    config: &BridgeConfig,
    port: Option<u16>,
    host: Option<String>,
    dev: bool,
) -> Result<()> {
    let registry = SessionRegistry::new(config.registry_config());
    let processor = IssueProcessor::new(registry, config.agent_command());
    let mut state = AppState::new(processor, config.default_options());

    match build_ci_poller(config, None).await {
        Ok(poller) => {
            tracing::info!("CI polling enabled");
            state = state.with_ci(poller, config.toml.ci.auto_fix);
        }
        Err(e) => tracing::info!(reason = %e, "CI polling disabled"),
    }

    let server = ServerConfig {
        host: host.unwrap_or_else(|| config.toml.server.host.clone()),
        port: port.unwrap_or(config.toml.server.port),
        dev_mode: dev,
    };
    start_server(server, state).await
}
