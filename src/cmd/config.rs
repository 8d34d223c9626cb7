//! Configuration view and validation commands: `ralph-bridge config`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;

use super::super::ConfigCommands;
use ralph_bridge::config::{BridgeConfig, BridgeToml, CONFIG_DIR, CONFIG_FILE};

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let config_dir = project_dir.join(CONFIG_DIR);
    let config_path = config_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("{}", style("Ralph Bridge Configuration").bold());
            println!("==========================");
            println!();

            let toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                BridgeToml::load(&config_path)?
            } else {
                println!("No {} found at {}", CONFIG_FILE, config_path.display());
                println!("Using default configuration.");
                BridgeToml::default()
            };
            println!();

            let rendered =
                toml::to_string_pretty(&toml).context("Failed to render configuration")?;
            for line in rendered.lines() {
                println!("  {}", line);
            }
            println!();

            println!("Effective values (with env overrides):");
            let config = BridgeConfig::load(project_dir.to_path_buf())?;
            let agent = config.agent_command();
            println!("  agent command = \"{}\"", agent.program);
            println!("  server port = {}", config.toml.server.port);
            println!(
                "  github token = {}",
                if config.github_token.is_some() { "set" } else { "not set" }
            );
            println!();

            if !config_path.exists() {
                println!("Run 'ralph-bridge config init' to create a {} file.", CONFIG_FILE);
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No {} found. Using defaults (valid).", CONFIG_FILE);
                return Ok(());
            }

            let toml = BridgeToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("{} already exists at {}", CONFIG_FILE, config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&config_dir).with_context(|| {
                format!("Failed to create config directory: {}", config_dir.display())
            })?;
            BridgeToml::default().save(&config_path)?;

            println!("Created {} at {}", CONFIG_FILE, config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [agent] command, args, working_dir");
            println!("  - [defaults] mode, model, max_iterations, auto_push");
            println!("  - [ci] repo, interval_secs, max_attempts, auto_fix, fix_command");
            println!();
        }
    }

    Ok(())
}
