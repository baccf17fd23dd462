//! Configuration view and validation commands: `master-control config`.

use std::path::Path;

use anyhow::{Context, Result};

use master_control::config::MasterConfig;

use super::super::ConfigCommands;

pub fn cmd_config(
    config_path: &Path,
    config: &MasterConfig,
    command: Option<ConfigCommands>,
) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            if config_path.exists() {
                println!("# Config file: {}", config_path.display());
            } else {
                println!("# No config file at {}; using defaults", config_path.display());
            }
            println!("# Effective values (with env overrides, secrets omitted)");
            println!();
            let rendered =
                toml::to_string_pretty(config).context("Failed to render configuration")?;
            print!("{}", rendered);
        }
        Some(ConfigCommands::Validate) => {
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
        }
    }
    Ok(())
}
