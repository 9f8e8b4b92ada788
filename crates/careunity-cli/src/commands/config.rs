use std::path::Path;

use crate::cli::ConfigCommands;
use crate::commands::common::load_config;
use crate::error::CliError;

pub fn run_config(command: &ConfigCommands, config_path: &Path) -> Result<(), CliError> {
    match command {
        ConfigCommands::Show => {
            let config = load_config(config_path)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ConfigCommands::Path => {
            let marker = if config_path.exists() {
                ""
            } else {
                " (missing; defaults in use)"
            };
            println!("{}{marker}", config_path.display());
        }
    }
    Ok(())
}
