//! Configuration view and validation commands: `kanban config`.

use std::path::Path;

use anyhow::Result;
use kanban::config::{CONFIG_ENV, CONFIG_FILE, KanbanToml};

use super::super::ConfigCommands;

pub fn cmd_config(work_dir: &Path, explicit: Option<&Path>, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = explicit
        .map(Path::to_path_buf)
        .or_else(|| {
            std::env::var_os(CONFIG_ENV)
                .filter(|v| !v.is_empty())
                .map(std::path::PathBuf::from)
        })
        .unwrap_or_else(|| work_dir.join(CONFIG_FILE));

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Kanban Configuration");
            println!("====================");
            println!();

            let toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                KanbanToml::load(&config_path)?
            } else {
                println!("No {} found at {}", CONFIG_FILE, config_path.display());
                println!("Using default configuration:");
                KanbanToml::default()
            };
            println!();

            println!("[server]");
            println!("  port = {}", toml.server.port);
            println!("  db_path = \"{}\"", toml.server.db_path.display());
            println!("  dev_mode = {}", toml.server.dev_mode);
            println!();

            println!("[realtime]");
            println!("  max_attempts = {}", toml.realtime.max_attempts);
            println!("  base_backoff_ms = {}", toml.realtime.base_backoff_ms);
            println!("  max_backoff_ms = {}", toml.realtime.max_backoff_ms);
            println!("  subscribe_timeout_ms = {}", toml.realtime.subscribe_timeout_ms);
            println!("  ping_interval_secs = {}", toml.realtime.ping_interval_secs);
            println!("  pong_timeout_secs = {}", toml.realtime.pong_timeout_secs);
            println!();

            println!("[sync]");
            println!("  pending_timeout_ms = {}", toml.sync.pending_timeout_ms);
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No {} found. Using defaults (valid).", CONFIG_FILE);
                return Ok(());
            }

            let toml = KanbanToml::load(&config_path)?;
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
        Some(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                println!("{} already exists at {}", CONFIG_FILE, config_path.display());
                println!("Use --force to overwrite it.");
                return Ok(());
            }

            KanbanToml::default().save(&config_path)?;

            println!("Created {} at {}", CONFIG_FILE, config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [server] port, db_path, dev_mode");
            println!("  - [realtime] retry and keepalive timing");
            println!("  - [sync] pending_timeout_ms");
            println!();
        }
    }

    Ok(())
}
