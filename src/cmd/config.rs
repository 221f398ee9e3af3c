//! Configuration view and validation commands — `beacon config`.

use anyhow::Result;
use beacon::config::{BeaconConfig, BeaconToml, CONFIG_DIR, CONFIG_FILE};

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    let beacon_dir = project_dir.join(CONFIG_DIR);
    let config_path = beacon_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Beacon Configuration");
            println!("====================");
            println!();

            let toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                BeaconToml::load(&config_path)?
            } else {
                println!("No beacon.toml found at {}", config_path.display());
                println!("Using default configuration.");
                BeaconToml::default()
            };
            println!();

            println!("[app]");
            println!("  name = \"{}\"", toml.app.name);
            println!("  version = \"{}\"", toml.app.version);
            println!();
            println!("[backend]");
            println!("  base_url = \"{}\"", toml.backend.base_url);
            println!("  endpoint = \"{}\"", toml.backend.endpoint);
            println!("  timeout_secs = {}", toml.backend.timeout_secs);
            println!();
            println!("[batch]");
            println!("  flush_delay_ms = {}", toml.batch.flush_delay_ms);
            println!();
            println!("[identity]");
            println!("  store = \"{}\"", toml.identity.store);
            if let Some(path) = &toml.identity.path {
                println!("  path = \"{}\"", path.display());
            }
            println!();
            println!("[experiments]");
            println!("  hash = \"{}\"", toml.experiments.hash);
            println!("  track_exposures = {}", toml.experiments.track_exposures);
            println!();
            println!("[logging]");
            println!("  level = \"{}\"", toml.logging.level);
            println!("  json = {}", toml.logging.json);
            println!();

            println!("Effective values (with env overrides):");
            let config = BeaconConfig::new(project_dir.to_path_buf())?;
            println!("  backend_url = \"{}\"", config.backend_url());
            println!("  flush_delay_ms = {}", config.flush_delay().as_millis());
            println!("  storage_path = \"{}\"", config.storage_path().display());
            println!("  log_filter = \"{}\"", config.log_filter());
            println!();

            if !config_path.exists() {
                println!("Run 'beacon config init' to create a beacon.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No beacon.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = BeaconToml::load(&config_path)?;
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
                println!("beacon.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if !beacon_dir.exists() {
                std::fs::create_dir_all(&beacon_dir)?;
            }

            let toml = BeaconToml::default();
            toml.save(&config_path)?;

            println!("Created beacon.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [app] name, version");
            println!("  - [backend] base_url, endpoint, timeout_secs");
            println!("  - [batch] flush_delay_ms");
            println!("  - [experiments] hash, track_exposures");
            println!();
        }
    }

    Ok(())
}
