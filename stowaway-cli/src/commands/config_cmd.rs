use clap::{Args, Subcommand};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use super::{CommandError, OutputFormat};
use crate::config::Config;

#[derive(Debug, Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigSubcommand {
    /// Show current configuration values
    Show {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Initialize configuration file
    Init,
}

const DEFAULT_CONFIG: &str = r#"# stowaway configuration

# Path to the local SQLite store (default: platform data dir/stowaway/stowaway.db)
# database_path: stowaway.db

remote:
  # PostgREST / Supabase base URL
  # url: https://your-project.supabase.co
  # api_key: your-anon-key
  timeout_secs: 30

sync:
  batch_limit: 1000
  call_timeout_secs: 15
  interval_secs: 60
  max_tries: 5

# Map action namespaces to remote collections.
# Unregistered namespaces write to a collection of the same name unless strict.
catalog:
  strict: false
  collections: {}
  #   diet:
  #     collection: dietas
  #     conflict_key: [id]
  #     children:
  #       - field: items
  #         collection: dieta_items
  #         parent_field: dieta_id
"#;

impl ConfigCommand {
    pub fn run(&self, config: &Config, config_path: Option<PathBuf>) -> Result<(), CommandError> {
        match &self.command {
            ConfigSubcommand::Show { format } => {
                match format {
                    OutputFormat::Json => {
                        let json = serde_json::to_string_pretty(config)
                            .map_err(CommandError::InvalidJson)?;
                        println!("{}", json);
                    }
                    OutputFormat::Text => {
                        println!("Configuration");
                        println!("=============\n");

                        if let Some(path) = &config.config_file {
                            println!("Config file: {}", path.display());
                        } else {
                            println!(
                                "Config file: {} (not found)",
                                config_path
                                    .unwrap_or_else(Config::default_config_path)
                                    .display()
                            );
                        }
                        println!();

                        println!("database_path: {}", config.database_path.value.display());
                        println!("  source: {}", config.database_path.source);
                        println!();

                        println!(
                            "remote.url: {}",
                            config.remote.url.as_deref().unwrap_or("(not set)")
                        );
                        println!("remote.timeout_secs: {}", config.remote.timeout_secs);
                        println!();

                        println!("sync.batch_limit: {}", config.sync.batch_limit);
                        println!("sync.call_timeout_secs: {}", config.sync.call_timeout_secs);
                        println!("sync.interval_secs: {}", config.sync.interval_secs);
                        println!("sync.max_tries: {}", config.sync.max_tries);
                        println!();

                        println!("catalog.strict: {}", config.catalog.strict);
                        for (namespace, spec) in &config.catalog.collections {
                            println!(
                                "  {} -> {} (key: {})",
                                namespace,
                                spec.collection,
                                spec.conflict_key.join(", ")
                            );
                        }
                    }
                }
                Ok(())
            }

            ConfigSubcommand::Init => {
                let config_path = config_path.unwrap_or_else(Config::default_config_path);
                init_config(&config_path)
            }
        }
    }
}

fn init_config(config_path: &std::path::Path) -> Result<(), CommandError> {
    if config_path.exists() {
        println!("Config file already exists: {}", config_path.display());
        println!("Use 'stow config show' to view current configuration.");
        return Ok(());
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = fs::File::create(config_path)?;
    file.write_all(DEFAULT_CONFIG.as_bytes())?;

    println!("Created config file: {}", config_path.display());
    println!("\nEdit this file to customize your settings.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_init_writes_loadable_config() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("nested/config.yaml");

        init_config(&config_path).unwrap();

        let config = Config::load(Some(config_path.clone())).unwrap();
        assert_eq!(config.config_file, Some(config_path));
        assert_eq!(config.sync.max_tries, 5);
        assert!(config.catalog.collections.is_empty());
    }

    #[test]
    fn test_init_keeps_existing_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        fs::write(&config_path, "sync:\n  max_tries: 9\n").unwrap();

        init_config(&config_path).unwrap();

        let config = Config::load(Some(config_path)).unwrap();
        assert_eq!(config.sync.max_tries, 9);
    }
}
