//! Configuration CLI commands.
//!
//! Provides `config path`, `config list` and `config init`.

use std::path::{Path, PathBuf};

use bundleflow::Settings;
use clap::Subcommand;

use crate::error::CliError;

/// Config subcommands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    /// Show the configuration file path
    Path,

    /// List all configuration settings
    List,

    /// Write a configuration file with default settings
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Run a config subcommand.
pub fn run(command: ConfigCommands, config: Option<&Path>) -> Result<(), CliError> {
    let path = resolve_path(config)?;
    match command {
        ConfigCommands::Path => run_path(&path),
        ConfigCommands::List => run_list(&path),
        ConfigCommands::Init { force } => run_init(&path, force),
    }
}

fn resolve_path(config: Option<&Path>) -> Result<PathBuf, CliError> {
    match config {
        Some(path) => Ok(path.to_path_buf()),
        None => Ok(Settings::default_path()?),
    }
}

fn run_path(path: &Path) -> Result<(), CliError> {
    println!("{}", path.display());
    if !path.exists() {
        println!("(file does not exist, using defaults)");
    }
    Ok(())
}

/// List all configuration settings grouped by section.
fn run_list(path: &Path) -> Result<(), CliError> {
    let settings = Settings::load_or_default(path)?;

    println!("Configuration Settings");
    println!("======================");
    println!();

    let mut current_section = String::new();
    for (name, value) in settings.entries() {
        let (section, key) = name.split_once('.').unwrap_or(("", name.as_str()));

        if section != current_section {
            if !current_section.is_empty() {
                println!();
            }
            println!("[{}]", section);
            current_section = section.to_string();
        }

        if value.is_empty() {
            println!("  {} = (not set)", key);
        } else {
            println!("  {} = {}", key, value);
        }
    }

    Ok(())
}

fn run_init(path: &Path, force: bool) -> Result<(), CliError> {
    if path.exists() && !force {
        return Err(CliError::Config(format!(
            "{} already exists. Use --force to overwrite it.",
            path.display()
        )));
    }
    Settings::default().save(path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_writes_loadable_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.ini");

        run_init(&path, false).unwrap();
        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded.entries(), Settings::default().entries());
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.ini");
        std::fs::write(&path, "[remote]\nprimary_url = http://cdn\n").unwrap();

        assert!(matches!(run_init(&path, false), Err(CliError::Config(_))));
        run_init(&path, true).unwrap();
        assert_eq!(
            Settings::load(&path).unwrap().primary_url,
            Settings::default().primary_url
        );
    }
}
