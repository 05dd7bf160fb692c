//! bundleflow CLI - Command-line interface
//!
//! Updates, inspects and maintains a bundleflow sandbox.

mod commands;
mod error;
mod runner;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use console::style;

use commands::cache::CacheAction;
use commands::config::ConfigCommands;
use error::CliError;
use runner::CliRunner;

#[derive(Debug, Parser)]
#[command(name = "bundleflow", version, about = "Versioned bundle distribution and caching")]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Update local bundles to the server's resource version
    Update {
        /// Download without asking for confirmation
        #[arg(short, long)]
        yes: bool,

        /// Only download untagged bundles and bundles with these tags
        #[arg(short, long, value_delimiter = ',')]
        tags: Vec<String>,
    },

    /// Validate a manifest's structure and dependency graph
    Verify {
        /// Manifest file to validate
        manifest: PathBuf,

        /// Also verify bundle files stored in this directory by content hash
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },

    /// Show which bundles an update would download
    Diff {
        /// Diff against this manifest file instead of fetching the remote one
        #[arg(short, long)]
        manifest: Option<PathBuf>,

        /// Only consider untagged bundles and bundles with these tags
        #[arg(short, long, value_delimiter = ',')]
        tags: Vec<String>,
    },

    /// Inspect or clear the sandbox cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Show configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

/// Load configuration, start logging and record the command.
fn start(cli_config: Option<&Path>, verbose: bool, command: &str) -> Result<CliRunner, CliError> {
    let runner = CliRunner::new(cli_config, verbose)?;
    runner.log_startup(command);
    Ok(runner)
}

fn run(cli: Cli) -> Result<(), CliError> {
    let config = cli.config.as_deref();
    match cli.command {
        Commands::Update { yes, tags } => {
            let runner = start(config, cli.verbose, "update")?;
            commands::update::run(&runner, commands::update::UpdateArgs { yes, tags })
        }
        Commands::Verify { manifest, dir } => {
            let runner = start(config, cli.verbose, "verify")?;
            commands::verify::run(&runner, &manifest, dir.as_deref())
        }
        Commands::Diff { manifest, tags } => {
            let runner = start(config, cli.verbose, "diff")?;
            commands::diff::run(&runner, manifest.as_deref(), tags)
        }
        Commands::Cache { action } => {
            let runner = start(config, cli.verbose, "cache")?;
            commands::cache::run(&runner, action)
        }
        // Config commands run before logging so a broken file can be inspected.
        Commands::Config { command } => commands::config::run(command, config),
    }
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("{} {}", style("error:").red().bold(), e);
        std::process::exit(e.exit_code());
    }
}
