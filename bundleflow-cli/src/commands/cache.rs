//! Sandbox cache management CLI commands.

use bundleflow::cache::OpenOutcome;
use clap::Subcommand;

use super::common::format_size;
use crate::error::CliError;
use crate::runner::CliRunner;

/// Cache action subcommands.
#[derive(Debug, Subcommand)]
pub enum CacheAction {
    /// Show sandbox cache statistics
    Stats,
    /// Delete cached bundles
    Clear {
        /// Only delete bundles no manifest refers to
        #[arg(long)]
        unused: bool,
    },
}

/// Run a cache subcommand.
pub fn run(runner: &CliRunner, action: CacheAction) -> Result<(), CliError> {
    let mut system = runner.system()?;
    let cache_dir = system.cache().layout().cache_dir();

    match action {
        CacheAction::Stats => {
            println!("Sandbox cache: {}", cache_dir.display());
            let stats = system.cache_stats();
            println!("  Cached bundles:   {}", stats.entries);
            println!(
                "  Local version:    {}",
                system.local_manifest().resource_version
            );
            println!("  Built-in bundles: {}", system.builtin_manifest().len());
            if let OpenOutcome::ClearedDirty { previous } = system.open_outcome() {
                println!(
                    "  Cleared on open:  written by app version {}",
                    previous
                );
            }
            Ok(())
        }
        CacheAction::Clear { unused } => {
            let result = if unused {
                println!("Clearing unused bundles in: {}", cache_dir.display());
                system.clear_unused_cache()?
            } else {
                println!("Clearing sandbox cache at: {}", cache_dir.display());
                system.clear_cache()?
            };
            println!(
                "Deleted {} files, freed {}",
                result.files_deleted,
                format_size(result.bytes_freed)
            );
            Ok(())
        }
    }
}
