//! `bundleflow verify`: validate a manifest and optionally its bundle files.

use std::path::Path;

use bundleflow::manifest::Manifest;
use bundleflow::verify::verify_file;
use console::style;
use tracing::warn;

use super::common::format_size;
use crate::error::CliError;
use crate::runner::CliRunner;

pub fn run(runner: &CliRunner, manifest_path: &Path, dir: Option<&Path>) -> Result<(), CliError> {
    let manifest =
        Manifest::load(manifest_path).map_err(|e| CliError::InvalidManifest(e.to_string()))?;

    let total_bytes: u64 = manifest.iter().map(|e| e.size_bytes).sum();
    println!("Manifest: {}", manifest_path.display());
    println!("  Resource version: {}", manifest.resource_version);
    println!("  Bundles:          {}", manifest.len());
    println!("  Total size:       {}", format_size(total_bytes));
    if !manifest.variants.is_empty() {
        println!("  Variant groups:   {}", manifest.variants.len());
    }

    let Some(dir) = dir else {
        println!("{} Manifest is valid", style("✓").green());
        return Ok(());
    };

    let level = runner.settings().verify_level;
    println!();
    println!("Verifying bundle files in {} (level {})", dir.display(), level);

    let mut failed = 0;
    for entry in manifest.iter() {
        let path = dir.join(&entry.content_hash);
        if let Err(e) = verify_file(&path, entry, level) {
            warn!(bundle = %entry.name, path = %path.display(), error = %e, "Verification failed");
            println!("  {} {}: {}", style("✗").red(), entry.name, e);
            failed += 1;
        }
    }

    if failed > 0 {
        return Err(CliError::VerificationFailed {
            failed,
            total: manifest.len(),
        });
    }
    println!(
        "{} All {} bundle files verified",
        style("✓").green(),
        manifest.len()
    );
    Ok(())
}
