//! Entry point for partgen.
//!
//! Reads fragment manifests in the order given, merges them, and writes one
//! Rust source file holding every group as a sized static array.

use anyhow::{Context, Result};
use clap::Parser;

use partlink::codegen;
use partlink::config::{init_logging, GenConfig};
use partlink::manifest::ManifestSet;

fn main() -> Result<()> {
    let config = GenConfig::parse();
    init_logging(&config.log_level);

    let mut manifests = ManifestSet::new();
    for path in &config.manifests {
        manifests.load(path)?;
    }

    let groups = manifests.resolve(&config.require)?;
    for group in &groups {
        tracing::info!(
            "partial array `{}`: {} elements from {} module(s)",
            group.name,
            group.len(),
            group.contributors.len()
        );
    }

    let source = codegen::render(&groups);
    match &config.output {
        Some(path) => std::fs::write(path, source)
            .with_context(|| format!("failed to write {}", path.display()))?,
        None => print!("{source}"),
    }
    Ok(())
}
