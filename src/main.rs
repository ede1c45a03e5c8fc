//! Entry point for the partlink linker.
//!
//! This file handles high-level application flow:
//! 1. Parse command-line arguments using `clap`.
//! 2. Map the inputs and check they target x86_64.
//! 3. Run the link: load, resolve groups, verify, layout, relocate, write.
//!
//! Error handling is done via `anyhow`.

use anyhow::{Context, Result};
use clap::Parser;
use memmap2::Mmap;
use object::{Architecture as ObjArch, Object};
use std::fs::File;

use partlink::arch::x86_64::X86_64;
use partlink::config::{init_logging, Config};
use partlink::linker::Linker;

fn main() -> Result<()> {
    let invocation = Config::parse().invocation();
    init_logging(&invocation.log_level);

    if invocation.inputs.is_empty() {
        anyhow::bail!("no input files");
    }

    let mut mapped = Vec::new();
    for path in &invocation.inputs {
        let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        // SAFETY: inputs are not modified while the link runs.
        let mmap = unsafe { Mmap::map(&file)? };

        if !mmap.starts_with(b"!<arch>\n") {
            let obj = object::File::parse(&*mmap)
                .with_context(|| format!("failed to parse object file {}", path.display()))?;
            if obj.architecture() != ObjArch::X86_64 {
                anyhow::bail!(
                    "Unsupported architecture in {}: {:?}. Only X86_64 is supported.",
                    path.display(),
                    obj.architecture()
                );
            }
        }
        mapped.push((path.clone(), mmap));
    }

    let mut linker = Linker::new(X86_64);
    for (path, mmap) in &mapped {
        linker.add_file(path, mmap)?;
    }

    linker.resolve_groups()?;
    linker.verify_unresolved()?;
    linker.layout()?;
    linker.relocate()?;

    for group in linker.groups() {
        tracing::info!(
            "partial array `{}`: {} bytes at {:#x}",
            group.group,
            group.byte_len(),
            group.start
        );
        if invocation.print_groups {
            let count = group.len().map_or_else(|| "?".to_string(), |n| n.to_string());
            println!(
                "{:<32} {:#012x} {:#012x} {:>8} {:>6}",
                group.group,
                group.start,
                group.end,
                count,
                group.element_size.map_or_else(|| "?".to_string(), |s| s.to_string())
            );
        }
    }

    linker.write(&invocation.output)?;

    println!("Linked successfully to {}", invocation.output.display());
    Ok(())
}
