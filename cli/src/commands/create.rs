//! `strata create` command - Pack a directory into a self-contained archive.

use std::path::PathBuf;
use std::time::Instant;

use clap::Args;
use strata_runtime::create_archive;

use crate::output;

#[derive(Args)]
pub struct CreateArgs {
    /// Directory to pack
    pub source: PathBuf,

    /// Archive file to write
    #[arg(short, long)]
    pub output: PathBuf,
}

pub async fn execute(args: CreateArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("Packing {}...", args.source.display());
    let started = Instant::now();

    let (source, archive) = (args.source.clone(), args.output.clone());
    let summary = tokio::task::spawn_blocking(move || create_archive(&source, &archive)).await??;

    println!(
        "Wrote {} ({} files, {} directories, {} symlinks, {} hard links) in {:.1}s",
        args.output.display(),
        summary.files,
        summary.directories,
        summary.symlinks,
        summary.hard_links,
        started.elapsed().as_secs_f64()
    );
    println!("Payload: {}", output::format_bytes(summary.payload_bytes));
    Ok(())
}
