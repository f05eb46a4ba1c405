//! `strata extract` command - Write the tree of a self-contained archive to disk.

use std::path::PathBuf;

use clap::Args;
use strata_runtime::extract_archive;

use crate::output;

#[derive(Args)]
pub struct ExtractArgs {
    /// Archive file (embedded storage mode)
    pub archive: PathBuf,

    /// Directory to extract into
    #[arg(short, long, default_value = ".")]
    pub output: PathBuf,
}

pub async fn execute(args: ExtractArgs) -> Result<(), Box<dyn std::error::Error>> {
    let (archive, dest) = (args.archive.clone(), args.output.clone());
    let summary = tokio::task::spawn_blocking(move || extract_archive(&archive, &dest)).await??;

    println!(
        "Extracted {} files ({}), {} directories, {} symlinks and {} hard links into {}",
        summary.files,
        output::format_bytes(summary.bytes),
        summary.directories,
        summary.symlinks,
        summary.hard_links,
        args.output.display()
    );
    Ok(())
}
