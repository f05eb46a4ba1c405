//! `strata version` command.

use clap::Args;

#[derive(Args)]
pub struct VersionArgs;

pub async fn execute(_args: VersionArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("strata version {}", strata_core::VERSION);
    println!("archive format {}", strata_core::ARCHIVE_VERSION);
    Ok(())
}
