//! `strata cat` command - Write a file from an archive to stdout.

use std::path::PathBuf;

use clap::Args;
use strata_core::StrataConfig;
use tokio::io::AsyncWriteExt;

/// Bytes requested from the image per read.
const CHUNK_SIZE: u64 = 1024 * 1024;

#[derive(Args)]
pub struct CatArgs {
    /// Archive file
    pub archive: PathBuf,

    /// File inside the image
    pub path: String,

    /// Start reading at this byte offset
    #[arg(long, default_value_t = 0)]
    pub offset: u64,

    /// Read at most this many bytes
    #[arg(long)]
    pub length: Option<u64>,
}

pub async fn execute(args: CatArgs, config: &StrataConfig) -> Result<(), Box<dyn std::error::Error>> {
    let (image, resolver) = super::open_image(&args.archive, config)?;

    let node = image.lookup(&args.path)?;
    let size = node.size();
    let end = match args.length {
        Some(length) => args.offset.saturating_add(length).min(size),
        None => size,
    };

    let mut stdout = tokio::io::stdout();
    let mut offset = args.offset;
    while offset < end {
        let chunk = image.read(node, offset, (end - offset).min(CHUNK_SIZE)).await?;
        if chunk.is_empty() {
            break;
        }
        stdout.write_all(&chunk).await?;
        offset += chunk.len() as u64;
    }
    stdout.flush().await?;

    // Remote cache uploads run in the background; let them land before exit
    resolver.wait_for_pushes().await;
    Ok(())
}
