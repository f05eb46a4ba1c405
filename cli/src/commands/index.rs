//! `strata index` command - Build an archive from an image.

use std::path::PathBuf;
use std::time::Instant;

use clap::{ArgGroup, Args};
use strata_core::StrataConfig;
use strata_runtime::{index_image, CredentialChain, ImageSource};

use crate::output;

#[derive(Args)]
#[command(group(ArgGroup::new("source").required(true).args(["image", "layout"])))]
pub struct IndexArgs {
    /// Image reference (e.g., "nginx:1.25", "ghcr.io/org/app:v1")
    pub image: Option<String>,

    /// Index a local OCI image layout directory instead of a registry image
    #[arg(long)]
    pub layout: Option<PathBuf>,

    /// Tag to select from the layout's index.json
    #[arg(long, requires = "layout")]
    pub tag: Option<String>,

    /// Archive file to write
    #[arg(short, long)]
    pub output: PathBuf,
}

pub async fn execute(
    args: IndexArgs,
    config: &StrataConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let source = match (args.image, args.layout) {
        (Some(image), _) => ImageSource::registry(&image)?,
        (None, Some(layout)) => ImageSource::layout(std::fs::canonicalize(&layout)?, args.tag),
        (None, None) => return Err("An image reference or --layout is required".into()),
    };

    println!("Indexing {source}...");
    let started = Instant::now();

    let credentials = CredentialChain::standard(&config.registry);
    let metadata = index_image(&source, credentials, config).await?;
    metadata.write_to(&args.output)?;

    let checkpoints: usize = metadata.checkpoints.values().map(|t| t.len()).sum();
    println!(
        "Wrote {} ({} nodes, {} layers, {} checkpoints) in {:.1}s",
        args.output.display(),
        metadata.index.len(),
        metadata.coordinates.layers.len(),
        checkpoints,
        started.elapsed().as_secs_f64()
    );
    if let Some(hint) = &metadata.coordinates.credential_hint {
        println!("Credentials: {hint}");
    }
    if let Ok(size) = std::fs::metadata(&args.output).map(|m| m.len()) {
        println!("Archive size: {}", output::format_bytes(size));
    }

    Ok(())
}
