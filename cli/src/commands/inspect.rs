//! `strata inspect` command - Show what an archive holds.

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::Args;
use serde::Serialize;
use strata_core::{ArchiveMetadata, Checkpoint};

use crate::output;

#[derive(Args)]
pub struct InspectArgs {
    /// Archive file
    pub archive: PathBuf,

    /// Print the summary as JSON
    #[arg(long)]
    pub json: bool,

    /// List every checkpoint, not just the per-layer count
    #[arg(long)]
    pub checkpoints: bool,
}

#[derive(Serialize)]
struct ArchiveSummary {
    version: u8,
    storage_mode: String,
    registry: String,
    repository: String,
    reference: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    manifest_digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    credential_hint: Option<String>,
    nodes: usize,
    kinds: BTreeMap<String, usize>,
    payload_bytes: u64,
    layers: Vec<LayerSummary>,
}

#[derive(Serialize)]
struct LayerSummary {
    digest: String,
    /// Non-directory nodes whose content lives in this layer
    files: usize,
    /// Uncompressed bytes those nodes reference
    content_bytes: u64,
    checkpoints: Vec<Checkpoint>,
}

fn summarize(metadata: &ArchiveMetadata) -> ArchiveSummary {
    let layers = metadata
        .coordinates
        .layers
        .iter()
        .map(|digest| {
            let (files, content_bytes) = metadata
                .index
                .iter()
                .filter(|node| !node.is_dir() && node.layer_digest() == Some(digest.as_str()))
                .fold((0usize, 0u64), |(n, bytes), node| {
                    (n + 1, bytes + node.content.length())
                });
            LayerSummary {
                digest: digest.clone(),
                files,
                content_bytes,
                checkpoints: metadata.checkpoints_for(digest).entries().to_vec(),
            }
        })
        .collect();

    ArchiveSummary {
        version: metadata.version,
        storage_mode: metadata.storage_mode.to_string(),
        registry: metadata.coordinates.registry.clone(),
        repository: metadata.coordinates.repository.clone(),
        reference: metadata.coordinates.reference.clone(),
        manifest_digest: metadata.coordinates.manifest_digest.clone(),
        credential_hint: metadata.coordinates.credential_hint.clone(),
        nodes: metadata.index.len(),
        kinds: metadata.index.kind_counts(),
        payload_bytes: metadata.payload.length,
        layers,
    }
}

pub async fn execute(args: InspectArgs) -> Result<(), Box<dyn std::error::Error>> {
    let metadata = ArchiveMetadata::read_from(&args.archive)?;
    let summary = summarize(&metadata);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("Archive:      {}", args.archive.display());
    println!("Version:      {}", summary.version);
    println!("Storage mode: {}", summary.storage_mode);
    if !summary.registry.is_empty() {
        println!(
            "Image:        {}/{}:{}",
            summary.registry, summary.repository, summary.reference
        );
    }
    if let Some(digest) = &summary.manifest_digest {
        println!("Manifest:     {digest}");
    }
    if let Some(hint) = &summary.credential_hint {
        println!("Credentials:  {hint}");
    }
    if summary.payload_bytes > 0 {
        println!("Payload:      {}", output::format_bytes(summary.payload_bytes));
    }

    let kinds: Vec<String> = summary
        .kinds
        .iter()
        .map(|(kind, count)| format!("{count} {kind}"))
        .collect();
    println!("Nodes:        {} ({})", summary.nodes, kinds.join(", "));

    if summary.layers.is_empty() {
        return Ok(());
    }

    println!();
    let mut table = output::new_table(&["LAYER", "FILES", "CONTENT", "CHECKPOINTS"]);
    for layer in &summary.layers {
        table.add_row([
            output::short_digest(&layer.digest),
            layer.files.to_string(),
            output::format_bytes(layer.content_bytes),
            layer.checkpoints.len().to_string(),
        ]);
    }
    println!("{table}");

    if args.checkpoints {
        for layer in &summary.layers {
            println!();
            println!("{}", layer.digest);
            let mut table = output::new_table(&["COMPRESSED", "UNCOMPRESSED"]);
            for cp in &layer.checkpoints {
                table.add_row([
                    cp.compressed_offset.to_string(),
                    cp.uncompressed_offset.to_string(),
                ]);
            }
            println!("{table}");
        }
    }

    Ok(())
}
