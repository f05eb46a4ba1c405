//! `strata cache` commands - Inspect and prune the decompressed layer cache.

use clap::{Args, Subcommand};
use strata_core::StrataConfig;
use strata_runtime::DiskCache;

use crate::output;

#[derive(Args)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub command: CacheCommand,
}

#[derive(Subcommand)]
pub enum CacheCommand {
    /// Evict least recently used layers until the cache fits the limit
    Prune {
        /// Size limit (e.g., "500m", "10g"); defaults to cache.max_disk_bytes
        #[arg(long)]
        max_bytes: Option<String>,
    },
    /// List cached layers
    Ls,
}

fn open_cache(config: &StrataConfig) -> Result<DiskCache, Box<dyn std::error::Error>> {
    let dir = config
        .cache
        .disk_dir
        .as_ref()
        .ok_or("The disk cache is disabled (cache.disk_dir is not set)")?;
    Ok(DiskCache::new(dir)?)
}

pub async fn execute(args: CacheArgs, config: &StrataConfig) -> Result<(), Box<dyn std::error::Error>> {
    let cache = open_cache(config)?;

    match args.command {
        CacheCommand::Prune { max_bytes } => {
            let limit = match max_bytes {
                Some(s) => output::parse_size_bytes(&s)?,
                None => config
                    .cache
                    .max_disk_bytes
                    .ok_or("No limit given: pass --max-bytes or set cache.max_disk_bytes")?,
            };

            let before = cache.total_size()?;
            let evicted = cache.prune(limit, None)?;
            let after = cache.total_size()?;

            if evicted == 0 {
                println!(
                    "Cache holds {}, within the {} limit.",
                    output::format_bytes(before),
                    output::format_bytes(limit)
                );
            } else {
                println!(
                    "Evicted {} layer(s), freed {}",
                    evicted,
                    output::format_bytes(before.saturating_sub(after))
                );
            }
        }
        CacheCommand::Ls => {
            let mut entries = cache.list_entries()?;
            if entries.is_empty() {
                println!("No cached layers in {}", cache.cache_dir().display());
                return Ok(());
            }
            entries.sort_by(|a, b| b.last_accessed.cmp(&a.last_accessed));

            let mut table = output::new_table(&["LAYER", "SIZE", "CACHED", "LAST USED"]);
            for entry in &entries {
                table.add_row([
                    output::short_digest(&entry.digest),
                    output::format_bytes(entry.size_bytes),
                    format_timestamp(entry.cached_at),
                    format_timestamp(entry.last_accessed),
                ]);
            }
            println!("{table}");

            let total: u64 = entries.iter().map(|e| e.size_bytes).sum();
            println!();
            println!("Total: {} in {} layer(s)", output::format_bytes(total), entries.len());
        }
    }

    Ok(())
}

fn format_timestamp(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|dt| output::format_ago(&dt))
        .unwrap_or_else(|| "-".to_string())
}
