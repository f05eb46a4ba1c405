//! `strata ls` command - List a directory inside an archive.

use std::path::PathBuf;

use clap::Args;
use strata_core::StrataConfig;
use strata_runtime::{FileAttr, FileType};

use crate::output;

#[derive(Args)]
pub struct LsArgs {
    /// Archive file
    pub archive: PathBuf,

    /// Directory (or file) inside the image
    #[arg(default_value = "/")]
    pub path: String,

    /// Long listing with mode, owner, size and mtime
    #[arg(short, long)]
    pub long: bool,
}

fn type_char(kind: FileType) -> char {
    match kind {
        FileType::Directory => 'd',
        FileType::Symlink => 'l',
        FileType::RegularFile => '-',
    }
}

fn format_mtime(attr: &FileAttr) -> String {
    chrono::DateTime::from_timestamp(attr.mtime.secs, attr.mtime.nanos)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn join(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

pub async fn execute(args: LsArgs, config: &StrataConfig) -> Result<(), Box<dyn std::error::Error>> {
    let (image, _resolver) = super::open_image(&args.archive, config)?;

    let node = image.lookup(&args.path)?;
    let names: Vec<(String, String)> = if node.is_dir() {
        image
            .read_dir(&node.path)?
            .into_iter()
            .map(|entry| (join(&node.path, &entry.name), entry.name))
            .collect()
    } else {
        vec![(node.path.clone(), node.path.clone())]
    };

    if !args.long {
        for (_, name) in &names {
            println!("{name}");
        }
        return Ok(());
    }

    let mut table = output::new_table(&["MODE", "LINKS", "UID", "GID", "SIZE", "MODIFIED", "NAME"]);
    for (path, name) in &names {
        let attr = image.getattr(path)?;
        let display = match attr.kind {
            FileType::Symlink => format!("{name} -> {}", image.read_link(path)?),
            _ => name.clone(),
        };
        table.add_row([
            output::format_mode(type_char(attr.kind), attr.mode),
            attr.nlink.to_string(),
            attr.uid.to_string(),
            attr.gid.to_string(),
            attr.size.to_string(),
            format_mtime(&attr),
            display,
        ]);
    }
    println!("{table}");

    Ok(())
}
