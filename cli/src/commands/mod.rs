//! CLI command definitions and dispatch.

mod cache;
mod cat;
mod create;
mod extract;
mod index;
mod inspect;
mod login;
mod logout;
mod ls;
mod version;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use strata_core::{ArchiveMetadata, StrataConfig};
use strata_runtime::oci::CredentialStore;
use strata_runtime::{ContentBackend, CredentialChain, LazyImage, Resolver};

/// Strata - lazily materialized OCI image filesystems.
#[derive(Parser)]
#[command(name = "strata", version, about)]
pub struct Cli {
    /// Configuration file (JSON or YAML; defaults to ~/.strata/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Index an image into an archive file
    Index(index::IndexArgs),
    /// Pack a local directory into a self-contained archive
    Create(create::CreateArgs),
    /// Write the tree of a self-contained archive to a directory
    Extract(extract::ExtractArgs),
    /// Show the header, counts, layers and checkpoints of an archive
    Inspect(inspect::InspectArgs),
    /// List a directory inside an archive
    Ls(ls::LsArgs),
    /// Write a file from an archive to stdout
    Cat(cat::CatArgs),
    /// Manage the decompressed layer cache
    Cache(cache::CacheArgs),
    /// Store registry credentials
    Login(login::LoginArgs),
    /// Remove stored registry credentials
    Logout(logout::LogoutArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Return the default config file path (~/.strata/config.yaml).
pub(crate) fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".strata"))
        .unwrap_or_else(|| PathBuf::from(".strata"))
        .join("config.yaml")
}

/// Load configuration from `path`, or the default file when it exists,
/// then apply `STRATA_*` overrides.
pub fn load_config(path: Option<&Path>) -> Result<StrataConfig, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => StrataConfig::load(path)?,
        None => {
            let default = default_config_path();
            if default.is_file() {
                StrataConfig::load(&default)?
            } else {
                StrataConfig::default()
            }
        }
    };
    let config = config.apply_env()?;
    config.validate()?;
    Ok(config)
}

/// Credential store named by the config, or the default one.
pub(crate) fn credential_store(
    config: &StrataConfig,
) -> Result<CredentialStore, Box<dyn std::error::Error>> {
    match &config.registry.credential_store {
        Some(path) => Ok(CredentialStore::new(path.clone())),
        None => Ok(CredentialStore::default_path()?),
    }
}

/// Open an archive with a resolver built from the config.
///
/// The credential source recorded at index time is tried first.
pub(crate) fn open_image(
    path: &Path,
    config: &StrataConfig,
) -> Result<(LazyImage, Arc<Resolver>), Box<dyn std::error::Error>> {
    let metadata = ArchiveMetadata::read_from(path)?;

    let mut credentials = CredentialChain::standard(&config.registry);
    if let Some(hint) = &metadata.coordinates.credential_hint {
        credentials = credentials.prefer(hint);
    }
    let resolver = Arc::new(Resolver::from_config(config, credentials)?);

    let backend = ContentBackend::for_archive(path, &metadata, resolver.clone());
    tracing::debug!(
        archive = %path.display(),
        storage_mode = %metadata.storage_mode,
        "Opening archive"
    );
    Ok((LazyImage::new(metadata, backend), resolver))
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli, config: StrataConfig) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Index(args) => index::execute(args, &config).await,
        Command::Create(args) => create::execute(args).await,
        Command::Extract(args) => extract::execute(args).await,
        Command::Inspect(args) => inspect::execute(args).await,
        Command::Ls(args) => ls::execute(args, &config).await,
        Command::Cat(args) => cat::execute(args, &config).await,
        Command::Cache(args) => cache::execute(args, &config).await,
        Command::Login(args) => login::execute(args, &config).await,
        Command::Logout(args) => logout::execute(args, &config).await,
        Command::Version(args) => version::execute(args).await,
    }
}
