//! Registry credential resolution.
//!
//! A credential source answers `resolve(host, scope)` with an optional
//! credential. Sources are composed into an ordered [`CredentialChain`]
//! (first non-empty answer wins) and can be wrapped in
//! [`MemoizedCredentials`] to keep short-lived tokens for a while.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use parking_lot::Mutex;
use serde::Deserialize;
use strata_core::config::RegistryConfig;
use strata_core::error::{Result, StrataError};

use super::credentials::CredentialStore;

/// Credential handed to the registry client.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Basic { username: String, password: String },
    /// Refresh token exchanged at the token endpoint
    IdentityToken(String),
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Credential::IdentityToken(_) => f.write_str("IdentityToken(<redacted>)"),
        }
    }
}

/// A pluggable source of registry credentials.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Short name used in logs and as the archive's credential hint.
    fn name(&self) -> &str;

    /// Look up credentials for `host` (e.g. "ghcr.io") and token `scope`
    /// (e.g. "repository:org/app:pull").
    async fn resolve(&self, host: &str, scope: &str) -> Result<Option<Credential>>;
}

/// Never returns credentials (public images only).
pub struct Anonymous;

#[async_trait]
impl CredentialSource for Anonymous {
    fn name(&self) -> &str {
        "anonymous"
    }

    async fn resolve(&self, _host: &str, _scope: &str) -> Result<Option<Credential>> {
        Ok(None)
    }
}

/// Fixed credential table keyed by host or wildcard pattern
/// (e.g. `*.dkr.ecr.*.amazonaws.com`).
pub struct StaticCredentials {
    name: String,
    entries: Vec<(String, Credential)>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self {
            name: "static".to_string(),
            entries: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn insert(mut self, pattern: impl Into<String>, credential: Credential) -> Self {
        self.entries.push((pattern.into(), credential));
        self
    }
}

impl Default for StaticCredentials {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialSource for StaticCredentials {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve(&self, host: &str, _scope: &str) -> Result<Option<Credential>> {
        // Exact match first
        if let Some((_, cred)) = self.entries.iter().find(|(p, _)| p == host) {
            return Ok(Some(cred.clone()));
        }
        for (pattern, cred) in &self.entries {
            if match_pattern(pattern, host) {
                tracing::debug!(registry = %host, pattern = %pattern, source = %self.name, "Matched credential pattern");
                return Ok(Some(cred.clone()));
            }
        }
        Ok(None)
    }
}

/// Match `host` against a pattern where `*` matches any run of characters.
pub fn match_pattern(pattern: &str, host: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == host;
    }
    let parts: Vec<&str> = pattern.split('*').collect();
    let (first, rest) = match parts.split_first() {
        Some(split) => split,
        None => return false,
    };
    let Some(mut remaining) = host.strip_prefix(first) else {
        return false;
    };
    let (last, middle) = match rest.split_last() {
        Some(split) => split,
        None => return remaining.is_empty(),
    };
    for part in middle {
        match remaining.find(part) {
            Some(idx) => remaining = &remaining[idx + part.len()..],
            None => return false,
        }
    }
    remaining.ends_with(last)
}

/// Credentials from environment variables.
///
/// Checked in order:
/// 1. `STRATA_REGISTRY_USER_<HOST>` / `STRATA_REGISTRY_PASS_<HOST>`, where
///    `<HOST>` is upper-cased with `.`, `-` and `:` replaced by `_`
/// 2. `STRATA_REGISTRY_AUTH`, a JSON map `{host: {username, password} | {token}}`
/// 3. `REGISTRY_USERNAME` / `REGISTRY_PASSWORD`
pub struct EnvCredentials {
    lookup: Box<dyn Fn(&str) -> Option<String> + Send + Sync>,
}

#[derive(Debug, Deserialize)]
struct EnvAuthEntry {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    token: String,
}

impl EnvCredentials {
    pub fn new() -> Self {
        Self::with_lookup(|key| std::env::var(key).ok())
    }

    /// Use a custom variable lookup instead of the process environment.
    pub fn with_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            lookup: Box::new(lookup),
        }
    }

    fn host_key(host: &str) -> String {
        host.chars()
            .map(|c| match c {
                '.' | '-' | ':' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect()
    }

    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.is_empty())
    }
}

impl Default for EnvCredentials {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialSource for EnvCredentials {
    fn name(&self) -> &str {
        "env"
    }

    async fn resolve(&self, host: &str, _scope: &str) -> Result<Option<Credential>> {
        let key = Self::host_key(host);
        if let Some(username) = self.get(&format!("STRATA_REGISTRY_USER_{}", key)) {
            let password = self
                .get(&format!("STRATA_REGISTRY_PASS_{}", key))
                .unwrap_or_default();
            return Ok(Some(Credential::Basic { username, password }));
        }

        if let Some(json) = self.get("STRATA_REGISTRY_AUTH") {
            match serde_json::from_str::<HashMap<String, EnvAuthEntry>>(&json) {
                Ok(map) => {
                    if let Some(entry) = map.get(host) {
                        // Bearer-style tokens go through the basic exchange
                        if !entry.token.is_empty() {
                            return Ok(Some(Credential::Basic {
                                username: "oauth2accesstoken".to_string(),
                                password: entry.token.clone(),
                            }));
                        }
                        return Ok(Some(Credential::Basic {
                            username: entry.username.clone(),
                            password: entry.password.clone(),
                        }));
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Ignoring malformed STRATA_REGISTRY_AUTH");
                }
            }
        }

        if let (Some(username), Some(password)) =
            (self.get("REGISTRY_USERNAME"), self.get("REGISTRY_PASSWORD"))
        {
            return Ok(Some(Credential::Basic { username, password }));
        }
        Ok(None)
    }
}

/// Docker CLI config (`$DOCKER_CONFIG/config.json` or `~/.docker/config.json`).
///
/// Supports inline `auths` entries and external credential helpers
/// (`credHelpers`, `credsStore`) run as `docker-credential-<helper> get`.
pub struct DockerConfigCredentials {
    path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, DockerAuthEntry>,
    #[serde(default, rename = "credHelpers")]
    cred_helpers: HashMap<String, String>,
    #[serde(default, rename = "credsStore")]
    creds_store: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerAuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    identitytoken: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HelperResponse {
    #[serde(rename = "Username")]
    username: String,
    #[serde(rename = "Secret")]
    secret: String,
}

const DOCKER_HUB_ALIASES: &[&str] = &[
    "https://index.docker.io/v1/",
    "index.docker.io",
    "docker.io",
    "registry-1.docker.io",
];

impl DockerConfigCredentials {
    /// Use the default Docker config location.
    pub fn new() -> Self {
        let path = match std::env::var("DOCKER_CONFIG") {
            Ok(dir) if !dir.is_empty() => Some(PathBuf::from(dir).join("config.json")),
            _ => dirs::home_dir().map(|h| h.join(".docker").join("config.json")),
        };
        Self { path }
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    async fn load(&self) -> Result<Option<DockerConfigFile>> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        let data = match tokio::fs::read_to_string(path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StrataError::Config(format!(
                    "Failed to read Docker config {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        let config = serde_json::from_str(&data).map_err(|e| {
            StrataError::Config(format!(
                "Failed to parse Docker config {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(Some(config))
    }

    fn candidate_keys(host: &str) -> Vec<String> {
        let mut keys = vec![host.to_string(), format!("https://{}", host)];
        if DOCKER_HUB_ALIASES.contains(&host) {
            keys.extend(DOCKER_HUB_ALIASES.iter().map(|s| s.to_string()));
        }
        keys
    }

    fn from_auth_entry(entry: &DockerAuthEntry) -> Result<Option<Credential>> {
        if let Some(token) = entry.identitytoken.as_ref().filter(|t| !t.is_empty()) {
            return Ok(Some(Credential::IdentityToken(token.clone())));
        }
        if let Some(encoded) = entry.auth.as_ref().filter(|a| !a.is_empty()) {
            return decode_docker_auth(encoded).map(Some);
        }
        if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
            return Ok(Some(Credential::Basic {
                username: username.clone(),
                password: password.clone(),
            }));
        }
        Ok(None)
    }

    async fn run_helper(helper: &str, host: &str) -> Result<Option<Credential>> {
        use tokio::io::AsyncWriteExt;

        let program = format!("docker-credential-{}", helper);
        let mut child = match tokio::process::Command::new(&program)
            .arg("get")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                tracing::debug!(helper = %program, error = %e, "Credential helper not available");
                return Ok(None);
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(host.as_bytes()).await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            // "credentials not found in native keychain"
            return Ok(None);
        }

        let response: HelperResponse = serde_json::from_slice(&output.stdout)?;
        if response.username == "<token>" {
            Ok(Some(Credential::IdentityToken(response.secret)))
        } else {
            Ok(Some(Credential::Basic {
                username: response.username,
                password: response.secret,
            }))
        }
    }
}

impl Default for DockerConfigCredentials {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialSource for DockerConfigCredentials {
    fn name(&self) -> &str {
        "docker-config"
    }

    async fn resolve(&self, host: &str, _scope: &str) -> Result<Option<Credential>> {
        let Some(config) = self.load().await? else {
            return Ok(None);
        };

        if let Some(helper) = config.cred_helpers.get(host) {
            return Self::run_helper(helper, host).await;
        }

        for key in Self::candidate_keys(host) {
            if let Some(entry) = config.auths.get(&key) {
                if let Some(cred) = Self::from_auth_entry(entry)? {
                    return Ok(Some(cred));
                }
            }
        }

        if let Some(store) = &config.creds_store {
            return Self::run_helper(store, host).await;
        }
        Ok(None)
    }
}

/// Decode a Docker `auth` field (base64 of `username:password`).
fn decode_docker_auth(encoded: &str) -> Result<Credential> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| StrataError::Config(format!("Invalid Docker auth encoding: {}", e)))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|e| StrataError::Config(format!("Invalid Docker auth encoding: {}", e)))?;
    let (username, password) = decoded
        .split_once(':')
        .ok_or_else(|| StrataError::Config("Docker auth is not username:password".to_string()))?;
    Ok(Credential::Basic {
        username: username.to_string(),
        password: password.to_string(),
    })
}

type Callback = dyn Fn(&str, &str) -> Result<Option<Credential>> + Send + Sync;

/// Caller-supplied credential function.
pub struct CallbackCredentials {
    name: String,
    callback: Box<Callback>,
}

impl CallbackCredentials {
    pub fn new<F>(name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&str, &str) -> Result<Option<Credential>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            callback: Box::new(callback),
        }
    }
}

#[async_trait]
impl CredentialSource for CallbackCredentials {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve(&self, host: &str, scope: &str) -> Result<Option<Credential>> {
        (self.callback)(host, scope)
    }
}

/// Remembers found credentials per `(host, scope)` for a freshness window.
pub struct MemoizedCredentials {
    inner: Arc<dyn CredentialSource>,
    ttl: Duration,
    entries: Mutex<HashMap<(String, String), (Instant, Credential)>>,
}

impl MemoizedCredentials {
    pub fn new(inner: Arc<dyn CredentialSource>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl CredentialSource for MemoizedCredentials {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn resolve(&self, host: &str, scope: &str) -> Result<Option<Credential>> {
        let key = (host.to_string(), scope.to_string());
        {
            let entries = self.entries.lock();
            if let Some((at, cred)) = entries.get(&key) {
                if at.elapsed() < self.ttl {
                    return Ok(Some(cred.clone()));
                }
            }
        }

        let found = self.inner.resolve(host, scope).await?;
        let mut entries = self.entries.lock();
        match &found {
            Some(cred) => {
                entries.insert(key, (Instant::now(), cred.clone()));
            }
            None => {
                entries.remove(&key);
            }
        }
        Ok(found)
    }
}

/// Ordered list of credential sources; the first non-empty answer wins.
#[derive(Clone, Default)]
pub struct CredentialChain {
    sources: Vec<Arc<dyn CredentialSource>>,
}

impl CredentialChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, source: Arc<dyn CredentialSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// The default chain: environment, strata credential store, Docker config.
    ///
    /// Each source is memoized for `credential_ttl_secs`.
    pub fn standard(config: &RegistryConfig) -> Self {
        let ttl = Duration::from_secs(config.credential_ttl_secs);
        let store = match &config.credential_store {
            Some(path) => Some(CredentialStore::new(path.clone())),
            None => CredentialStore::default_path().ok(),
        };
        let docker = match &config.docker_config {
            Some(path) => DockerConfigCredentials::with_path(path.clone()),
            None => DockerConfigCredentials::new(),
        };

        let mut sources: Vec<Arc<dyn CredentialSource>> = vec![Arc::new(EnvCredentials::new())];
        if let Some(store) = store {
            sources.push(Arc::new(store));
        }
        sources.push(Arc::new(docker));

        Self {
            sources: sources
                .into_iter()
                .map(|s| Arc::new(MemoizedCredentials::new(s, ttl)) as Arc<dyn CredentialSource>)
                .collect(),
        }
    }

    /// Move the source named `hint` to the front.
    pub fn prefer(mut self, hint: &str) -> Self {
        if let Some(pos) = self.sources.iter().position(|s| s.name() == hint) {
            let source = self.sources.remove(pos);
            self.sources.insert(0, source);
        }
        self
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.name().to_string()).collect()
    }

    /// Resolve and also report which source answered.
    pub async fn resolve_with_source(
        &self,
        host: &str,
        scope: &str,
    ) -> Option<(String, Credential)> {
        for source in &self.sources {
            match source.resolve(host, scope).await {
                Ok(Some(cred)) => {
                    tracing::debug!(registry = %host, source = source.name(), "Resolved registry credentials");
                    return Some((source.name().to_string(), cred));
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        registry = %host,
                        source = source.name(),
                        error = %e,
                        "Credential source failed, trying next"
                    );
                }
            }
        }
        None
    }
}

#[async_trait]
impl CredentialSource for CredentialChain {
    fn name(&self) -> &str {
        "chain"
    }

    async fn resolve(&self, host: &str, scope: &str) -> Result<Option<Credential>> {
        Ok(self.resolve_with_source(host, scope).await.map(|(_, c)| c))
    }
}
