//! Credential guard: keeps a delegated credential available for submission
//!
//! Before any job is handed to the transfer backend the guard checks the
//! cached credential. A missing credential, or one with no more than
//! [`MIN_VALIDITY_SECS`] left, is replaced by a freshly delegated one from the
//! [`CredentialProvider`]. The outcome is an [`AuthContext`] that is passed
//! explicitly to the backend; nothing process-wide is modified.

use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::command;
use crate::config::{AgentConfig, CredentialCommandConfig};
use crate::error::{Result, SubmitError};

/// A credential must have more than this many seconds left to be used
pub const MIN_VALIDITY_SECS: u64 = 60;

/// Opaque delegated credential as issued by the provider
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(Vec<u8>);

impl Credential {
    pub fn new(blob: impl Into<Vec<u8>>) -> Self {
        Self(blob.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

// Never print key material
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Credential({} bytes)", self.0.len())
    }
}

/// Authorization handed to the transfer backend for one invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthContext {
    /// Cached credential file, or `None` to use whatever the environment provides
    pub credential_path: Option<PathBuf>,
    pub group: Option<String>,
}

impl AuthContext {
    /// Context used when credential caching is disabled
    pub fn ambient() -> Self {
        Self::default()
    }

    pub fn is_ambient(&self) -> bool {
        self.credential_path.is_none()
    }
}

/// Source of delegated credentials
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Delegate a new credential for `identity` in `group`
    async fn renew(&self, identity: &str, group: &str, length_hours: u32) -> Result<Credential>;

    /// Seconds of validity left on `credential`
    async fn remaining_validity(&self, credential: &Credential) -> Result<u64>;
}

/// Credential settings extracted from the agent configuration
#[derive(Debug, Clone)]
pub struct CredentialSettings {
    pub enabled: bool,
    pub identity: String,
    pub group: String,
    pub length_hours: u32,
    pub location: PathBuf,
}

impl CredentialSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            enabled: config.use_proxies,
            identity: config.proxy_dn.clone(),
            group: config.proxy_group.clone(),
            length_hours: config.default_proxy_length,
            location: config.proxy_location.clone().unwrap_or_default(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            identity: String::new(),
            group: String::new(),
            length_hours: 0,
            location: PathBuf::new(),
        }
    }
}

pub struct CredentialGuard<P> {
    provider: P,
    settings: CredentialSettings,
}

impl<P: CredentialProvider> CredentialGuard<P> {
    pub fn new(provider: P, settings: CredentialSettings) -> Self {
        Self { provider, settings }
    }

    pub fn settings(&self) -> &CredentialSettings {
        &self.settings
    }

    /// Make sure a credential with enough validity is cached
    ///
    /// Any failure means no submission may happen this invocation.
    pub async fn ensure_valid(&self) -> Result<AuthContext> {
        if !self.settings.enabled {
            return Ok(AuthContext::ambient());
        }

        let identity = &self.settings.identity;
        info!(identity = %identity, "Determining the remaining validity of the credential");

        let needs_renewal = match read_cached(&self.settings.location).await? {
            None => {
                info!(path = %self.settings.location.display(), "No credential found");
                true
            }
            Some(current) => {
                let remaining = self.provider.remaining_validity(&current).await?;
                info!(identity = %identity, remaining_secs = remaining, "Credential found");
                remaining <= MIN_VALIDITY_SECS
            }
        };

        if needs_renewal {
            info!(identity = %identity, "Attempting to renew credential");
            let fresh = self
                .provider
                .renew(identity, &self.settings.group, self.settings.length_hours)
                .await?;
            persist(&self.settings.location, &fresh).await?;
            info!(identity = %identity, group = %self.settings.group, "Successfully renewed credential");
        }

        Ok(AuthContext {
            credential_path: Some(self.settings.location.clone()),
            group: Some(self.settings.group.clone()).filter(|g| !g.is_empty()),
        })
    }
}

async fn read_cached(path: &Path) -> Result<Option<Credential>> {
    match tokio::fs::read(path).await {
        Ok(blob) => Ok(Some(Credential::new(blob))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(SubmitError::Credential(format!(
            "cannot read {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Atomically replace the cached credential, creating parent directories
///
/// The blob is staged in a temporary file beside the target, which is
/// created owner-readable only, then renamed over it. Readers never see a
/// partial file.
async fn persist(path: &Path, credential: &Credential) -> Result<()> {
    let fail = |e: std::io::Error| {
        SubmitError::Credential(format!("cannot store credential at {}: {}", path.display(), e))
    };

    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    tokio::fs::create_dir_all(&parent).await.map_err(fail)?;

    let target = path.to_path_buf();
    let blob = credential.as_bytes().to_vec();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let mut staged = tempfile::NamedTempFile::new_in(&parent)?;
        staged.write_all(&blob)?;
        staged.as_file().sync_all()?;
        staged.persist(&target).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(|e| fail(std::io::Error::other(e)))?
    .map_err(fail)?;

    debug!(path = %path.display(), bytes = credential.as_bytes().len(), "Stored credential");
    Ok(())
}

/// Provider backed by external commands
pub struct CommandCredentialProvider {
    config: CredentialCommandConfig,
}

impl CommandCredentialProvider {
    pub fn new(config: CredentialCommandConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl CredentialProvider for CommandCredentialProvider {
    async fn renew(&self, identity: &str, group: &str, length_hours: u32) -> Result<Credential> {
        let hours = length_hours.to_string();
        let argv = command::expand(
            &self.config.renew_command,
            &[("dn", identity), ("group", group), ("hours", &hours)],
        );

        let blob = command::run(&argv, &[]).await.map_err(SubmitError::Credential)?;
        if blob.iter().all(u8::is_ascii_whitespace) {
            return Err(SubmitError::Credential("provider returned an empty credential".into()));
        }
        Ok(Credential::new(blob))
    }

    async fn remaining_validity(&self, credential: &Credential) -> Result<u64> {
        // The inspection tool only reads from a file
        let scratch = command::scratch_file("fts-proxy-", credential.as_bytes().to_vec()).await?;

        let path = scratch.path().to_string_lossy().into_owned();
        let argv = command::expand(&self.config.timeleft_command, &[("path", &path)]);
        let stdout = command::run(&argv, &[]).await.map_err(SubmitError::Credential)?;

        parse_seconds(&String::from_utf8_lossy(&stdout))
    }
}

fn parse_seconds(output: &str) -> Result<u64> {
    let trimmed = output.trim();
    trimmed
        .parse::<i64>()
        .map(|secs| secs.max(0) as u64)
        .map_err(|_| SubmitError::Credential(format!("unexpected validity output: {:?}", trimmed)))
}
