//! Transfer backend: hands a prepared request to the bulk transfer service

use async_trait::async_trait;
use tracing::debug;

use crate::command;
use crate::config::BackendConfig;
use crate::credential::AuthContext;
use crate::error::{Result, SubmitError};
use crate::request::TransferRequest;

/// Identifiers the backend assigned to an accepted job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub guid: String,
    pub server: String,
}

#[async_trait]
pub trait TransferBackend: Send + Sync {
    /// Submit `request` under `auth`. An `Ok` means the service accepted it.
    async fn submit(&self, request: &TransferRequest, auth: &AuthContext) -> Result<Submission>;
}

/// Backend driving the transfer service's command-line submit client
///
/// The request is written as a bulk file and the job GUID is read from the
/// first non-empty line the client prints.
pub struct CommandTransferBackend {
    config: BackendConfig,
}

impl CommandTransferBackend {
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }

    fn argv(&self, server: &str, bulkfile: &str, space_token: Option<&str>) -> Vec<String> {
        let mut argv = command::expand(
            &self.config.submit_command,
            &[("server", server), ("bulkfile", bulkfile)],
        );
        if let Some(token) = space_token {
            argv.push(self.config.space_token_flag.clone());
            argv.push(token.to_string());
        }
        argv
    }
}

fn auth_env(auth: &AuthContext) -> Vec<(&'static str, String)> {
    let mut envs = Vec::new();
    if let Some(path) = &auth.credential_path {
        envs.push(("X509_USER_PROXY", path.to_string_lossy().into_owned()));
    }
    if let Some(group) = &auth.group {
        envs.push(("DIRAC_GROUP", group.clone()));
    }
    envs
}

fn parse_guid(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl TransferBackend for CommandTransferBackend {
    async fn submit(&self, request: &TransferRequest, auth: &AuthContext) -> Result<Submission> {
        if request.is_empty() {
            return Err(SubmitError::Submission("request has no files".into()));
        }

        let server = self.config.server_for(&request.target_se).to_string();
        if server.is_empty() {
            return Err(SubmitError::Submission(format!(
                "no transfer server for {}",
                request.target_se
            )));
        }

        let bulk = command::scratch_file("fts-bulk-", request.to_bulk_file().into_bytes()).await?;

        let bulkfile = bulk.path().to_string_lossy().into_owned();
        let argv = self.argv(&server, &bulkfile, request.space_token.as_deref());
        debug!(server = %server, files = request.len(), "Submitting bulk request");

        let stdout = command::run(&argv, &auth_env(auth))
            .await
            .map_err(SubmitError::Submission)?;

        let guid = parse_guid(&String::from_utf8_lossy(&stdout)).ok_or_else(|| {
            SubmitError::Submission("submit client printed no job identifier".into())
        })?;

        Ok(Submission { guid, server })
    }
}
