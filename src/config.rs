/*!
 * Configuration types for the submission agent
 */

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Result, SubmitError};

/// Main configuration for the submission agent
///
/// Option names used by the DIRAC agent configuration section
/// (`MaxFilesPerJob`, `ProxyDN`, ...) are accepted as aliases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Upper bound on files batched into one transfer job
    #[serde(default = "default_max_files_per_job", alias = "MaxFilesPerJob")]
    pub max_files_per_job: usize,

    /// Active jobs allowed per channel before it stops being eligible
    #[serde(default = "default_max_jobs_per_channel", alias = "MaxJobsPerChannel")]
    pub max_jobs_per_channel: u32,

    /// Submission cycles per invocation
    #[serde(default = "default_submissions_per_loop", alias = "SubmissionsPerLoop")]
    pub submissions_per_loop: u32,

    /// Obtain and cache a delegated credential before submitting
    #[serde(default = "default_true", alias = "UseProxies")]
    pub use_proxies: bool,

    /// Identity the credential is delegated for
    #[serde(default, alias = "ProxyDN")]
    pub proxy_dn: String,

    /// Group the credential is bound to
    #[serde(default, alias = "ProxyGroup")]
    pub proxy_group: String,

    /// Requested credential lifetime in hours
    #[serde(default = "default_proxy_length", alias = "DefaultProxyLength")]
    pub default_proxy_length: u32,

    /// Credential cache file
    #[serde(default, alias = "ProxyLocation")]
    pub proxy_location: Option<PathBuf>,

    /// Work-queue database
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Seconds between invocations in `run` mode
    #[serde(default = "default_polling_interval", alias = "PollingTime")]
    pub polling_interval_secs: u64,

    /// Log level for diagnostic output
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log file path (None = stdout)
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Enable verbose logging (shorthand for log_level = debug)
    #[serde(default)]
    pub verbose: bool,

    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub credential: CredentialCommandConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_files_per_job: default_max_files_per_job(),
            max_jobs_per_channel: default_max_jobs_per_channel(),
            submissions_per_loop: default_submissions_per_loop(),
            use_proxies: true,
            proxy_dn: String::new(),
            proxy_group: String::new(),
            default_proxy_length: default_proxy_length(),
            proxy_location: None,
            database_path: default_database_path(),
            polling_interval_secs: default_polling_interval(),
            log_level: LogLevel::Info,
            log_file: None,
            verbose: false,
            backend: BackendConfig::default(),
            credential: CredentialCommandConfig::default(),
        }
    }
}

/// How jobs are handed to the transfer service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Submit command. `{server}` and `{bulkfile}` are substituted.
    #[serde(default = "default_submit_command")]
    pub submit_command: Vec<String>,

    /// Flag placed before the space token when a job carries one
    #[serde(default = "default_space_token_flag")]
    pub space_token_flag: String,

    /// Default transfer service endpoint
    #[serde(default)]
    pub server: String,

    /// Endpoint per destination storage element
    #[serde(default)]
    pub server_overrides: HashMap<String, String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            submit_command: default_submit_command(),
            space_token_flag: default_space_token_flag(),
            server: String::new(),
            server_overrides: HashMap::new(),
        }
    }
}

impl BackendConfig {
    /// Endpoint serving transfers into `destination`
    pub fn server_for(&self, destination: &str) -> &str {
        self.server_overrides
            .get(destination)
            .map(String::as_str)
            .unwrap_or(&self.server)
    }
}

/// External commands backing the credential provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialCommandConfig {
    /// Prints a fresh credential on stdout. `{dn}`, `{group}` and `{hours}`
    /// are substituted.
    #[serde(default)]
    pub renew_command: Vec<String>,

    /// Prints the remaining validity in seconds of the credential at `{path}`
    #[serde(default = "default_timeleft_command")]
    pub timeleft_command: Vec<String>,
}

impl Default for CredentialCommandConfig {
    fn default() -> Self {
        Self {
            renew_command: Vec::new(),
            timeleft_command: default_timeleft_command(),
        }
    }
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_max_files_per_job() -> usize {
    50
}

fn default_max_jobs_per_channel() -> u32 {
    2
}

fn default_submissions_per_loop() -> u32 {
    1
}

fn default_proxy_length() -> u32 {
    12
}

fn default_database_path() -> PathBuf {
    PathBuf::from("transfer.db")
}

fn default_polling_interval() -> u64 {
    120
}

fn default_submit_command() -> Vec<String> {
    ["glite-transfer-submit", "-s", "{server}", "-f", "{bulkfile}"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_space_token_flag() -> String {
    "-t".to_string()
}

fn default_timeleft_command() -> Vec<String> {
    ["voms-proxy-info", "-file", "{path}", "-timeleft"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl AgentConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents)
            .map_err(|e| SubmitError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| SubmitError::Config(format!("cannot serialize: {}", e)))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Reject settings the agent cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_files_per_job == 0 {
            return Err(SubmitError::Config("max_files_per_job must be at least 1".into()));
        }
        if self.max_jobs_per_channel == 0 {
            return Err(SubmitError::Config("max_jobs_per_channel must be at least 1".into()));
        }
        if self.submissions_per_loop == 0 {
            return Err(SubmitError::Config("submissions_per_loop must be at least 1".into()));
        }
        if self.backend.submit_command.is_empty() {
            return Err(SubmitError::Config("backend.submit_command is empty".into()));
        }
        if self.backend.server.is_empty() && self.backend.server_overrides.is_empty() {
            return Err(SubmitError::Config("no transfer server configured".into()));
        }
        if self.use_proxies {
            if self.proxy_location.is_none() {
                return Err(SubmitError::Config(
                    "proxy_location is required when use_proxies is enabled".into(),
                ));
            }
            if self.proxy_dn.is_empty() {
                return Err(SubmitError::Config(
                    "proxy_dn is required when use_proxies is enabled".into(),
                ));
            }
            if self.credential.renew_command.is_empty() {
                return Err(SubmitError::Config(
                    "credential.renew_command is required when use_proxies is enabled".into(),
                ));
            }
        }
        Ok(())
    }
}
