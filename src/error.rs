/*!
 * Error types for the submission agent
 */

use std::fmt;
use std::io;
use thiserror::Error;
use transfer_db::StoreError;

use crate::bookkeeping::BookkeepingStep;

pub type Result<T> = std::result::Result<T, SubmitError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FATAL: i32 = 2;

#[derive(Debug, Error)]
pub enum SubmitError {
    /// A work-queue query failed before anything was submitted
    #[error("Store query failed: {0}")]
    Query(#[from] StoreError),

    /// The transfer backend refused or could not take the job
    #[error("Transfer submission failed: {0}")]
    Submission(String),

    /// The delegated credential could not be checked, renewed or stored
    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A fatal bookkeeping step failed after the backend accepted the job
    #[error("Bookkeeping step '{step}' failed for job {guid}: {source}")]
    Bookkeeping {
        step: BookkeepingStep,
        guid: String,
        #[source]
        source: StoreError,
    },
}

impl SubmitError {
    /// Get error category for logging
    pub fn category(&self) -> ErrorCategory {
        match self {
            SubmitError::Query(_) | SubmitError::Submission(_) => ErrorCategory::QueryFailure,
            SubmitError::Bookkeeping { .. } => ErrorCategory::BookkeepingInconsistency,
            SubmitError::Credential(_) => ErrorCategory::CredentialFailure,
            SubmitError::Config(_) => ErrorCategory::Configuration,
            SubmitError::Io(_) => ErrorCategory::Io,
        }
    }

    /// Whether the backend may hold a job this error left unrecorded or
    /// partially recorded
    pub fn after_submission(&self) -> bool {
        matches!(self, SubmitError::Bookkeeping { .. })
    }

    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        EXIT_FATAL
    }
}

/// Error category for classification and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Store or backend call failed; the cycle is aborted
    QueryFailure,
    /// No usable credential; the whole invocation is skipped
    CredentialFailure,
    /// The backend accepted a job the store did not fully record
    BookkeepingInconsistency,
    Configuration,
    Io,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::QueryFailure => write!(f, "query"),
            ErrorCategory::CredentialFailure => write!(f, "credential"),
            ErrorCategory::BookkeepingInconsistency => write!(f, "bookkeeping"),
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::Io => write!(f, "io"),
        }
    }
}
