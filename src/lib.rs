/*!
 * fts-submit - channel-based bulk transfer submission agent
 *
 * Periodically drains per-channel file queues into bulk transfer jobs:
 * - Delegated credential kept valid before each invocation
 * - Least-loaded eligible channel chosen per cycle, capped by active jobs
 * - Batches handed to the transfer service through a pluggable backend
 * - Accepted jobs recorded with fatal and best-effort bookkeeping steps
 */

pub mod agent;
pub mod backend;
pub mod bookkeeping;
mod command;
pub mod config;
pub mod credential;
pub mod error;
pub mod logging;
pub mod request;

#[cfg(test)]
pub mod mock;

// Re-export commonly used types
pub use agent::{CycleOutcome, ExecutionReport, SubmissionLimits, SubmitAgent, SubmittedJob};
pub use backend::{CommandTransferBackend, Submission, TransferBackend};
pub use config::AgentConfig;
pub use credential::{AuthContext, CommandCredentialProvider, CredentialGuard, CredentialProvider, CredentialSettings};
pub use error::{Result, SubmitError};
pub use request::{PreparedBatch, TransferRequest, TransferRequestBuilder};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
