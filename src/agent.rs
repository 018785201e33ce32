//! Submission agent: drives channel selection through bookkeeping
//!
//! # Flow
//!
//! ```text
//! execute()
//!   └─ CredentialGuard::ensure_valid ── fail ──► CredentialUnavailable (no cycles)
//!   └─ repeat submissions_per_loop times:
//!        submit_transfer()
//!          select channel ─► load batch ─► build request ─► submit ─► record
//! ```
//!
//! Each cycle stands alone: a failed or empty cycle is logged and the next
//! one runs. Nothing here panics or terminates the hosting process.

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use transfer_db::{Channel, ChannelId, JobId, WorkQueueStore};

use crate::backend::TransferBackend;
use crate::bookkeeping::{BookkeepingRecorder, BookkeepingWarning};
use crate::config::AgentConfig;
use crate::credential::{AuthContext, CredentialGuard, CredentialProvider};
use crate::error::Result;
use crate::request::TransferRequestBuilder;

/// Batch and concurrency bounds applied by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmissionLimits {
    pub files_per_job: usize,
    pub max_jobs_per_channel: u32,
    pub submissions_per_loop: u32,
}

impl SubmissionLimits {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            files_per_job: config.max_files_per_job,
            max_jobs_per_channel: config.max_jobs_per_channel,
            submissions_per_loop: config.submissions_per_loop,
        }
    }
}

impl Default for SubmissionLimits {
    fn default() -> Self {
        Self::from_config(&AgentConfig::default())
    }
}

/// A job the backend accepted and the store recorded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedJob {
    pub job_id: JobId,
    pub guid: String,
    pub server: String,
    pub channel_id: ChannelId,
    pub source_se: String,
    pub target_se: String,
    pub files: usize,
    pub total_size: u64,
    /// Best-effort bookkeeping steps that did not complete
    pub warnings: Vec<BookkeepingWarning>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Submitted(SubmittedJob),
    /// No channel has both queued files and spare job capacity
    NoEligibleChannel,
    /// The selected channel had nothing waiting by the time it was read
    NoQueuedFiles { channel_id: ChannelId },
}

/// What one invocation of [`SubmitAgent::execute`] did
#[derive(Debug)]
pub enum ExecutionReport {
    /// No usable credential; no cycle was attempted
    CredentialUnavailable { reason: String },
    Completed {
        started_at: DateTime<Utc>,
        cycles: Vec<Result<CycleOutcome>>,
    },
}

impl ExecutionReport {
    pub fn cycles(&self) -> &[Result<CycleOutcome>] {
        match self {
            ExecutionReport::CredentialUnavailable { .. } => &[],
            ExecutionReport::Completed { cycles, .. } => cycles,
        }
    }

    pub fn submitted(&self) -> impl Iterator<Item = &SubmittedJob> {
        self.cycles().iter().filter_map(|cycle| match cycle {
            Ok(CycleOutcome::Submitted(job)) => Some(job),
            _ => None,
        })
    }

    pub fn failures(&self) -> usize {
        self.cycles().iter().filter(|cycle| cycle.is_err()).count()
    }
}

pub struct SubmitAgent<S, B, P> {
    store: S,
    backend: B,
    guard: CredentialGuard<P>,
    limits: SubmissionLimits,
}

impl<S, B, P> SubmitAgent<S, B, P>
where
    S: WorkQueueStore,
    B: TransferBackend,
    P: CredentialProvider,
{
    pub fn new(store: S, backend: B, guard: CredentialGuard<P>, limits: SubmissionLimits) -> Self {
        Self {
            store,
            backend,
            guard,
            limits,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn limits(&self) -> SubmissionLimits {
        self.limits
    }

    /// One scheduled invocation: credential check, then every cycle
    pub async fn execute(&self) -> ExecutionReport {
        let auth = match self.guard.ensure_valid().await {
            Ok(auth) => auth,
            Err(e) => {
                error!(error = %e, "No valid credential, skipping this invocation");
                return ExecutionReport::CredentialUnavailable {
                    reason: e.to_string(),
                };
            }
        };

        let started_at = Utc::now();
        let total = self.limits.submissions_per_loop;
        let mut cycles = Vec::with_capacity(total as usize);

        for i in 0..total {
            info!("Starting submission loop {} of {}", i + 1, total);
            let outcome = self.submit_transfer(&auth).await;
            match &outcome {
                Ok(CycleOutcome::Submitted(job)) if !job.warnings.is_empty() => warn!(
                    guid = %job.guid,
                    warnings = job.warnings.len(),
                    "Job submitted with incomplete bookkeeping"
                ),
                Ok(_) => {}
                Err(e) => error!(
                    category = %e.category(),
                    after_submission = e.after_submission(),
                    error = %e,
                    "Submission cycle failed"
                ),
            }
            cycles.push(outcome);
        }

        ExecutionReport::Completed { started_at, cycles }
    }

    /// Select a channel, batch its files, submit them and record the job
    pub async fn submit_transfer(&self, auth: &AuthContext) -> Result<CycleOutcome> {
        let Some(channel) = self
            .store
            .select_eligible_channel(self.limits.max_jobs_per_channel)
            .await?
        else {
            info!("No channels eligible for submission");
            return Ok(CycleOutcome::NoEligibleChannel);
        };
        info!(channel = %channel, "Selected channel for submission");

        let batch = self
            .store
            .take_queued_files(channel.id, self.limits.files_per_job)
            .await?;
        if batch.is_empty() {
            info!(channel_id = channel.id, "No files to be submitted on channel");
            return Ok(CycleOutcome::NoQueuedFiles {
                channel_id: channel.id,
            });
        }

        let prepared = TransferRequestBuilder::for_channel(&channel)
            .space_token(batch.space_token)
            .add_files(&batch.files)
            .build();

        // Nothing has been persisted yet, so a refusal leaves no trace
        let submission = self.backend.submit(&prepared.request, auth).await?;
        log_submission(&channel, &submission.guid, &submission.server, prepared.file_count());

        let recorded = BookkeepingRecorder::new(&self.store)
            .record(&channel, &submission, &prepared)
            .await?;

        info!(
            job_id = recorded.job_id,
            guid = %submission.guid,
            files = prepared.file_count(),
            total_size = prepared.total_size,
            "Job recorded"
        );

        Ok(CycleOutcome::Submitted(SubmittedJob {
            job_id: recorded.job_id,
            guid: submission.guid,
            server: submission.server,
            channel_id: channel.id,
            source_se: channel.source,
            target_se: channel.destination,
            files: prepared.file_count(),
            total_size: prepared.total_size,
            warnings: recorded.warnings,
        }))
    }
}

fn log_submission(channel: &Channel, guid: &str, server: &str, files: usize) {
    info!(
        guid,
        server,
        channel_id = channel.id,
        source = %channel.source,
        target = %channel.destination,
        files,
        "Submitted transfer job"
    );
}
