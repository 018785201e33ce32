//! Bookkeeping recorder
//!
//! Persists a job the backend has already accepted. The work is an ordered
//! series of independent store mutations, each with a declared [`Severity`]:
//!
//! | step | severity |
//! |------|----------|
//! | create job record | fatal |
//! | set file count | best effort |
//! | set total size | best effort |
//! | log `Submitted` event | best effort |
//! | link files, Waiting to Executing | fatal |
//! | set per-link file size | best effort, per file |
//!
//! A fatal failure aborts the cycle with [`SubmitError::Bookkeeping`]. A
//! best-effort failure is logged, kept as a [`BookkeepingWarning`] and the
//! sequence continues.

use std::fmt;
use tracing::{debug, error};

use transfer_db::{
    Channel, FileId, FileLinkAttribute, JobAttribute, JobId, JobStatus, StoreError, WorkQueueStore,
};

use crate::backend::Submission;
use crate::error::{Result, SubmitError};
use crate::request::PreparedBatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Failure aborts the cycle
    Fatal,
    /// Failure is logged and the sequence continues
    BestEffort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookkeepingStep {
    CreateJob,
    SetFileCount,
    SetTotalSize,
    LogSubmitted,
    LinkFiles,
    SetFileSize,
}

impl BookkeepingStep {
    pub const fn severity(self) -> Severity {
        match self {
            BookkeepingStep::CreateJob | BookkeepingStep::LinkFiles => Severity::Fatal,
            BookkeepingStep::SetFileCount
            | BookkeepingStep::SetTotalSize
            | BookkeepingStep::LogSubmitted
            | BookkeepingStep::SetFileSize => Severity::BestEffort,
        }
    }
}

impl fmt::Display for BookkeepingStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BookkeepingStep::CreateJob => write!(f, "create job"),
            BookkeepingStep::SetFileCount => write!(f, "set file count"),
            BookkeepingStep::SetTotalSize => write!(f, "set total size"),
            BookkeepingStep::LogSubmitted => write!(f, "log submitted event"),
            BookkeepingStep::LinkFiles => write!(f, "link files"),
            BookkeepingStep::SetFileSize => write!(f, "set file size"),
        }
    }
}

/// A best-effort step that did not complete
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookkeepingWarning {
    pub step: BookkeepingStep,
    pub file_id: Option<FileId>,
    pub message: String,
}

/// Result of a bookkeeping pass that reached its end
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedJob {
    pub job_id: JobId,
    pub warnings: Vec<BookkeepingWarning>,
}

impl RecordedJob {
    pub fn is_complete(&self) -> bool {
        self.warnings.is_empty()
    }
}

pub struct BookkeepingRecorder<'a, S: ?Sized> {
    store: &'a S,
}

impl<'a, S: WorkQueueStore + ?Sized> BookkeepingRecorder<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Record a job the backend accepted for `channel`
    pub async fn record(
        &self,
        channel: &Channel,
        submission: &Submission,
        batch: &PreparedBatch,
    ) -> Result<RecordedJob> {
        let guid = submission.guid.as_str();
        let mut warnings = Vec::new();

        let created = self
            .store
            .create_job(guid, &submission.server, channel.id)
            .await;
        let job_id = self.fatal(BookkeepingStep::CreateJob, guid, created)?;
        debug!(job_id, guid, "Job record created");

        let file_count = batch.file_count() as u64;
        let result = self
            .store
            .set_job_attribute(job_id, JobAttribute::NumberOfFiles(file_count))
            .await;
        self.best_effort(BookkeepingStep::SetFileCount, guid, None, result, &mut warnings);

        let result = self
            .store
            .set_job_attribute(job_id, JobAttribute::TotalSize(batch.total_size))
            .await;
        self.best_effort(BookkeepingStep::SetTotalSize, guid, None, result, &mut warnings);

        let result = self
            .store
            .append_logging_event(job_id, JobStatus::Submitted)
            .await;
        self.best_effort(BookkeepingStep::LogSubmitted, guid, None, result, &mut warnings);

        let file_ids = batch.file_ids();
        let result = self
            .store
            .link_files_to_job(job_id, &file_ids, channel.id)
            .await;
        self.fatal(BookkeepingStep::LinkFiles, guid, result)?;
        debug!(job_id, files = file_ids.len(), "Files linked and moved to Executing");

        for (&file_id, &size) in &batch.file_sizes {
            let result = self
                .store
                .set_file_link_attribute(job_id, file_id, FileLinkAttribute::FileSize(size))
                .await;
            self.best_effort(BookkeepingStep::SetFileSize, guid, Some(file_id), result, &mut warnings);
        }

        Ok(RecordedJob { job_id, warnings })
    }

    /// A failed fatal step aborts the cycle
    fn fatal<T>(
        &self,
        step: BookkeepingStep,
        guid: &str,
        result: std::result::Result<T, StoreError>,
    ) -> Result<T> {
        debug_assert_eq!(step.severity(), Severity::Fatal);
        result.map_err(|source| {
            error!(step = %step, guid, error = %source, "Bookkeeping failed, aborting cycle");
            SubmitError::Bookkeeping {
                step,
                guid: guid.to_string(),
                source,
            }
        })
    }

    /// A failed best-effort step is logged and kept as a warning
    fn best_effort(
        &self,
        step: BookkeepingStep,
        guid: &str,
        file_id: Option<FileId>,
        result: std::result::Result<(), StoreError>,
        warnings: &mut Vec<BookkeepingWarning>,
    ) {
        debug_assert_eq!(step.severity(), Severity::BestEffort);
        if let Err(source) = result {
            error!(step = %step, guid, file_id = ?file_id, error = %source, "Bookkeeping step failed");
            warnings.push(BookkeepingWarning {
                step,
                file_id,
                message: source.to_string(),
            });
        }
    }
}
