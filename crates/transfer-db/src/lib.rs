//! Transfer DB: persistent work queue for channel-based bulk transfers
//!
//! # Overview
//!
//! The store is the system of record for channels, the files queued on them,
//! the aggregate jobs submitted to the transfer backend, and the linkage
//! between files and jobs. The submission agent only holds transient views of
//! this state for the duration of one cycle.
//!
//! # Lifecycle
//!
//! ```text
//! producer ──► channel_files (Waiting)
//!                    │ link_files_to_job
//!                    ▼
//!              channel_files (Executing) ◄──► file_job_links ──► transfer_jobs (Submitted)
//!                                                                     │ complete_job
//!                                                                     ▼
//!                                                              transfer_jobs (Done | Failed)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use transfer_db::{SqliteStore, WorkQueueStore};
//!
//! #[tokio::main]
//! async fn main() -> transfer_db::Result<()> {
//!     let store = SqliteStore::open("transfer.db").await?;
//!
//!     if let Some(channel) = store.select_eligible_channel(2).await? {
//!         let batch = store.take_queued_files(channel.id, 50).await?;
//!         println!("{} files waiting on {}", batch.files.len(), channel);
//!     }
//!
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub mod backends;

#[cfg(feature = "sqlite")]
pub use backends::sqlite::SqliteStore;

pub type ChannelId = i64;
pub type FileId = i64;
pub type JobId = i64;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },

    #[error("File {file_id} is not waiting on channel {channel_id}")]
    NotQueued { file_id: FileId, channel_id: ChannelId },

    #[error("Invalid value in column {column}: {value}")]
    InvalidValue { column: &'static str, value: String },
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::Migration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A source to destination storage element pairing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    /// Source storage element name
    pub source: String,
    /// Destination storage element name
    pub destination: String,
    /// Destination-side storage reservation, if the channel carries one
    pub space_token: Option<String>,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel {} ({} -> {})", self.id, self.source, self.destination)
    }
}

/// A file waiting for transfer on a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedFile {
    pub id: FileId,
    /// Logical file name
    pub lfn: String,
    /// Physical location at the source
    pub source_surl: String,
    /// Physical location at the destination
    pub target_surl: String,
    /// Size in bytes
    pub size: u64,
}

/// Files read from a channel's queued set, oldest first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelBatch {
    pub space_token: Option<String>,
    pub files: Vec<QueuedFile>,
}

impl ChannelBatch {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Per-file state on a channel
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FileStatus {
    /// Queued, eligible for batching
    Waiting,
    /// Owned by a submitted job
    Executing,
    Done,
    Failed,
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileStatus::Waiting => write!(f, "Waiting"),
            FileStatus::Executing => write!(f, "Executing"),
            FileStatus::Done => write!(f, "Done"),
            FileStatus::Failed => write!(f, "Failed"),
        }
    }
}

impl std::str::FromStr for FileStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Waiting" => Ok(FileStatus::Waiting),
            "Executing" => Ok(FileStatus::Executing),
            "Done" => Ok(FileStatus::Done),
            "Failed" => Ok(FileStatus::Failed),
            _ => Err(StoreError::InvalidValue {
                column: "status",
                value: s.to_string(),
            }),
        }
    }
}

/// Job state, also used as the name of a logging event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobStatus {
    /// Accepted by the transfer backend; counts against the channel cap
    Submitted,
    Done,
    Failed,
}

impl JobStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Submitted)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Submitted => write!(f, "Submitted"),
            JobStatus::Done => write!(f, "Done"),
            JobStatus::Failed => write!(f, "Failed"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Submitted" => Ok(JobStatus::Submitted),
            "Done" => Ok(JobStatus::Done),
            "Failed" => Ok(JobStatus::Failed),
            _ => Err(StoreError::InvalidValue {
                column: "status",
                value: s.to_string(),
            }),
        }
    }
}

/// Denormalized job attributes set after the job record exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobAttribute {
    NumberOfFiles(u64),
    TotalSize(u64),
}

impl JobAttribute {
    pub fn name(&self) -> &'static str {
        match self {
            JobAttribute::NumberOfFiles(_) => "NumberOfFiles",
            JobAttribute::TotalSize(_) => "TotalSize",
        }
    }
}

/// Attributes carried by a file to job link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileLinkAttribute {
    FileSize(u64),
}

impl FileLinkAttribute {
    pub fn name(&self) -> &'static str {
        match self {
            FileLinkAttribute::FileSize(_) => "FileSize",
        }
    }
}

/// A persisted transfer job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferJob {
    pub id: JobId,
    /// Backend-assigned job identifier
    pub guid: String,
    /// Backend server endpoint that accepted the job
    pub server: String,
    pub channel_id: ChannelId,
    pub status: JobStatus,
    pub number_of_files: Option<u64>,
    pub total_size: Option<u64>,
    pub submitted_at: DateTime<Utc>,
}

/// Association between a file and the job carrying it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileJobLink {
    pub file_id: FileId,
    pub job_id: JobId,
    pub channel_id: ChannelId,
    pub file_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingEvent {
    pub job_id: JobId,
    pub event: JobStatus,
    pub at: DateTime<Utc>,
}

/// A job whose recorded file count disagrees with its links
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InconsistentJob {
    pub job_id: JobId,
    pub guid: String,
    pub channel_id: ChannelId,
    pub recorded_files: Option<u64>,
    pub linked_files: u64,
}

/// Operations the submission agent needs from the work queue
///
/// Implementations own all persisted state. The channel cap is enforced
/// here, by `select_eligible_channel`, against committed job state; callers
/// take no locks of their own.
#[async_trait]
pub trait WorkQueueStore: Send + Sync {
    /// Pick one channel with queued files and fewer than
    /// `max_active_jobs` active jobs. `None` when nothing is eligible.
    async fn select_eligible_channel(&self, max_active_jobs: u32) -> Result<Option<Channel>>;

    /// Read up to `max_count` waiting files of a channel, oldest first.
    ///
    /// This does not change file state; `link_files_to_job` does.
    async fn take_queued_files(&self, channel_id: ChannelId, max_count: usize)
        -> Result<ChannelBatch>;

    /// Record a job accepted by the backend and return its store identifier
    async fn create_job(&self, guid: &str, server: &str, channel_id: ChannelId) -> Result<JobId>;

    async fn set_job_attribute(&self, job_id: JobId, attribute: JobAttribute) -> Result<()>;

    /// Append an immutable event noting the job reached `event`
    async fn append_logging_event(&self, job_id: JobId, event: JobStatus) -> Result<()>;

    /// Link files to a job and move them from Waiting to Executing
    ///
    /// Either every file is linked and transitioned, or nothing changes.
    async fn link_files_to_job(
        &self,
        job_id: JobId,
        file_ids: &[FileId],
        channel_id: ChannelId,
    ) -> Result<()>;

    async fn set_file_link_attribute(
        &self,
        job_id: JobId,
        file_id: FileId,
        attribute: FileLinkAttribute,
    ) -> Result<()>;
}
