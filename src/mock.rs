//! In-memory collaborators for testing
//!
//! `MockStore`, `MockBackend` and `MockCredentialProvider` stand in for the
//! work-queue database, the transfer service and the credential manager.
//! Each operation can be made to fail so the agent's failure policy can be
//! exercised step by step.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use transfer_db::{
    Channel, ChannelBatch, ChannelId, FileId, FileLinkAttribute, FileStatus, JobAttribute, JobId,
    JobStatus, QueuedFile, StoreError, TransferJob, WorkQueueStore,
};

use crate::backend::{Submission, TransferBackend};
use crate::credential::{AuthContext, Credential, CredentialProvider};
use crate::error::{Result, SubmitError};
use crate::request::TransferRequest;

/// Store operations that can be told to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    SelectEligibleChannel,
    TakeQueuedFiles,
    CreateJob,
    SetJobAttribute,
    AppendLoggingEvent,
    LinkFilesToJob,
    SetFileLinkAttribute,
}

#[derive(Debug, Clone)]
struct MockFile {
    channel_id: ChannelId,
    file: QueuedFile,
    status: FileStatus,
}

#[derive(Debug, Default)]
struct StoreState {
    channels: BTreeMap<ChannelId, Channel>,
    files: BTreeMap<FileId, MockFile>,
    jobs: BTreeMap<JobId, TransferJob>,
    events: Vec<(JobId, JobStatus)>,
    links: BTreeMap<(JobId, FileId), Option<u64>>,
    failing: HashSet<StoreOp>,
    failing_links: HashSet<FileId>,
    next_id: i64,
}

impl StoreState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn check(&self, op: StoreOp) -> transfer_db::Result<()> {
        if self.failing.contains(&op) {
            return Err(StoreError::Database(format!("injected failure in {:?}", op)));
        }
        Ok(())
    }

    fn active_jobs(&self, channel_id: ChannelId) -> usize {
        self.jobs
            .values()
            .filter(|j| j.channel_id == channel_id && j.status.is_active())
            .count()
    }

    fn has_waiting(&self, channel_id: ChannelId) -> bool {
        self.files
            .values()
            .any(|f| f.channel_id == channel_id && f.status == FileStatus::Waiting)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockStore {
    state: Arc<Mutex<StoreState>>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_channel(&self, source: &str, destination: &str, space_token: Option<&str>) -> Channel {
        let mut state = self.state.lock().unwrap();
        let channel = Channel {
            id: state.next_id(),
            source: source.to_string(),
            destination: destination.to_string(),
            space_token: space_token.map(str::to_string),
        };
        state.channels.insert(channel.id, channel.clone());
        channel
    }

    /// Queue one file per size, returning their ids in order
    pub fn enqueue_sizes(&self, channel_id: ChannelId, sizes: &[u64]) -> Vec<FileId> {
        let mut state = self.state.lock().unwrap();
        sizes
            .iter()
            .map(|&size| {
                let id = state.next_id();
                let file = QueuedFile {
                    id,
                    lfn: format!("/lhcb/data/{}.raw", id),
                    source_surl: format!("srm://source/{}.raw", id),
                    target_surl: format!("srm://target/{}.raw", id),
                    size,
                };
                state.files.insert(
                    id,
                    MockFile {
                        channel_id,
                        file,
                        status: FileStatus::Waiting,
                    },
                );
                id
            })
            .collect()
    }

    pub fn fail(&self, op: StoreOp) {
        self.state.lock().unwrap().failing.insert(op);
    }

    pub fn recover(&self, op: StoreOp) {
        self.state.lock().unwrap().failing.remove(&op);
    }

    pub fn fail_file_link_attribute(&self, file_id: FileId) {
        self.state.lock().unwrap().failing_links.insert(file_id);
    }

    pub fn queued(&self, channel_id: ChannelId) -> Vec<QueuedFile> {
        let state = self.state.lock().unwrap();
        state
            .files
            .values()
            .filter(|f| f.channel_id == channel_id && f.status == FileStatus::Waiting)
            .map(|f| f.file.clone())
            .collect()
    }

    pub fn file_status(&self, file_id: FileId) -> Option<FileStatus> {
        self.state.lock().unwrap().files.get(&file_id).map(|f| f.status)
    }

    pub fn job(&self, job_id: JobId) -> Option<TransferJob> {
        self.state.lock().unwrap().jobs.get(&job_id).cloned()
    }

    pub fn jobs(&self) -> Vec<TransferJob> {
        self.state.lock().unwrap().jobs.values().cloned().collect()
    }

    pub fn job_count(&self) -> usize {
        self.state.lock().unwrap().jobs.len()
    }

    pub fn finish_job(&self, job_id: JobId) {
        if let Some(job) = self.state.lock().unwrap().jobs.get_mut(&job_id) {
            job.status = JobStatus::Done;
        }
    }

    pub fn events(&self, job_id: JobId) -> Vec<JobStatus> {
        let state = self.state.lock().unwrap();
        state
            .events
            .iter()
            .filter(|(id, _)| *id == job_id)
            .map(|(_, event)| *event)
            .collect()
    }

    pub fn link_sizes(&self, job_id: JobId) -> Vec<(FileId, Option<u64>)> {
        let state = self.state.lock().unwrap();
        state
            .links
            .iter()
            .filter(|((job, _), _)| *job == job_id)
            .map(|((_, file), size)| (*file, *size))
            .collect()
    }
}

#[async_trait]
impl WorkQueueStore for MockStore {
    async fn select_eligible_channel(&self, max_active_jobs: u32) -> transfer_db::Result<Option<Channel>> {
        let state = self.state.lock().unwrap();
        state.check(StoreOp::SelectEligibleChannel)?;

        Ok(state
            .channels
            .values()
            .filter(|c| state.has_waiting(c.id))
            .filter(|c| state.active_jobs(c.id) < max_active_jobs as usize)
            .min_by_key(|c| (state.active_jobs(c.id), c.id))
            .cloned())
    }

    async fn take_queued_files(
        &self,
        channel_id: ChannelId,
        max_count: usize,
    ) -> transfer_db::Result<ChannelBatch> {
        let state = self.state.lock().unwrap();
        state.check(StoreOp::TakeQueuedFiles)?;

        let channel = state
            .channels
            .get(&channel_id)
            .ok_or(StoreError::NotFound { kind: "channel", id: channel_id })?;

        Ok(ChannelBatch {
            space_token: channel.space_token.clone(),
            files: state
                .files
                .values()
                .filter(|f| f.channel_id == channel_id && f.status == FileStatus::Waiting)
                .take(max_count)
                .map(|f| f.file.clone())
                .collect(),
        })
    }

    async fn create_job(&self, guid: &str, server: &str, channel_id: ChannelId) -> transfer_db::Result<JobId> {
        let mut state = self.state.lock().unwrap();
        state.check(StoreOp::CreateJob)?;

        let id = state.next_id();
        state.jobs.insert(
            id,
            TransferJob {
                id,
                guid: guid.to_string(),
                server: server.to_string(),
                channel_id,
                status: JobStatus::Submitted,
                number_of_files: None,
                total_size: None,
                submitted_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn set_job_attribute(&self, job_id: JobId, attribute: JobAttribute) -> transfer_db::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check(StoreOp::SetJobAttribute)?;

        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::NotFound { kind: "job", id: job_id })?;
        match attribute {
            JobAttribute::NumberOfFiles(n) => job.number_of_files = Some(n),
            JobAttribute::TotalSize(n) => job.total_size = Some(n),
        }
        Ok(())
    }

    async fn append_logging_event(&self, job_id: JobId, event: JobStatus) -> transfer_db::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check(StoreOp::AppendLoggingEvent)?;
        state.events.push((job_id, event));
        Ok(())
    }

    async fn link_files_to_job(
        &self,
        job_id: JobId,
        file_ids: &[FileId],
        channel_id: ChannelId,
    ) -> transfer_db::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check(StoreOp::LinkFilesToJob)?;

        for &file_id in file_ids {
            let waiting = state
                .files
                .get(&file_id)
                .is_some_and(|f| f.channel_id == channel_id && f.status == FileStatus::Waiting);
            if !waiting {
                return Err(StoreError::NotQueued { file_id, channel_id });
            }
        }
        for &file_id in file_ids {
            if let Some(f) = state.files.get_mut(&file_id) {
                f.status = FileStatus::Executing;
            }
            state.links.insert((job_id, file_id), None);
        }
        Ok(())
    }

    async fn set_file_link_attribute(
        &self,
        job_id: JobId,
        file_id: FileId,
        attribute: FileLinkAttribute,
    ) -> transfer_db::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check(StoreOp::SetFileLinkAttribute)?;
        if state.failing_links.contains(&file_id) {
            return Err(StoreError::Database(format!("injected failure for file {}", file_id)));
        }

        let FileLinkAttribute::FileSize(size) = attribute;
        let link = state
            .links
            .get_mut(&(job_id, file_id))
            .ok_or(StoreError::NotFound { kind: "file link", id: file_id })?;
        *link = Some(size);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct BackendState {
    failure: Option<String>,
    submitted: Vec<(TransferRequest, AuthContext)>,
}

/// Transfer backend that accepts jobs as G1, G2, ... on server S1
#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<BackendState>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, message: &str) {
        self.state.lock().unwrap().failure = Some(message.to_string());
    }

    pub fn calls(&self) -> usize {
        self.state.lock().unwrap().submitted.len()
    }

    pub fn requests(&self) -> Vec<(TransferRequest, AuthContext)> {
        self.state.lock().unwrap().submitted.clone()
    }
}

#[async_trait]
impl TransferBackend for MockBackend {
    async fn submit(&self, request: &TransferRequest, auth: &AuthContext) -> Result<Submission> {
        let mut state = self.state.lock().unwrap();
        state.submitted.push((request.clone(), auth.clone()));
        if let Some(message) = &state.failure {
            return Err(SubmitError::Submission(message.clone()));
        }
        Ok(Submission {
            guid: format!("G{}", state.submitted.len()),
            server: "S1".to_string(),
        })
    }
}

#[derive(Debug, Default)]
struct CredentialState {
    renewal_failure: Option<String>,
    renewals: usize,
}

/// Credential provider issuing `expires=<unix seconds>` blobs
#[derive(Debug, Clone, Default)]
pub struct MockCredentialProvider {
    state: Arc<Mutex<CredentialState>>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl MockCredentialProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// A credential valid for `secs` from now
    pub fn issue(&self, secs: u64) -> Credential {
        Credential::new(format!("expires={}", now_secs() + secs))
    }

    pub fn fail_renewal(&self, message: &str) {
        self.state.lock().unwrap().renewal_failure = Some(message.to_string());
    }

    pub fn renewals(&self) -> usize {
        self.state.lock().unwrap().renewals
    }
}

#[async_trait]
impl CredentialProvider for MockCredentialProvider {
    async fn renew(&self, _identity: &str, _group: &str, length_hours: u32) -> Result<Credential> {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(message) = &state.renewal_failure {
                return Err(SubmitError::Credential(message.clone()));
            }
            state.renewals += 1;
        }
        Ok(self.issue(u64::from(length_hours) * 3600))
    }

    async fn remaining_validity(&self, credential: &Credential) -> Result<u64> {
        let text = String::from_utf8_lossy(credential.as_bytes());
        let expires: u64 = text
            .strip_prefix("expires=")
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| SubmitError::Credential("unrecognised credential".to_string()))?;
        Ok(expires.saturating_sub(now_secs()))
    }
}
