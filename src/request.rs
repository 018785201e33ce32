//! Transfer request builder
//!
//! Turns one channel and its batch of queued files into the job description
//! handed to the transfer backend, keeping the per-file sizes needed for
//! bookkeeping once the backend has accepted the job.

use std::collections::BTreeMap;
use std::fmt::Write;

use transfer_db::{Channel, FileId, QueuedFile};

/// One file inside a transfer request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFile {
    pub lfn: String,
    pub source_surl: String,
    pub target_surl: String,
}

/// Job description submitted to the transfer backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub source_se: String,
    pub target_se: String,
    pub space_token: Option<String>,
    pub files: Vec<TransferFile>,
}

impl TransferRequest {
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Bulk submission listing: one `source destination` pair per line
    pub fn to_bulk_file(&self) -> String {
        let mut out = String::new();
        for file in &self.files {
            // Writing to a String cannot fail
            let _ = writeln!(out, "{} {}", file.source_surl, file.target_surl);
        }
        out
    }
}

/// A request plus what bookkeeping needs to know about its files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedBatch {
    pub request: TransferRequest,
    pub file_sizes: BTreeMap<FileId, u64>,
    pub total_size: u64,
}

impl PreparedBatch {
    pub fn file_ids(&self) -> Vec<FileId> {
        self.file_sizes.keys().copied().collect()
    }

    pub fn file_count(&self) -> usize {
        self.file_sizes.len()
    }
}

pub struct TransferRequestBuilder {
    request: TransferRequest,
    file_sizes: BTreeMap<FileId, u64>,
    total_size: u64,
}

impl TransferRequestBuilder {
    /// Start a request for `channel`, inheriting its space token
    pub fn for_channel(channel: &Channel) -> Self {
        Self {
            request: TransferRequest {
                source_se: channel.source.clone(),
                target_se: channel.destination.clone(),
                space_token: channel.space_token.clone(),
                files: Vec::new(),
            },
            file_sizes: BTreeMap::new(),
            total_size: 0,
        }
    }

    /// Override the space token; `None` keeps the channel's
    pub fn space_token(mut self, token: Option<String>) -> Self {
        if token.is_some() {
            self.request.space_token = token;
        }
        self
    }

    pub fn add_file(mut self, file: &QueuedFile) -> Self {
        if self.file_sizes.insert(file.id, file.size).is_none() {
            self.total_size += file.size;
            self.request.files.push(TransferFile {
                lfn: file.lfn.clone(),
                source_surl: file.source_surl.clone(),
                target_surl: file.target_surl.clone(),
            });
        }
        self
    }

    pub fn add_files<'a>(self, files: impl IntoIterator<Item = &'a QueuedFile>) -> Self {
        files.into_iter().fold(self, |builder, file| builder.add_file(file))
    }

    pub fn build(self) -> PreparedBatch {
        PreparedBatch {
            request: self.request,
            file_sizes: self.file_sizes,
            total_size: self.total_size,
        }
    }
}
