//! Per-file transfer state shared by the engine and the download queue.

use std::path::PathBuf;

use crate::api::{ApiError, RequestId};
use crate::fs::FileRecord;

/// Progress of one upload or remote delete within a phase.
#[derive(Debug, Clone)]
pub struct TransferRecord {
    pub file: FileRecord,
    /// Copy inside the staging area the request reads from (uploads only).
    pub staged_path: Option<PathBuf>,
    pub request: Option<RequestId>,
    pub bytes_transferred: u64,
    pub bytes_total: u64,
    pub finished: bool,
}

impl TransferRecord {
    pub fn new(file: FileRecord) -> Self {
        let bytes_total = file.local_size.unwrap_or(0);
        Self {
            file,
            staged_path: None,
            request: None,
            bytes_transferred: 0,
            bytes_total,
            finished: false,
        }
    }

    /// Issued and still waiting for its completion.
    pub fn is_pending(&self) -> bool {
        self.request.is_some() && !self.finished
    }
}

/// What the download queue is asked to fetch for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub name: String,
    pub version_id: Option<String>,
    pub destination: PathBuf,
}

impl QueueEntry {
    pub fn new(name: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            version_id: None,
            destination: destination.into(),
        }
    }

    pub fn with_version(mut self, version_id: impl Into<String>) -> Self {
        self.version_id = Some(version_id.into());
        self
    }
}

/// Download state of one file: every attempt issued for it and every
/// redirect received, in order.
///
/// There are never more redirects than attempts. When both counts are
/// equal the latest attempt ended in a redirect that still has to be
/// followed.
#[derive(Debug, Clone)]
pub struct FileTransfer {
    pub entry: QueueEntry,
    attempts: Vec<RequestId>,
    redirects: Vec<String>,
    last_attempt_done: bool,
    pub bytes_transferred: u64,
    pub bytes_total: u64,
    pub error: Option<ApiError>,
    pub aborted: bool,
}

impl FileTransfer {
    pub fn new(entry: QueueEntry) -> Self {
        Self {
            entry,
            attempts: Vec::new(),
            redirects: Vec::new(),
            last_attempt_done: false,
            bytes_transferred: 0,
            bytes_total: 0,
            error: None,
            aborted: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.entry.name
    }

    pub fn attempts(&self) -> &[RequestId] {
        &self.attempts
    }

    pub fn redirects(&self) -> &[String] {
        &self.redirects
    }

    pub fn last_attempt(&self) -> Option<RequestId> {
        self.attempts.last().copied()
    }

    pub fn last_redirect_url(&self) -> Option<&str> {
        self.redirects.last().map(String::as_str)
    }

    pub fn is_started(&self) -> bool {
        !self.attempts.is_empty()
    }

    pub fn is_redirect_pending(&self) -> bool {
        self.is_started() && self.attempts.len() == self.redirects.len()
    }

    pub fn is_finished(&self) -> bool {
        if self.aborted {
            return true;
        }
        self.is_started() && !self.is_redirect_pending() && self.last_attempt_done
    }

    /// A request is running for this transfer.
    pub fn is_in_flight(&self) -> bool {
        !self.aborted && self.is_started() && !self.is_redirect_pending() && !self.last_attempt_done
    }

    pub fn is_failed(&self) -> bool {
        self.last_attempt_done && self.error.is_some()
    }

    pub(crate) fn push_attempt(&mut self, request: RequestId) {
        debug_assert!(!self.is_in_flight(), "one attempt at a time");
        self.attempts.push(request);
        self.last_attempt_done = false;
        self.bytes_transferred = 0;
    }

    pub(crate) fn push_redirect(&mut self, url: String) {
        debug_assert!(self.redirects.len() < self.attempts.len());
        self.redirects.push(url);
    }

    pub(crate) fn mark_done(&mut self, error: Option<ApiError>) {
        self.last_attempt_done = true;
        self.error = error;
    }
}
