//! Bounded download queue.
//!
//! Keeps at most `max_parallel` requests in flight. Every completion re-runs
//! the slot filling pass, so the next waiting file starts as soon as a slot
//! frees up, without a scheduler of its own. Redirects are followed by
//! issuing a new request for the same transfer.

use std::collections::HashMap;

use crate::api::{remote_key, ApiError, ApiEvent, CloudApi, RequestId};
use crate::error::SyncError;
use crate::sync::transfer::{FileTransfer, QueueEntry};

/// Concurrency used when the caller does not configure one.
pub const DEFAULT_MAX_PARALLEL_DOWNLOADS: usize = 8;

/// What the queue reports back to its owner.
#[derive(Debug)]
pub enum QueueEvent {
    /// Byte counters summed over every transfer of the queue.
    Progress {
        name: String,
        transferred: u64,
        total: u64,
    },
    FileFinished {
        name: String,
    },
    /// A single file failed. The rest of the queue keeps running.
    Error {
        name: String,
        message: String,
        cause: SyncError,
    },
    /// Every file was downloaded and verified.
    Finished,
    Aborted,
}

pub struct TransferQueue {
    project_id: String,
    pending: Vec<QueueEntry>,
    transfers: Vec<FileTransfer>,
    requests: HashMap<RequestId, usize>,
    max_parallel: usize,
    finished_count: usize,
    started: bool,
    aborted: bool,
    completed: bool,
}

impl TransferQueue {
    pub fn new(project_id: impl Into<String>, entries: Vec<QueueEntry>, max_parallel: usize) -> Self {
        Self {
            project_id: project_id.into(),
            pending: entries,
            transfers: Vec::new(),
            requests: HashMap::new(),
            max_parallel: max_parallel.max(1),
            finished_count: 0,
            started: false,
            aborted: false,
            completed: false,
        }
    }

    /// Create the transfers and fill the first slots.
    pub fn start(&mut self, api: &mut dyn CloudApi) -> Vec<QueueEvent> {
        if self.started {
            return Vec::new();
        }
        self.started = true;

        self.transfers = self.pending.drain(..).map(FileTransfer::new).collect();
        tracing::info!(
            "Downloading {} files, at most {} at a time",
            self.transfers.len(),
            self.max_parallel
        );

        if self.transfers.is_empty() {
            self.completed = true;
            return vec![QueueEvent::Finished];
        }

        self.fill_slots(api);
        Vec::new()
    }

    /// Whether `request` was issued by this queue.
    pub fn owns(&self, request: RequestId) -> bool {
        self.requests.contains_key(&request)
    }

    /// Feed a transport event belonging to this queue.
    pub fn handle_event(&mut self, api: &mut dyn CloudApi, event: &ApiEvent) -> Vec<QueueEvent> {
        if self.aborted || self.completed {
            return Vec::new();
        }

        let request = event.request();
        let Some(&index) = self.requests.get(&request) else {
            return Vec::new();
        };
        // events of an attempt that was replaced after a redirect
        if self.transfers[index].last_attempt() != Some(request) {
            return Vec::new();
        }

        match event {
            ApiEvent::DownloadProgress { received, total, .. } => self.on_progress(index, *received, *total),
            ApiEvent::Redirected { url, .. } => {
                self.on_redirect(api, index, request, url);
                Vec::new()
            }
            ApiEvent::Finished { result, .. } => self.on_finished(api, index, result.clone()),
            _ => Vec::new(),
        }
    }

    /// Abort every started transfer that has not finished yet.
    pub fn abort(&mut self, api: &mut dyn CloudApi) -> Vec<QueueEvent> {
        if self.aborted {
            return Vec::new();
        }
        self.aborted = true;

        for transfer in &mut self.transfers {
            if !transfer.is_started() || transfer.is_finished() {
                continue;
            }
            transfer.aborted = true;
            if let Some(request) = transfer.last_attempt() {
                api.abort(request);
            }
        }

        tracing::info!("Download queue aborted");
        vec![QueueEvent::Aborted]
    }

    pub fn transfers(&self) -> &[FileTransfer] {
        &self.transfers
    }

    pub fn transfer(&self, name: &str) -> Option<&FileTransfer> {
        self.transfers.iter().find(|t| t.name() == name)
    }

    /// Requests currently running.
    pub fn in_flight(&self) -> usize {
        self.transfers.iter().filter(|t| t.is_in_flight()).count()
    }

    pub fn finished_count(&self) -> usize {
        self.finished_count
    }

    pub fn is_complete(&self) -> bool {
        self.completed
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// (transferred, total) summed over every transfer.
    pub fn bytes(&self) -> (u64, u64) {
        self.transfers.iter().fold((0, 0), |(done, total), t| {
            (done + t.bytes_transferred, total + t.bytes_total)
        })
    }

    /// Walk the transfers in order and give each of the first
    /// `max_parallel` unfinished ones a running request.
    fn fill_slots(&mut self, api: &mut dyn CloudApi) {
        let selected: Vec<usize> = (0..self.transfers.len())
            .filter(|&i| !self.transfers[i].is_finished())
            .take(self.max_parallel)
            .collect();

        for index in selected {
            let transfer = &mut self.transfers[index];

            let request = if transfer.is_redirect_pending() {
                let Some(url) = transfer.last_redirect_url() else {
                    continue;
                };
                api.follow_redirect(url, &transfer.entry.destination)
            } else if transfer.is_started() {
                // still waiting for the answer of the running request
                continue;
            } else {
                api.start_download(
                    &remote_key(&self.project_id, &transfer.entry.name),
                    transfer.entry.version_id.as_deref(),
                    &transfer.entry.destination,
                )
            };

            transfer.push_attempt(request);
            self.requests.insert(request, index);
        }
    }

    fn on_progress(&mut self, index: usize, received: u64, total: u64) -> Vec<QueueEvent> {
        let transfer = &mut self.transfers[index];
        transfer.bytes_transferred = received;
        transfer.bytes_total = total;
        let name = transfer.name().to_string();

        let (transferred, total) = self.bytes();
        vec![QueueEvent::Progress { name, transferred, total }]
    }

    fn on_redirect(&mut self, api: &mut dyn CloudApi, index: usize, request: RequestId, url: &str) {
        let transfer = &mut self.transfers[index];
        if transfer.is_redirect_pending() || transfer.is_finished() {
            return;
        }

        tracing::debug!("{} redirected by {}", transfer.name(), request);
        transfer.push_redirect(url.to_string());
        api.abort(request);

        self.fill_slots(api);
    }

    fn on_finished(
        &mut self,
        api: &mut dyn CloudApi,
        index: usize,
        result: Result<(), ApiError>,
    ) -> Vec<QueueEvent> {
        {
            let transfer = &self.transfers[index];
            // the request was cut short on purpose to follow a redirect
            if transfer.is_redirect_pending() || transfer.is_finished() {
                return Vec::new();
            }
        }

        self.transfers[index].mark_done(result.err());
        self.fill_slots(api);

        let transfer = &self.transfers[index];
        let name = transfer.name().to_string();
        let destination = transfer.entry.destination.clone();

        if let Some(err) = &transfer.error {
            tracing::warn!("Download of {} failed: {}", name, err);
            return vec![QueueEvent::Error {
                message: format!("Downloaded file \"{}\" had an HTTP error!", destination.display()),
                cause: SyncError::api(&name, err.clone()),
                name,
            }];
        }

        if !destination.exists() {
            tracing::warn!("Download of {} reported success but {} is missing", name, destination.display());
            return vec![QueueEvent::Error {
                message: format!("Downloaded file \"{}\" not found!", destination.display()),
                cause: SyncError::MissingDownload {
                    name: name.clone(),
                    path: destination,
                },
                name,
            }];
        }

        self.finished_count += 1;
        let mut events = vec![QueueEvent::FileFinished { name }];

        if self.finished_count == self.transfers.len() {
            self.completed = true;
            tracing::info!("All {} downloads finished", self.finished_count);
            events.push(QueueEvent::Finished);
        }

        events
    }
}
