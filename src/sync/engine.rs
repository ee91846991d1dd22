//! Sync engine for one project.
//!
//! Runs a single sync session through its phases:
//!
//! ```text
//! backup -> upload -> delete -> download -> commit
//! ```
//!
//! The engine never blocks. `sync()` stages the local files and issues the
//! first requests, then every transport event is fed back through
//! `handle_event()`, which advances the current phase and reports through
//! [`SyncNotification`]s.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use tokio::sync::mpsc::UnboundedSender;

use crate::api::{remote_key, ApiEvent, CloudApi, RemoteFile, RequestId};
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::fs::{check_control_dir, Area, FileRecord, LocalFs, StagingArea};
use crate::sync::events::SyncNotification;
use crate::sync::queue::{QueueEvent, TransferQueue};
use crate::sync::transfer::{QueueEntry, TransferRecord};

/// Upload progress stays below this until every upload has finished.
const MAX_PENDING_PROGRESS: f64 = 0.999;

/// Orchestrates one sync session against a [`CloudApi`].
pub struct SyncEngine<A: CloudApi> {
    api: A,
    project_id: String,
    project_root: PathBuf,
    control_dir: String,
    max_parallel_downloads: usize,
    notifications: UnboundedSender<SyncNotification>,
    staging: Option<StagingArea>,

    uploads: BTreeMap<String, TransferRecord>,
    downloads: BTreeMap<String, FileRecord>,
    deletes: BTreeMap<String, TransferRecord>,
    upload_requests: HashMap<RequestId, String>,
    delete_requests: HashMap<RequestId, String>,
    refresh_request: Option<RequestId>,
    queue: Option<TransferQueue>,
    remote_files: Vec<RemoteFile>,

    upload_bytes_total: u64,
    download_bytes_total: u64,
    deleted_count: usize,
    upload_progress: f64,

    upload_active: bool,
    delete_active: bool,
    download_active: bool,
    refresh_active: bool,
    started: bool,
    aborted: bool,
    finished: bool,
    completed: bool,
}

impl<A: CloudApi> SyncEngine<A> {
    pub fn new(
        api: A,
        project_id: impl Into<String>,
        project_root: impl Into<PathBuf>,
        config: &Config,
        notifications: UnboundedSender<SyncNotification>,
    ) -> Self {
        Self {
            api,
            project_id: project_id.into(),
            project_root: project_root.into(),
            control_dir: config.control_dir.clone(),
            max_parallel_downloads: config.max_parallel_downloads,
            notifications,
            staging: None,
            uploads: BTreeMap::new(),
            downloads: BTreeMap::new(),
            deletes: BTreeMap::new(),
            upload_requests: HashMap::new(),
            delete_requests: HashMap::new(),
            refresh_request: None,
            queue: None,
            remote_files: Vec::new(),
            upload_bytes_total: 0,
            download_bytes_total: 0,
            deleted_count: 0,
            upload_progress: 0.0,
            upload_active: false,
            delete_active: false,
            download_active: false,
            refresh_active: false,
            started: false,
            aborted: false,
            finished: false,
            completed: false,
        }
    }

    /// Start the session.
    ///
    /// Stages and backs up the local files, then issues the upload requests
    /// and returns. Only the synchronous preparation can fail here; every
    /// later failure is reported as a notification.
    pub fn sync(&mut self, uploads: Vec<FileRecord>, downloads: Vec<FileRecord>, deletes: Vec<FileRecord>) -> Result<()> {
        if self.started {
            return Err(SyncError::AlreadyStarted);
        }
        check_control_dir(&self.control_dir)?;
        for record in uploads.iter().chain(&downloads).chain(&deletes) {
            record.validate(&self.project_id, &self.control_dir)?;
        }
        self.started = true;

        tracing::info!(
            "Syncing project {}: {} uploads, {} downloads, {} deletes",
            self.project_id,
            uploads.len(),
            downloads.len(),
            deletes.len()
        );

        let staging = StagingArea::create(&self.project_root, &self.control_dir)?;

        for record in uploads {
            let staged = staging.stage_upload(&record)?;
            self.upload_bytes_total += record.local_size.unwrap_or(0);

            let mut transfer = TransferRecord::new(record);
            transfer.staged_path = Some(staged);
            self.uploads.insert(transfer.file.name.clone(), transfer);
        }

        for record in downloads {
            self.download_bytes_total += record.remote_size.unwrap_or(0);
            self.downloads.insert(record.name.clone(), record);
        }

        for record in deletes {
            self.deletes.insert(record.name.clone(), TransferRecord::new(record));
        }

        let about_to_change = self.uploads.values().map(|t| &t.file).chain(self.downloads.values());
        staging.backup(about_to_change)?;
        self.staging = Some(staging);

        self.start_upload_phase();
        Ok(())
    }

    /// Feed one transport event into the session.
    pub fn handle_event(&mut self, event: ApiEvent) {
        if self.aborted {
            return;
        }

        let request = event.request();
        if let Some(name) = self.upload_requests.get(&request).cloned() {
            self.on_upload_event(name, event);
        } else if let Some(name) = self.delete_requests.get(&request).cloned() {
            self.on_delete_event(name, event);
        } else if self.refresh_request == Some(request) {
            self.on_refresh_event(event);
        } else if self.queue.as_ref().is_some_and(|q| q.owns(request)) {
            self.on_queue_event(event);
        } else {
            tracing::trace!("Ignoring event for unknown request {}", request);
        }
    }

    /// Cancel everything still in flight. Calling it again does nothing.
    pub fn abort(&mut self) {
        if self.aborted {
            return;
        }
        self.aborted = true;
        tracing::warn!("Aborting sync of project {}", self.project_id);

        for record in self.uploads.values().chain(self.deletes.values()) {
            if !record.is_pending() {
                continue;
            }
            if let Some(request) = record.request {
                self.api.abort(request);
            }
        }

        if self.refresh_active {
            if let Some(request) = self.refresh_request {
                self.api.abort(request);
            }
            self.refresh_active = false;
        }

        if let Some(queue) = self.queue.as_mut() {
            queue.abort(&mut self.api);
        }

        self.notify(SyncNotification::Aborted);
    }

    /// The user logged out while the session was running.
    pub fn on_logout(&mut self) {
        tracing::info!("Logged out, stopping the sync");
        self.abort();
    }

    /// No further notification will be sent.
    pub fn is_done(&self) -> bool {
        self.completed || self.aborted
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// An upload, delete or download phase is running.
    pub fn is_transferring(&self) -> bool {
        self.upload_active || self.delete_active || self.download_active
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Whether the download phase ended and the commit ran.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Remote listing received from the refresh issued after the uploads.
    pub fn remote_files(&self) -> &[RemoteFile] {
        &self.remote_files
    }

    pub fn staging(&self) -> Option<&StagingArea> {
        self.staging.as_ref()
    }

    pub fn download_queue(&self) -> Option<&TransferQueue> {
        self.queue.as_ref()
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    fn notify(&self, notification: SyncNotification) {
        let _ = self.notifications.send(notification);
    }

    // --- upload ---

    fn start_upload_phase(&mut self) {
        self.upload_active = true;

        if self.uploads.is_empty() {
            tracing::debug!("Nothing to upload");
            self.upload_progress = 1.0;
            self.notify(SyncNotification::UploadProgress(1.0));
            self.finish_upload_phase();
            return;
        }

        tracing::info!("Uploading {} files", self.uploads.len());
        for (name, record) in &mut self.uploads {
            let Some(staged) = record.staged_path.as_deref() else {
                continue;
            };
            let request = self.api.start_upload(&remote_key(&self.project_id, name), staged);
            tracing::debug!("Upload of {} started as {}", name, request);

            record.request = Some(request);
            self.upload_requests.insert(request, name.clone());
        }
    }

    fn on_upload_event(&mut self, name: String, event: ApiEvent) {
        let Some(record) = self.uploads.get_mut(&name) else {
            return;
        };
        if record.finished {
            return;
        }

        match event {
            ApiEvent::UploadProgress { sent, total, .. } => {
                // a transport always has a few bytes to send
                if total == 0 {
                    return;
                }
                record.bytes_transferred = sent;
                record.bytes_total = total;
                self.report_upload_progress();
            }
            ApiEvent::Finished { result: Err(err), .. } => {
                record.finished = true;
                tracing::error!("Upload of {} failed: {}", name, err);
                self.notify(SyncNotification::Error {
                    message: format!("Uploading file \"{}\" failed: {}", name, err),
                    cause: SyncError::api(name, err),
                });
                self.abort();
            }
            ApiEvent::Finished { result: Ok(()), .. } => {
                record.finished = true;
                record.bytes_transferred = record.bytes_total;
                tracing::debug!("Uploaded {}", name);

                if self.uploads.values().all(|r| r.finished) {
                    self.upload_progress = 1.0;
                    self.notify(SyncNotification::UploadProgress(1.0));
                    self.finish_upload_phase();
                } else {
                    self.report_upload_progress();
                }
            }
            _ => {}
        }
    }

    /// `sum(transferred) / max(sum(total), staged bytes)`, never decreasing.
    fn report_upload_progress(&mut self) {
        let mut fraction = if self.upload_bytes_total == 0 {
            1.0
        } else {
            let (sent, total) = self
                .uploads
                .values()
                .fold((0u64, 0u64), |(s, t), r| (s + r.bytes_transferred, t + r.bytes_total));
            (sent as f64 / total.max(self.upload_bytes_total) as f64).min(1.0)
        };

        fraction = fraction.min(MAX_PENDING_PROGRESS).max(self.upload_progress);
        self.upload_progress = fraction;
        self.notify(SyncNotification::UploadProgress(fraction));
    }

    fn finish_upload_phase(&mut self) {
        self.upload_active = false;
        self.notify(SyncNotification::UploadFinished);

        self.refresh_active = true;
        self.refresh_request = Some(self.api.refresh_file_list(&self.project_id));

        self.start_delete_phase();
    }

    // --- delete ---

    fn start_delete_phase(&mut self) {
        self.delete_active = true;

        if self.deletes.is_empty() {
            tracing::debug!("Nothing to delete");
            self.check_delete_finished();
            return;
        }

        tracing::info!("Deleting {} files", self.deletes.len());
        for (name, record) in &mut self.deletes {
            if let Some(local) = record.file.local_path.as_deref() {
                if let Err(err) = LocalFs::delete_file(local) {
                    tracing::warn!("Failed to delete local copy of {}: {}", name, err);
                    let _ = self.notifications.send(SyncNotification::Error {
                        message: format!("Deleting local file \"{}\" failed.", name),
                        cause: err,
                    });
                }
            }

            if record.file.checkout.cloud {
                let request = self.api.start_delete(&remote_key(&self.project_id, name));
                record.request = Some(request);
                self.delete_requests.insert(request, name.clone());
            } else {
                record.finished = true;
                self.deleted_count += 1;
            }
        }

        // covers sets made only of local files
        self.check_delete_finished();
    }

    fn on_delete_event(&mut self, name: String, event: ApiEvent) {
        let ApiEvent::Finished { result, .. } = event else {
            return;
        };
        let Some(record) = self.deletes.get_mut(&name) else {
            return;
        };
        if record.finished {
            return;
        }
        record.finished = true;
        self.deleted_count += 1;

        match result {
            Ok(()) => tracing::debug!("Deleted {} remotely", name),
            Err(err) => {
                tracing::warn!("Remote delete of {} failed: {}", name, err);
                self.notify(SyncNotification::Error {
                    message: format!("Deleting file \"{}\" failed.", name),
                    cause: SyncError::api(name, err),
                });
            }
        }

        self.check_delete_finished();
    }

    fn check_delete_finished(&mut self) {
        if !self.delete_active || self.deleted_count < self.deletes.len() {
            return;
        }
        self.delete_active = false;
        self.notify(SyncNotification::DeleteFinished);
        self.start_download_phase();
    }

    // --- download ---

    fn start_download_phase(&mut self) {
        self.download_active = true;

        let Some(staging) = self.staging.as_ref() else {
            return;
        };

        if self.downloads.is_empty() {
            tracing::debug!("Nothing to download");
            self.finish_download_phase();
            return;
        }

        let entries = self
            .downloads
            .values()
            .map(|record| QueueEntry::new(&record.name, staging.path_in(Area::Download, record)))
            .collect();

        let mut queue = TransferQueue::new(&self.project_id, entries, self.max_parallel_downloads);
        let events = queue.start(&mut self.api);
        self.queue = Some(queue);

        for event in events {
            self.on_queue_notification(event);
        }
    }

    fn on_queue_event(&mut self, event: ApiEvent) {
        let Some(queue) = self.queue.as_mut() else {
            return;
        };
        let events = queue.handle_event(&mut self.api, &event);

        for event in events {
            if self.aborted {
                break;
            }
            self.on_queue_notification(event);
        }
    }

    fn on_queue_notification(&mut self, event: QueueEvent) {
        match event {
            QueueEvent::Progress { transferred, .. } => {
                let fraction = (transferred as f64 / self.download_bytes_total.max(1) as f64).min(1.0);
                self.notify(SyncNotification::DownloadProgress(fraction));
            }
            QueueEvent::FileFinished { name } => {
                self.notify(SyncNotification::FileDownloaded { name });
            }
            QueueEvent::Error { message, cause, .. } => {
                self.notify(SyncNotification::Error { message, cause });
                self.abort();
            }
            QueueEvent::Finished => self.finish_download_phase(),
            QueueEvent::Aborted => {}
        }
    }

    fn finish_download_phase(&mut self) {
        self.commit();

        self.download_active = false;
        self.notify(SyncNotification::DownloadProgress(1.0));
        self.notify(SyncNotification::DownloadFinished);

        self.finished = true;
        self.try_complete();
    }

    // --- commit ---

    /// Copy the staged downloads into the project, rolling back from the
    /// backup if any copy fails.
    fn commit(&self) {
        let Some(staging) = self.staging.as_ref() else {
            return;
        };

        let destinations: HashMap<String, PathBuf> = self
            .downloads
            .values()
            .map(|record| (record.name.clone(), record.destination(&self.project_root)))
            .collect();
        let root = self.project_root.clone();
        let resolve = move |name: &str| {
            destinations
                .get(name)
                .cloned()
                .unwrap_or_else(|| project_path(&root, name))
        };

        let err = match staging.commit_downloads(&resolve) {
            Ok(copied) => {
                tracing::info!("Committed {} files into {}", copied.len(), self.project_root.display());
                return;
            }
            Err(err) => err,
        };

        tracing::error!("Commit failed: {}", err);
        let cause = SyncError::Commit { source: Box::new(err) };
        self.notify(SyncNotification::Error {
            message: cause.to_string(),
            cause,
        });

        self.rollback();
    }

    fn rollback(&self) {
        let Some(staging) = self.staging.as_ref() else {
            return;
        };

        let destinations: HashMap<String, PathBuf> = self
            .uploads
            .values()
            .map(|t| &t.file)
            .chain(self.downloads.values())
            .map(|record| (record.name.clone(), record.destination(&self.project_root)))
            .collect();
        let root = self.project_root.clone();
        let resolve = move |name: &str| {
            destinations
                .get(name)
                .cloned()
                .unwrap_or_else(|| project_path(&root, name))
        };

        match staging.restore_backup(&resolve) {
            Ok(restored) => {
                tracing::warn!("Rolled back {} files from the backup", restored.len());
                self.notify(SyncNotification::RolledBack);
            }
            Err(err) => {
                let cause = SyncError::RollbackFailed {
                    backup_dir: staging.dir(Area::Backup),
                    source: Box::new(err),
                };
                tracing::error!("{}", cause);
                self.notify(SyncNotification::Error {
                    message: cause.to_string(),
                    cause,
                });
            }
        }
    }

    // --- refresh & completion ---

    fn on_refresh_event(&mut self, event: ApiEvent) {
        match event {
            ApiEvent::FileList { files, .. } => {
                tracing::debug!("Remote listing has {} files", files.len());
                self.remote_files = files;
            }
            ApiEvent::Finished { result, .. } => {
                if !self.refresh_active {
                    return;
                }
                self.refresh_active = false;

                if let Err(err) = result {
                    tracing::warn!("Refreshing the remote file list failed: {}", err);
                    self.notify(SyncNotification::Error {
                        message: "Refreshing the remote file list failed.".to_string(),
                        cause: SyncError::api(&self.project_id, err),
                    });
                }

                self.try_complete();
            }
            _ => {}
        }
    }

    fn try_complete(&mut self) {
        if !self.finished || self.refresh_active || self.completed {
            return;
        }
        self.completed = true;
        tracing::info!("Sync of project {} complete", self.project_id);
        self.notify(SyncNotification::Finished);
    }
}

/// `name` resolved below `root`.
fn project_path(root: &Path, name: &str) -> PathBuf {
    name.split('/')
        .filter(|part| !part.is_empty())
        .fold(root.to_path_buf(), |path, part| path.join(part))
}
