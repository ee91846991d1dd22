//! Notifications emitted by the sync engine.

use crate::error::SyncError;

/// Everything an observer of a sync run gets to see.
///
/// Progress values are fractions in `0.0..=1.0`.
#[derive(Debug)]
pub enum SyncNotification {
    UploadProgress(f64),
    DownloadProgress(f64),
    UploadFinished,
    DeleteFinished,
    DownloadFinished,
    /// One file was downloaded into the staging area.
    FileDownloaded { name: String },
    /// A failed commit was undone from the backup.
    RolledBack,
    Error { message: String, cause: SyncError },
    /// The session was aborted. Sent at most once.
    Aborted,
    /// All phases are complete and the remote listing is up to date. Sent at
    /// most once.
    Finished,
}
