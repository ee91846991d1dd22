//! Contract of the remote project store.
//!
//! Requests are started synchronously and identified by a [`RequestId`].
//! Their progress and outcome come back later as [`ApiEvent`]s, delivered to
//! whoever owns the engine. Nothing here blocks.

pub mod http;
pub mod types;

use std::fmt;
use std::path::Path;

use thiserror::Error;

pub use http::HttpCloudApi;
pub use types::{FileVersion, RemoteFile};

/// Handle of one request issued through a [`CloudApi`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Classification of a finished request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("HTTP {status}: {detail}")]
    Http { status: u16, detail: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("request aborted")]
    Aborted,
}

/// Event reported by a transport for a request it is running.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiEvent {
    UploadProgress {
        request: RequestId,
        sent: u64,
        total: u64,
    },
    DownloadProgress {
        request: RequestId,
        received: u64,
        total: u64,
    },
    /// The server answered with a redirect. The request is not followed by
    /// the transport; the caller decides what to do with the target.
    Redirected { request: RequestId, url: String },
    /// Listing produced by a `refresh_file_list` request, sent before its
    /// `Finished` event.
    FileList {
        request: RequestId,
        files: Vec<RemoteFile>,
    },
    Finished {
        request: RequestId,
        result: Result<(), ApiError>,
    },
}

impl ApiEvent {
    pub fn request(&self) -> RequestId {
        match self {
            ApiEvent::UploadProgress { request, .. }
            | ApiEvent::DownloadProgress { request, .. }
            | ApiEvent::Redirected { request, .. }
            | ApiEvent::FileList { request, .. }
            | ApiEvent::Finished { request, .. } => *request,
        }
    }
}

/// Operations consumed from the remote project store client.
///
/// Implementations must return immediately and report through [`ApiEvent`]s.
/// A request that was aborted may or may not report a `Finished` event.
pub trait CloudApi {
    /// Upload `local_file` under `key`.
    fn start_upload(&mut self, key: &str, local_file: &Path) -> RequestId;

    /// Request the file stored under `key`, optionally a specific version.
    /// The answer is usually a redirect to the actual storage location.
    fn start_download(&mut self, key: &str, version_id: Option<&str>, destination: &Path)
        -> RequestId;

    /// Fetch the redirect target `url` into `destination`.
    fn follow_redirect(&mut self, url: &str, destination: &Path) -> RequestId;

    fn start_delete(&mut self, key: &str) -> RequestId;

    /// Reload the remote file listing of a project.
    fn refresh_file_list(&mut self, project_id: &str) -> RequestId;

    /// Cancel a request that is still in flight. Unknown ids are ignored.
    fn abort(&mut self, request: RequestId);
}

/// Remote identity of a project file.
pub fn remote_key(project_id: &str, name: &str) -> String {
    format!("{}/{}", project_id, name.trim_start_matches('/'))
}
