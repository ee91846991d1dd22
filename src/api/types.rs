use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One stored version of a remote file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileVersion {
    pub version_id: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_latest: bool,
}

/// Entry of the remote project file listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub versions: Vec<FileVersion>,
}

impl RemoteFile {
    /// Most recent version, the first one the store reports.
    pub fn latest_version(&self) -> Option<&FileVersion> {
        self.versions
            .iter()
            .find(|v| v.is_latest)
            .or_else(|| self.versions.first())
    }
}
