use std::path::{Path, PathBuf};

use crate::error::{Result, SyncError};

/// Where a project file currently exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Checkout {
    pub local: bool,
    pub cloud: bool,
}

impl Checkout {
    pub const LOCAL: Checkout = Checkout { local: true, cloud: false };
    pub const CLOUD: Checkout = Checkout { local: false, cloud: true };
    pub const BOTH: Checkout = Checkout { local: true, cloud: true };

    pub fn is_local_only(&self) -> bool {
        self.local && !self.cloud
    }

    pub fn is_cloud_only(&self) -> bool {
        self.cloud && !self.local
    }
}

/// One file taking part in a sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Path relative to the project root, `/`-separated.
    pub name: String,
    /// Absolute path of the local copy, if any.
    pub local_path: Option<PathBuf>,
    pub local_size: Option<u64>,
    pub remote_size: Option<u64>,
    pub checkout: Checkout,
}

impl FileRecord {
    /// A file that only exists in the working directory.
    pub fn local(name: impl Into<String>, local_path: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            name: name.into(),
            local_path: Some(local_path.into()),
            local_size: Some(size),
            remote_size: None,
            checkout: Checkout::LOCAL,
        }
    }

    /// A file that only exists in the remote store.
    pub fn cloud(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            local_path: None,
            local_size: None,
            remote_size: Some(size),
            checkout: Checkout::CLOUD,
        }
    }

    /// A file present on both sides.
    pub fn both(
        name: impl Into<String>,
        local_path: impl Into<PathBuf>,
        local_size: u64,
        remote_size: u64,
    ) -> Self {
        Self {
            name: name.into(),
            local_path: Some(local_path.into()),
            local_size: Some(local_size),
            remote_size: Some(remote_size),
            checkout: Checkout::BOTH,
        }
    }

    /// Relative path as a platform path.
    pub fn relative_path(&self) -> PathBuf {
        self.name.split('/').filter(|part| !part.is_empty()).collect()
    }

    /// Where the file lives (or will live) inside `project_root`.
    pub fn destination(&self, project_root: &Path) -> PathBuf {
        match &self.local_path {
            Some(path) => path.clone(),
            None => project_root.join(self.relative_path()),
        }
    }

    /// Check the record invariants against the project it belongs to.
    /// Names inside `control_dir` belong to the staging area, not the project.
    pub fn validate(&self, project_id: &str, control_dir: &str) -> Result<()> {
        let relative = self.relative_path();
        if relative.as_os_str().is_empty() {
            return Err(self.invalid("empty file name"));
        }
        if relative
            .components()
            .any(|c| !matches!(c, std::path::Component::Normal(_)))
        {
            return Err(self.invalid("name must be a relative path inside the project"));
        }
        if relative.starts_with(control_dir) {
            return Err(self.invalid("name is inside the control directory"));
        }
        if self.checkout.local && self.local_path.is_none() {
            return Err(self.invalid("checked out locally but has no local path"));
        }
        if self.checkout.cloud && project_id.is_empty() {
            return Err(self.invalid("checked out in the cloud but the project has no id"));
        }
        Ok(())
    }

    fn invalid(&self, reason: &str) -> SyncError {
        SyncError::InvalidRecord {
            name: self.name.clone(),
            reason: reason.to_string(),
        }
    }
}
