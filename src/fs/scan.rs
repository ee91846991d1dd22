//! Build file records for a project from its working directory and the
//! remote listing.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use jwalk::WalkDir;

use crate::api::RemoteFile;
use crate::error::{Result, SyncError};
use crate::fs::staging::check_control_dir;
use crate::fs::types::{Checkout, FileRecord};

/// Walk `project_root`, skipping the control directory, and merge what is
/// found with `remote` into records sorted by name.
pub fn scan_project(project_root: &Path, control_dir: &str, remote: &[RemoteFile]) -> Result<Vec<FileRecord>> {
    check_control_dir(control_dir)?;
    let mut local: BTreeMap<String, (PathBuf, u64)> = BTreeMap::new();

    let walker = WalkDir::new(project_root)
        .sort(true)
        .skip_hidden(false)
        .parallelism(jwalk::Parallelism::Serial);

    for entry in walker {
        let entry = entry.map_err(|e| {
            SyncError::io(io::Error::new(io::ErrorKind::Other, e.to_string()), "scanning", project_root)
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let Ok(relative) = path.strip_prefix(project_root) else {
            continue;
        };
        if relative.starts_with(control_dir) {
            continue;
        }
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);

        local.insert(name, (path, size));
    }

    let mut records: BTreeMap<String, FileRecord> = BTreeMap::new();

    for file in remote {
        let record = match local.remove(&file.name) {
            Some((path, size)) => FileRecord::both(&file.name, path, size, file.size),
            None => FileRecord::cloud(&file.name, file.size),
        };
        records.insert(file.name.clone(), record);
    }

    for (name, (path, size)) in local {
        records.insert(name.clone(), FileRecord::local(name, path, size));
    }

    let records: Vec<FileRecord> = records.into_values().collect();
    tracing::debug!(
        "Scanned {}: {} local only, {} cloud only, {} both",
        project_root.display(),
        count(&records, Checkout::LOCAL),
        count(&records, Checkout::CLOUD),
        count(&records, Checkout::BOTH),
    );

    Ok(records)
}

fn count(records: &[FileRecord], checkout: Checkout) -> usize {
    records.iter().filter(|r| r.checkout == checkout).count()
}
