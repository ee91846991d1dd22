//! Private scratch area used to stage every file operation of a sync run.
//!
//! Layout inside the project root:
//!
//! ```text
//! .fieldsync/
//!   backup/    pristine copies of local files about to be replaced
//!   upload/    flushed copies of the files being uploaded
//!   download/  freshly downloaded files, not yet visible in the project
//! ```
//!
//! The whole tree is thrown away and recreated for every run.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use jwalk::WalkDir;

use crate::error::{Result, SyncError};
use crate::fs::local::{LocalFs, SIDE_FILE_SUFFIXES};
use crate::fs::types::FileRecord;

/// One of the three sub-areas of the staging tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Area {
    Backup,
    Upload,
    Download,
}

impl Area {
    pub fn dir_name(&self) -> &'static str {
        match self {
            Area::Backup => "backup",
            Area::Upload => "upload",
            Area::Download => "download",
        }
    }
}

/// Reject a control directory that is not a single plain directory name.
///
/// The staging tree lives at `project_root/control_dir` and is removed on
/// every run, so an empty name, `.`, `..`, a nested or an absolute path would
/// point the removal at the project itself or somewhere outside it.
pub fn check_control_dir(control_dir: &str) -> Result<()> {
    let mut components = Path::new(control_dir).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(SyncError::InvalidControlDir {
            value: control_dir.to_string(),
        }),
    }
}

#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    /// Discard any previous staging tree under `project_root/control_dir` and
    /// create an empty one.
    pub fn create(project_root: &Path, control_dir: &str) -> Result<Self> {
        check_control_dir(control_dir)?;
        let root = project_root.join(control_dir);

        if root.exists() {
            fs::remove_dir_all(&root).map_err(|e| SyncError::io(e, "removing staging directory", &root))?;
        }

        let staging = Self { root };
        for area in [Area::Backup, Area::Upload, Area::Download] {
            LocalFs::create_dir(&staging.dir(area))?;
        }

        tracing::debug!("Staging area ready at {}", staging.root.display());
        Ok(staging)
    }

    pub fn dir(&self, area: Area) -> PathBuf {
        self.root.join(area.dir_name())
    }

    /// Path of `record` inside `area`, mirroring its project-relative path.
    pub fn path_in(&self, area: Area, record: &FileRecord) -> PathBuf {
        self.dir(area).join(record.relative_path())
    }

    /// Flush the local file of `record` and copy it into `upload/`.
    pub fn stage_upload(&self, record: &FileRecord) -> Result<PathBuf> {
        let local = record.local_path.as_deref().ok_or_else(|| SyncError::InvalidRecord {
            name: record.name.clone(),
            reason: "cannot upload a file without a local copy".to_string(),
        })?;

        LocalFs::flush(local)?;
        let staged = self.path_in(Area::Upload, record);
        LocalFs::copy_file(local, &staged)?;
        Ok(staged)
    }

    /// Copy the current local version (and side files) of every record that
    /// has one into `backup/`. Returns the number of files backed up.
    pub fn backup<'a>(&self, records: impl IntoIterator<Item = &'a FileRecord>) -> Result<usize> {
        let mut count = 0;

        for record in records {
            let Some(local) = record.local_path.as_deref() else {
                continue;
            };
            if !local.is_file() {
                continue;
            }

            LocalFs::copy_with_side_files(local, &self.path_in(Area::Backup, record))?;
            count += 1;
        }

        tracing::debug!("Backed up {} files", count);
        Ok(count)
    }

    /// Copy every staged download to the destination `resolve` returns for
    /// its relative name.
    pub fn commit_downloads(&self, resolve: &dyn Fn(&str) -> PathBuf) -> Result<Vec<PathBuf>> {
        copy_tree(&self.dir(Area::Download), resolve)
    }

    /// Copy every backed up file back to the destination `resolve` returns
    /// for its relative name.
    pub fn restore_backup(&self, resolve: &dyn Fn(&str) -> PathBuf) -> Result<Vec<PathBuf>> {
        copy_tree(&self.dir(Area::Backup), resolve)
    }

    /// Relative names of every file currently staged in `area`, sorted.
    pub fn staged_names(&self, area: Area) -> Result<Vec<String>> {
        Ok(walk_files(&self.dir(area))?.into_iter().map(|(name, _)| name).collect())
    }
}

/// Every regular file below `dir` as (relative `/`-separated name, absolute path).
fn walk_files(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();

    for entry in WalkDir::new(dir)
        .sort(true)
        .skip_hidden(false)
        .parallelism(jwalk::Parallelism::Serial)
    {
        let entry = entry.map_err(|e| SyncError::io(io::Error::new(io::ErrorKind::Other, e.to_string()), "walking", dir))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let Ok(relative) = path.strip_prefix(dir) else {
            continue;
        };
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.push((name, path));
    }

    Ok(files)
}

/// Copy a staged tree into the project.
///
/// Side files travel with their primary: when a primary file is copied, a
/// staged `-shm`/`-wal` next to it is copied too, and a destination side file
/// with no staged counterpart is deleted. Side files staged without their
/// primary are copied as plain files.
fn copy_tree(source_dir: &Path, resolve: &dyn Fn(&str) -> PathBuf) -> Result<Vec<PathBuf>> {
    let files = walk_files(source_dir)?;
    let names: BTreeSet<&str> = files.iter().map(|(name, _)| name.as_str()).collect();
    let mut copied = Vec::new();

    for (name, source) in &files {
        let primary = LocalFs::primary_of_side_file(name);
        if let Some(primary) = primary {
            if names.contains(primary) {
                continue;
            }
        }

        let destination = resolve(name);
        LocalFs::copy_file(source, &destination)?;
        copied.push(destination.clone());

        if primary.is_some() {
            continue;
        }

        for suffix in SIDE_FILE_SUFFIXES {
            let staged_side = LocalFs::side_file(source, suffix);
            let destination_side = LocalFs::side_file(&destination, suffix);

            if staged_side.is_file() {
                LocalFs::copy_file(&staged_side, &destination_side)?;
                copied.push(destination_side);
            } else {
                LocalFs::delete_file(&destination_side)?;
            }
        }
    }

    Ok(copied)
}
