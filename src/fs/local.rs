use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{Result, SyncError};

/// Suffixes of the write-ahead-log side files that belong to a database file.
pub const SIDE_FILE_SUFFIXES: [&str; 2] = ["-shm", "-wal"];

pub struct LocalFs;

impl LocalFs {
    /// Copy a single file, creating the destination's parent directories.
    pub fn copy_file(from: &Path, to: &Path) -> Result<()> {
        if let Some(parent) = to.parent() {
            Self::create_dir(parent)?;
        }
        fs::copy(from, to).map_err(|e| SyncError::io(e, &format!("copying to {}", to.display()), from))?;
        Ok(())
    }

    /// Copy a file together with any side files present next to it.
    pub fn copy_with_side_files(from: &Path, to: &Path) -> Result<()> {
        Self::copy_file(from, to)?;
        for suffix in SIDE_FILE_SUFFIXES {
            let side = Self::side_file(from, suffix);
            if side.is_file() {
                Self::copy_file(&side, &Self::side_file(to, suffix))?;
            }
        }
        Ok(())
    }

    /// Delete a file. A file that is already gone is not an error.
    pub fn delete_file(path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::io(e, "deleting", path)),
        }
    }

    pub fn create_dir(path: &Path) -> Result<()> {
        fs::create_dir_all(path).map_err(|e| SyncError::io(e, "creating directory", path))
    }

    /// Force buffered writes of `path` to disk before it is read for staging.
    pub fn flush(path: &Path) -> Result<()> {
        let file = fs::File::open(path).map_err(|e| SyncError::io(e, "opening for flush", path))?;
        // Some platforms refuse to sync a read-only handle; the copy still
        // sees whatever the OS has cached.
        if let Err(e) = file.sync_all() {
            tracing::warn!("Could not flush {}: {}", path.display(), e);
        }
        Ok(())
    }

    /// `points.gpkg` + `-wal` -> `points.gpkg-wal`
    pub fn side_file(path: &Path, suffix: &str) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }

    /// Name of the primary file when `name` is a side file.
    pub fn primary_of_side_file(name: &str) -> Option<&str> {
        SIDE_FILE_SUFFIXES
            .iter()
            .find_map(|suffix| name.strip_suffix(suffix))
            .filter(|primary| !primary.is_empty())
    }
}
