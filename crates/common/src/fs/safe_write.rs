use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::debug;
use uuid::Uuid;

/// New file content staged next to its destination, not yet visible there.
///
/// The content lives in a uniquely named temporary file in the same directory
/// as the target, so the final [`StagedWrite::commit`] is a single `rename`
/// on one filesystem. Dropping an uncommitted stage removes the temporary
/// file; the destination is never touched until `commit`.
#[derive(Debug)]
pub struct StagedWrite {
    temp_path: PathBuf,
    target: PathBuf,
    committed: bool,
}

impl StagedWrite {
    /// Write `content` to a temporary sibling of `target` and fsync it.
    ///
    /// Missing parent directories of `target` are created. When `target`
    /// already exists its permissions are copied onto the staged file.
    pub fn stage(target: &Path, content: &[u8]) -> io::Result<Self> {
        let parent = target
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("'{}' has no parent directory", target.display()),
                )
            })?;
        let file_name = target.file_name().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("'{}' has no file name", target.display()),
            )
        })?;

        if !parent.exists() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = parent.join(format!(
            ".{}.{}.tmp",
            file_name.to_string_lossy(),
            Uuid::new_v4().simple()
        ));

        // From here on the guard owns the temp file and cleans it up on error.
        let staged = Self {
            temp_path,
            target: target.to_path_buf(),
            committed: false,
        };

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&staged.temp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
        drop(file);

        if let Ok(metadata) = fs::metadata(target) {
            fs::set_permissions(&staged.temp_path, metadata.permissions())?;
        }

        debug!(
            target = %staged.target.display(),
            temp = %staged.temp_path.display(),
            bytes = content.len(),
            "staged atomic write"
        );

        Ok(staged)
    }

    /// Path of the staged temporary file.
    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Atomically replace the target with the staged content.
    pub fn commit(mut self) -> io::Result<()> {
        fs::rename(&self.temp_path, &self.target)?;
        self.committed = true;
        sync_parent_dir(&self.target);
        Ok(())
    }
}

impl Drop for StagedWrite {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.temp_path);
        }
    }
}

/// Replace `target` with `content` so readers see either the old or the new
/// bytes, never a truncated file.
pub fn atomic_write(target: &Path, content: &[u8]) -> io::Result<()> {
    StagedWrite::stage(target, content)?.commit()
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) {}
