//! # devjail File Operations
//!
//! Jailed filesystem operations. Every entry point resolves its paths through
//! [`PathJail`] first, so containment and deny rules are enforced before any
//! byte is read or written. Mutations of existing files are preceded by a
//! [`BackupStore`] snapshot and use the shared temp-write-and-rename helper.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use devjail_common::fs::atomic_write;
use serde::Serialize;
use tracing::{debug, info};
use walkdir::{DirEntry, WalkDir};

use crate::backup::{Backup, BackupStore};
use crate::errors::{JailError, JailResult};
use crate::path_security::{JailedPath, PathJail};

/// Default depth of `fs.tree`.
pub const DEFAULT_TREE_DEPTH: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

/// One entry of a [`TreeListing`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeEntry {
    /// Path relative to the project root, `/`-separated
    pub path: String,
    pub kind: EntryKind,
    /// Size in bytes for regular files
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Lazy, restartable listing of a directory subtree.
///
/// Nothing is read from disk until [`TreeListing::entries`] is iterated, and
/// every call starts a fresh walk.
#[derive(Debug, Clone)]
pub struct TreeListing {
    jail: PathJail,
    base: JailedPath,
    max_depth: usize,
}

impl TreeListing {
    pub fn base(&self) -> &JailedPath {
        &self.base
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Walk the subtree in file-name order, without following symlinks.
    /// Denied entries are pruned, so nothing below them is visited. Entries
    /// outside the allow list are left out but still descended into.
    pub fn entries(&self) -> impl Iterator<Item = JailResult<TreeEntry>> + '_ {
        let root = self.jail.root();
        WalkDir::new(self.base.absolute())
            .min_depth(1)
            .max_depth(self.max_depth)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| match entry.path().strip_prefix(root) {
                Ok(relative) => !self.jail.is_denied(relative),
                Err(_) => false,
            })
            .filter_map(move |entry| {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        let path = err.path().map(Path::to_path_buf);
                        return Some(Err(JailError::io_failure(
                            path,
                            "walk directory",
                            io::Error::from(err),
                        )));
                    }
                };
                let allowed = entry
                    .path()
                    .strip_prefix(root)
                    .map_or(false, |relative| self.jail.is_allowed(relative));
                allowed.then(|| Ok(tree_entry(root, &entry)))
            })
    }
}

fn tree_entry(root: &Path, entry: &DirEntry) -> TreeEntry {
    let file_type = entry.file_type();
    let kind = if file_type.is_symlink() {
        EntryKind::Symlink
    } else if file_type.is_dir() {
        EntryKind::Dir
    } else {
        EntryKind::File
    };
    let size = match kind {
        EntryKind::File => entry.metadata().ok().map(|m| m.len()),
        _ => None,
    };
    let path = entry
        .path()
        .strip_prefix(root)
        .unwrap_or_else(|_| entry.path())
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");

    TreeEntry { path, kind, size }
}

/// How `content` of a [`FileContent`] is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentMode {
    /// UTF-8 text
    Text,
    /// Lowercase hex of raw bytes
    Bytes,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileContent {
    pub path: String,
    pub mode: ContentMode,
    pub content: String,
    /// Total size of the file on disk
    pub size: u64,
    pub offset: u64,
    /// True when bytes after the returned window remain
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WriteOutcome {
    pub path: String,
    pub bytes_written: usize,
    pub created: bool,
    pub backup: Option<Backup>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DirOutcome {
    pub path: String,
    pub created: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MoveOutcome {
    pub from: String,
    pub to: String,
    pub overwritten: bool,
    pub backups: Vec<Backup>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteOutcome {
    pub path: String,
    pub kind: EntryKind,
    pub removed_files: usize,
    pub backups: Vec<Backup>,
}

/// Jailed file operations over one project root.
#[derive(Debug, Clone)]
pub struct FileOps {
    jail: PathJail,
    backups: BackupStore,
    max_read_bytes: u64,
}

impl FileOps {
    pub fn new(jail: PathJail, backups: BackupStore, max_read_bytes: u64) -> Self {
        Self {
            jail,
            backups,
            max_read_bytes,
        }
    }

    pub fn jail(&self) -> &PathJail {
        &self.jail
    }

    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    /// Listing of `rel` down to `max_depth` levels (at least 1).
    pub fn tree(&self, rel: &str, max_depth: usize) -> JailResult<TreeListing> {
        let base = self.jail.resolve(rel)?;
        let metadata = fs::metadata(base.absolute())
            .map_err(|e| JailError::io(base.relative().to_path_buf(), "list directory", e))?;
        if !metadata.is_dir() {
            return Err(JailError::NotFound {
                path: base.relative().to_path_buf(),
            });
        }

        Ok(TreeListing {
            jail: self.jail.clone(),
            base,
            max_depth: max_depth.max(1),
        })
    }

    /// Read up to `length` bytes (capped at `max_read_bytes`) from `offset`.
    pub fn read(&self, rel: &str, offset: u64, length: Option<u64>) -> JailResult<FileContent> {
        let target = self.jail.resolve(rel)?;
        let relative = target.relative().to_path_buf();

        let metadata = fs::metadata(target.absolute())
            .map_err(|e| JailError::io(relative.clone(), "read file", e))?;
        if !metadata.is_file() {
            return Err(JailError::NotFound { path: relative });
        }
        let size = metadata.len();

        let limit = length.map_or(self.max_read_bytes, |l| l.min(self.max_read_bytes));
        let mut file = File::open(target.absolute())
            .map_err(|e| JailError::io(relative.clone(), "open file", e))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| JailError::io_failure(relative.clone(), "seek file", e))?;

        let mut data = Vec::new();
        file.take(limit)
            .read_to_end(&mut data)
            .map_err(|e| JailError::io_failure(relative.clone(), "read file", e))?;

        let end = offset.saturating_add(data.len() as u64);
        let truncated = end < size;
        let (mode, content) = encode_content(data, truncated);

        debug!(path = %target.display_relative(), offset, bytes = content.len(), "file read");

        Ok(FileContent {
            path: target.display_relative(),
            mode,
            content,
            size,
            offset,
            truncated,
        })
    }

    /// Whole file as UTF-8, or `None` when it does not exist yet.
    pub fn read_text(&self, rel: &str) -> JailResult<Option<String>> {
        let target = self.jail.resolve(rel)?;
        let relative = target.relative().to_path_buf();
        match fs::read(target.absolute()) {
            Ok(bytes) => String::from_utf8(bytes).map(Some).map_err(|_| {
                JailError::io_failure(
                    relative,
                    "read file",
                    io::Error::new(io::ErrorKind::InvalidData, "file is not valid UTF-8"),
                )
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(JailError::io_failure(relative, "read file", e)),
        }
    }

    /// Replace (or create) `rel` with `content`.
    pub fn write(&self, rel: &str, content: &[u8]) -> JailResult<WriteOutcome> {
        let target = self.jail.resolve(rel)?;
        if target.absolute().is_dir() {
            return Err(is_a_directory(&target, "write file"));
        }

        let backup = self.backups.snapshot(&target)?;
        let created = !target.absolute().exists();

        atomic_write(target.absolute(), content)
            .map_err(|e| JailError::io_failure(target.relative().to_path_buf(), "write file", e))?;

        info!(path = %target.display_relative(), bytes = content.len(), created, "file written");

        Ok(WriteOutcome {
            path: target.display_relative(),
            bytes_written: content.len(),
            created,
            backup,
        })
    }

    /// Create `rel` and any missing parents; an existing directory is fine.
    pub fn create_dir(&self, rel: &str) -> JailResult<DirOutcome> {
        let target = self.jail.resolve(rel)?;

        match fs::metadata(target.absolute()) {
            Ok(metadata) if metadata.is_dir() => {
                return Ok(DirOutcome {
                    path: target.display_relative(),
                    created: false,
                })
            }
            Ok(_) => {
                return Err(JailError::AlreadyExists {
                    path: target.relative().to_path_buf(),
                })
            }
            Err(_) => {}
        }

        fs::create_dir_all(target.absolute()).map_err(|e| {
            JailError::io_failure(target.relative().to_path_buf(), "create directory", e)
        })?;

        info!(path = %target.display_relative(), "directory created");
        Ok(DirOutcome {
            path: target.display_relative(),
            created: true,
        })
    }

    /// Rename `src` to `dst`. An existing `dst` is only replaced when
    /// `overwrite` is set, and is snapshotted first.
    ///
    /// Symlinks are moved as links; the file they point to is left alone.
    pub fn move_path(&self, src: &str, dst: &str, overwrite: bool) -> JailResult<MoveOutcome> {
        let from = self.jail.resolve(src)?;
        let to = self.jail.resolve(dst)?;

        if from.is_root() || to.is_root() {
            return Err(JailError::escape(
                if from.is_root() { src } else { dst },
                "the project root cannot be moved or replaced",
            ));
        }

        if fs::symlink_metadata(from.entry()).is_err() {
            return Err(JailError::NotFound {
                path: from.entry_relative().to_path_buf(),
            });
        }

        let overwritten = fs::symlink_metadata(to.entry()).is_ok();
        if overwritten && !overwrite {
            return Err(JailError::AlreadyExists {
                path: to.entry_relative().to_path_buf(),
            });
        }

        let mut backups = Vec::new();
        if !from.is_symlink() {
            backups.extend(self.backups.snapshot(&from)?);
        }
        if overwritten && !to.is_symlink() {
            backups.extend(self.backups.snapshot(&to)?);
        }

        if let Some(parent) = to.entry().parent() {
            fs::create_dir_all(parent).map_err(|e| {
                JailError::io_failure(to.entry_relative().to_path_buf(), "create parent directories", e)
            })?;
        }

        fs::rename(from.entry(), to.entry()).map_err(|e| {
            JailError::io_failure(from.entry_relative().to_path_buf(), "move", e)
        })?;

        info!(
            from = %from.display_relative(),
            to = %to.display_relative(),
            overwritten,
            "path moved"
        );

        Ok(MoveOutcome {
            from: from.display_relative(),
            to: to.display_relative(),
            overwritten,
            backups,
        })
    }

    /// Remove a file, or a directory tree when `recursive` is set.
    ///
    /// Every removed file is snapshotted first. A directory holding anything
    /// the allow or deny rules protect is refused as a whole. A symlink is
    /// unlinked without touching its target.
    pub fn delete(&self, rel: &str, recursive: bool) -> JailResult<DeleteOutcome> {
        let target = self.jail.resolve(rel)?;
        if target.is_root() {
            return Err(JailError::escape(rel, "the project root cannot be deleted"));
        }

        let metadata = fs::symlink_metadata(target.entry())
            .map_err(|e| JailError::io(target.entry_relative().to_path_buf(), "delete", e))?;

        if !metadata.is_dir() {
            let is_link = metadata.file_type().is_symlink();
            let backups: Vec<Backup> = if is_link {
                Vec::new()
            } else {
                self.backups.snapshot(&target)?.into_iter().collect()
            };
            fs::remove_file(target.entry()).map_err(|e| {
                JailError::io_failure(target.entry_relative().to_path_buf(), "delete file", e)
            })?;
            info!(path = %target.display_relative(), symlink = is_link, "file deleted");
            return Ok(DeleteOutcome {
                path: target.display_relative(),
                kind: if is_link { EntryKind::Symlink } else { EntryKind::File },
                removed_files: 1,
                backups,
            });
        }

        if !recursive {
            return Err(is_a_directory(&target, "delete (set recursive to remove directories)"));
        }

        let files = self.collect_files_for_delete(&target)?;
        let mut backups = Vec::with_capacity(files.len());
        for file in &files {
            backups.extend(self.backups.snapshot(file)?);
        }

        fs::remove_dir_all(target.entry()).map_err(|e| {
            JailError::io_failure(target.entry_relative().to_path_buf(), "delete directory", e)
        })?;

        info!(path = %target.display_relative(), files = files.len(), "directory deleted");
        Ok(DeleteOutcome {
            path: target.display_relative(),
            kind: EntryKind::Dir,
            removed_files: files.len(),
            backups,
        })
    }

    /// Files below `dir`, refusing the delete if any descendant is denied or
    /// outside the allow list.
    fn collect_files_for_delete(&self, dir: &JailedPath) -> JailResult<Vec<JailedPath>> {
        let root = self.jail.root();
        let mut files = Vec::new();

        for entry in WalkDir::new(dir.entry()).min_depth(1).follow_links(false) {
            let entry = entry.map_err(|err| {
                let path = err.path().map(Path::to_path_buf);
                JailError::io_failure(path, "walk directory", io::Error::from(err))
            })?;
            let relative: PathBuf = match entry.path().strip_prefix(root) {
                Ok(relative) => relative.to_path_buf(),
                Err(_) => continue,
            };
            if !self.jail.permits(&relative) {
                return Err(JailError::DeniedPath {
                    path: relative,
                    rule: "protected entry inside directory".to_string(),
                });
            }
            if entry.file_type().is_file() {
                let rel = relative.to_string_lossy().into_owned();
                files.push(self.jail.resolve(&rel)?);
            }
        }

        Ok(files)
    }
}

/// Valid UTF-8 comes back as text; an incomplete character cut off by the
/// read window is dropped rather than forcing bytes mode.
fn encode_content(data: Vec<u8>, truncated: bool) -> (ContentMode, String) {
    match String::from_utf8(data) {
        Ok(text) => (ContentMode::Text, text),
        Err(err) => {
            let utf8 = err.utf8_error();
            let mut data = err.into_bytes();
            if truncated && utf8.error_len().is_none() && utf8.valid_up_to() > 0 {
                data.truncate(utf8.valid_up_to());
                return match String::from_utf8(data) {
                    Ok(text) => (ContentMode::Text, text),
                    Err(err) => (ContentMode::Bytes, hex::encode(err.into_bytes())),
                };
            }
            (ContentMode::Bytes, hex::encode(data))
        }
    }
}

fn is_a_directory(target: &JailedPath, operation: &str) -> JailError {
    JailError::io_failure(
        target.relative().to_path_buf(),
        operation,
        io::Error::new(io::ErrorKind::Other, "is a directory"),
    )
}
