//! Pre-mutation snapshots.
//!
//! Backups live in one flat directory under the project root, one file per
//! snapshot, named `<file name>.<UTC timestamp>.<digest>.bak` where the digest
//! is the first 8 hex chars of `sha256(relative path)`. The directory listing
//! is the only index.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::errors::{JailError, JailResult};
use crate::path_security::JailedPath;

const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S-%6f";
const BACKUP_SUFFIX: &str = ".bak";

/// Immutable snapshot of a file taken before it was changed.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Backup {
    /// Path of the snapshotted file, relative to the project root
    pub original: PathBuf,
    pub created_at: DateTime<Utc>,
    /// Absolute location of the backup file
    pub location: PathBuf,
    pub size: u64,
}

impl Backup {
    pub fn contents(&self) -> JailResult<Vec<u8>> {
        fs::read(&self.location)
            .map_err(|e| JailError::io(Some(self.location.clone()), "read backup", e))
    }
}

/// Append-only store of [`Backup`]s.
#[derive(Debug, Clone)]
pub struct BackupStore {
    dir: PathBuf,
}

impl BackupStore {
    /// `root` must be the jail's canonical root; `backup_dir` is relative to it.
    pub fn new(root: &Path, backup_dir: &Path) -> Self {
        Self {
            dir: root.join(backup_dir),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Copy the current bytes of `target` into a new backup file.
    ///
    /// Returns `None` when there is nothing to back up: the file does not
    /// exist yet, or it is a directory.
    pub fn snapshot(&self, target: &JailedPath) -> JailResult<Option<Backup>> {
        let metadata = match fs::metadata(target.absolute()) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(JailError::io(
                    Some(target.relative().to_path_buf()),
                    "stat file for backup",
                    e,
                ))
            }
        };
        if metadata.is_dir() {
            return Ok(None);
        }

        let content = fs::read(target.absolute()).map_err(|e| {
            JailError::io_failure(target.relative().to_path_buf(), "read file for backup", e)
        })?;

        fs::create_dir_all(&self.dir)
            .map_err(|e| JailError::io(Some(self.dir.clone()), "create backup directory", e))?;

        let created_at = Utc::now();
        let stem = format!(
            "{}.{}.{}",
            file_name_of(target),
            created_at.format(TIMESTAMP_FORMAT),
            path_digest(target.relative())
        );

        let (location, mut file) = self.create_unique(&stem)?;
        file.write_all(&content)
            .and_then(|_| file.sync_all())
            .map_err(|e| JailError::io(Some(location.clone()), "write backup", e))?;

        info!(
            path = %target.display_relative(),
            backup = %location.display(),
            bytes = content.len(),
            "backup created"
        );

        Ok(Some(Backup {
            original: target.relative().to_path_buf(),
            created_at,
            location,
            size: content.len() as u64,
        }))
    }

    /// Backups of `target`, oldest first.
    pub fn list(&self, target: &JailedPath) -> JailResult<Vec<Backup>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(JailError::io(Some(self.dir.clone()), "list backups", e)),
        };

        let prefix = format!("{}.", file_name_of(target));
        let digest = path_digest(target.relative());
        let mut found = Vec::new();

        for entry in entries {
            let entry = entry.map_err(|e| JailError::io(Some(self.dir.clone()), "list backups", e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some((created_at, seq)) = parse_backup_name(&name, &prefix, &digest) else {
                continue;
            };
            let size = entry
                .metadata()
                .map_err(|e| JailError::io(Some(entry.path()), "stat backup", e))?
                .len();
            found.push((
                seq,
                Backup {
                    original: target.relative().to_path_buf(),
                    created_at,
                    location: entry.path(),
                    size,
                },
            ));
        }

        found.sort_by(|a, b| (a.1.created_at, a.0).cmp(&(b.1.created_at, b.0)));
        debug!(path = %target.display_relative(), count = found.len(), "backups listed");
        Ok(found.into_iter().map(|(_, backup)| backup).collect())
    }

    /// Open a fresh backup file, adding `.N` before the suffix on collision.
    fn create_unique(&self, stem: &str) -> JailResult<(PathBuf, fs::File)> {
        let mut seq = 0u32;
        loop {
            let name = if seq == 0 {
                format!("{stem}{BACKUP_SUFFIX}")
            } else {
                format!("{stem}.{seq}{BACKUP_SUFFIX}")
            };
            let location = self.dir.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&location) {
                Ok(file) => return Ok((location, file)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => seq += 1,
                Err(e) => return Err(JailError::io_failure(location, "create backup", e)),
            }
        }
    }
}

/// Parse `<prefix><timestamp>.<digest>[.<seq>].bak`.
fn parse_backup_name(name: &str, prefix: &str, digest: &str) -> Option<(DateTime<Utc>, u32)> {
    let rest = name.strip_prefix(prefix)?.strip_suffix(BACKUP_SUFFIX)?;
    let mut parts = rest.split('.');
    let timestamp = parts.next()?;
    if parts.next()? != digest {
        return None;
    }
    let seq = match parts.next() {
        Some(seq) => seq.parse().ok()?,
        None => 0,
    };
    if parts.next().is_some() {
        return None;
    }
    let naive = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT).ok()?;
    Some((naive.and_utc(), seq))
}

fn path_digest(relative: &Path) -> String {
    let slashed = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    let digest = Sha256::digest(slashed.as_bytes());
    hex::encode(&digest[..4])
}

fn file_name_of(target: &JailedPath) -> String {
    target
        .relative()
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string())
}
