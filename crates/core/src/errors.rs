//! # devjail Error Types
//!
//! Every engine operation returns [`JailResult`]. Each [`JailError`] variant
//! maps to one stable taxonomy kind (see [`JailError::kind`]) and carries the
//! context a caller needs to react: the offending path, the failing hunk, or
//! the session id.
//!
//! ## Error Categories
//!
//! - **Containment**: `DeniedPath`, `PathEscape`
//! - **Filesystem state**: `NotFound`, `AlreadyExists`, `IOFailure`
//! - **Patching**: `MalformedPatch`, `PatchConflict`
//! - **Sessions**: `DuplicateSession`, `UnknownSession`, `SessionExited`,
//!   `ShellDisabled`
//! - **Collaborators**: `ProviderFailure`

use std::io;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Result type for all engine operations.
pub type JailResult<T> = Result<T, JailError>;

/// Failure modes of the sandboxed operation engine.
#[derive(Debug, Error)]
pub enum JailError {
    /// DeniedPath - the path matches a configured deny rule.
    ///
    /// Raised before any filesystem access, regardless of operation kind.
    #[error("access denied to '{path}' (matches deny rule '{rule}')")]
    DeniedPath {
        /// Path relative to the project root
        path: PathBuf,
        /// Deny pattern that matched
        rule: String,
    },

    /// PathEscape - the path does not stay inside the project root.
    ///
    /// Covers absolute paths, `..` climbing above the root, symlinks whose
    /// target leaves the root, and paths that are not valid at all.
    #[error("path '{path}' escapes the project root: {reason}")]
    PathEscape {
        /// Path as supplied by the caller
        path: String,
        /// Why the path was rejected
        reason: String,
    },

    /// NotFound - the target file or directory does not exist.
    #[error("'{path}' not found")]
    NotFound { path: PathBuf },

    /// AlreadyExists - the destination is already occupied.
    #[error("'{path}' already exists")]
    AlreadyExists { path: PathBuf },

    /// DuplicateSession - a live session already uses this id.
    #[error("terminal session '{session_id}' is already open")]
    DuplicateSession { session_id: String },

    /// UnknownSession - no live session has this id.
    #[error("terminal session '{session_id}' is not open")]
    UnknownSession { session_id: String },

    /// SessionExited - the shell behind the session has terminated.
    #[error("terminal session '{session_id}' has exited (exit code {exit_code:?})")]
    SessionExited {
        session_id: String,
        exit_code: Option<i32>,
    },

    /// ShellDisabled - shell sessions are turned off by configuration.
    #[error("shell sessions are disabled by configuration")]
    ShellDisabled,

    /// MalformedPatch - the diff text is not a structurally valid unified diff.
    #[error("malformed patch: {reason}")]
    MalformedPatch {
        /// Human-readable explanation
        reason: String,
        /// 1-based line of the diff where parsing failed (if applicable)
        line_number: Option<usize>,
    },

    /// PatchConflict - a hunk's expected lines do not match the file.
    ///
    /// Only the first failing hunk is reported; callers are expected to
    /// request a fresh diff against the current content.
    #[error("patch conflict in hunk #{hunk} at line {line} of '{path}'")]
    PatchConflict {
        path: PathBuf,
        /// 1-based hunk index within the patch
        hunk: usize,
        /// 1-based line of the target file where matching failed
        line: usize,
        /// Line the hunk expected
        expected: String,
        /// Line actually present (`None` past end of file)
        found: Option<String>,
    },

    /// ProviderFailure - the diff provider behind `edit.suggest` failed.
    #[error("diff provider failed: {message}")]
    ProviderFailure { message: String },

    /// IOFailure - an underlying I/O operation failed.
    #[error("I/O error in {operation}: {source}")]
    Io {
        /// Operation that was being performed
        operation: String,
        /// Path involved in the operation (if applicable)
        path: Option<PathBuf>,
        #[source]
        source: io::Error,
    },
}

impl JailError {
    /// Build an I/O error, folding `NotFound`/`AlreadyExists` kinds into the
    /// dedicated variants when a path is known.
    pub fn io<P, S>(path: P, operation: S, source: io::Error) -> Self
    where
        P: Into<Option<PathBuf>>,
        S: Into<String>,
    {
        let path = path.into();
        match (source.kind(), path) {
            (io::ErrorKind::NotFound, Some(path)) => JailError::NotFound { path },
            (io::ErrorKind::AlreadyExists, Some(path)) => JailError::AlreadyExists { path },
            (_, path) => JailError::Io {
                operation: operation.into(),
                path,
                source,
            },
        }
    }

    /// Build an `IOFailure` without folding the io kind, for failures on a
    /// path already known to exist.
    pub fn io_failure<P, S>(path: P, operation: S, source: io::Error) -> Self
    where
        P: Into<Option<PathBuf>>,
        S: Into<String>,
    {
        JailError::Io {
            operation: operation.into(),
            path: path.into(),
            source,
        }
    }

    pub fn malformed<R: Into<String>>(reason: R, line_number: Option<usize>) -> Self {
        JailError::MalformedPatch {
            reason: reason.into(),
            line_number,
        }
    }

    pub fn escape<P: Into<String>, R: Into<String>>(path: P, reason: R) -> Self {
        JailError::PathEscape {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Stable taxonomy kind reported to callers.
    pub fn kind(&self) -> &'static str {
        match self {
            JailError::DeniedPath { .. } => "DeniedPath",
            JailError::PathEscape { .. } => "PathEscape",
            JailError::NotFound { .. } => "NotFound",
            JailError::AlreadyExists { .. } => "AlreadyExists",
            JailError::DuplicateSession { .. } => "DuplicateSession",
            JailError::UnknownSession { .. } => "UnknownSession",
            JailError::SessionExited { .. } => "SessionExited",
            JailError::ShellDisabled => "ShellDisabled",
            JailError::MalformedPatch { .. } => "MalformedPatch",
            JailError::PatchConflict { .. } => "PatchConflict",
            JailError::ProviderFailure { .. } => "ProviderFailure",
            JailError::Io { .. } => "IOFailure",
        }
    }

    /// Containment violations are the ones worth a warning in the logs.
    pub fn is_violation(&self) -> bool {
        matches!(
            self,
            JailError::DeniedPath { .. } | JailError::PathEscape { .. }
        )
    }

    /// Structured payload sent back to the dispatcher's caller.
    pub fn to_payload(&self) -> ErrorPayload {
        let detail = match self {
            JailError::PatchConflict {
                hunk,
                line,
                expected,
                found,
                ..
            } => Some(serde_json::json!({
                "hunk": hunk,
                "line": line,
                "expected": expected,
                "found": found,
            })),
            JailError::MalformedPatch {
                line_number: Some(line),
                ..
            } => Some(serde_json::json!({ "line": line })),
            _ => None,
        };

        ErrorPayload {
            kind: self.kind(),
            message: self.to_string(),
            detail,
        }
    }
}

/// Wire form of a [`JailError`].
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub kind: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl From<tokio::task::JoinError> for JailError {
    fn from(err: tokio::task::JoinError) -> Self {
        JailError::Io {
            operation: "blocking task".to_string(),
            path: None,
            source: io::Error::new(io::ErrorKind::Other, err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_helper_folds_not_found_with_path() {
        let err = JailError::io(
            Some(PathBuf::from("src/lib.rs")),
            "read file",
            io::Error::new(io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.kind(), "NotFound");

        let err = JailError::io(None, "read file", io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert_eq!(err.kind(), "IOFailure");
    }

    #[test]
    fn conflict_payload_carries_hunk_detail() {
        let err = JailError::PatchConflict {
            path: PathBuf::from("a.txt"),
            hunk: 2,
            line: 14,
            expected: "let x = 1;".to_string(),
            found: Some("let x = 2;".to_string()),
        };
        let payload = serde_json::to_value(err.to_payload()).unwrap();
        assert_eq!(payload["kind"], "PatchConflict");
        assert_eq!(payload["detail"]["hunk"], 2);
        assert_eq!(payload["detail"]["found"], "let x = 2;");
    }
}
