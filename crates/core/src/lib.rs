//! # devjail-core
//!
//! Sandboxed operation engine: jailed filesystem access, all-or-nothing
//! unified diff application with backups, and persistent shell sessions.
//!
//! The [`Dispatcher`] is the single entry point used by the daemon; the
//! components are public so they can be embedded or tested on their own.

pub mod atomic_patcher;
pub mod backup;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod file_ops;
pub mod output_buffer;
pub mod patch_parser;
pub mod path_security;
pub mod session;

pub use atomic_patcher::{AppliedPatch, PatchEngine};
pub use backup::{Backup, BackupStore};
pub use config::{ConfigError, EngineConfig, LlmConfig, SessionConfig};
pub use dispatch::{DiffProvider, Dispatcher, Request};
pub use errors::{ErrorPayload, JailError, JailResult};
pub use file_ops::{EntryKind, FileOps, TreeEntry, TreeListing};
pub use patch_parser::{PatchHunk, PatchLine, PatchSet};
pub use path_security::{JailedPath, PathJail};
pub use session::{SessionManager, SessionOutput, SessionStatus};
