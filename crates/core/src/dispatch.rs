//! Request routing.
//!
//! [`Request`] is the closed set of operations a caller can ask for. The
//! dispatcher matches it exhaustively and hands each variant to the owning
//! component; filesystem and patch work runs on the blocking pool.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::atomic_patcher::PatchEngine;
use crate::backup::BackupStore;
use crate::config::EngineConfig;
use crate::errors::{JailError, JailResult};
use crate::file_ops::{FileOps, TreeEntry, DEFAULT_TREE_DEPTH};
use crate::path_security::PathJail;
use crate::session::SessionManager;

/// Turns a natural-language goal into a unified diff for one file.
#[async_trait]
pub trait DiffProvider: Send + Sync {
    async fn suggest_diff(
        &self,
        filename: &str,
        goal: &str,
        current_content: &str,
    ) -> anyhow::Result<String>;
}

fn root_path() -> String {
    ".".to_string()
}

fn default_depth() -> usize {
    DEFAULT_TREE_DEPTH
}

#[derive(Debug, Clone, Deserialize)]
pub struct TreeArgs {
    #[serde(default = "root_path", alias = "rel")]
    pub path: String,
    #[serde(default = "default_depth")]
    pub max_depth: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadArgs {
    #[serde(alias = "rel")]
    pub path: String,
    #[serde(default, alias = "start")]
    pub offset: u64,
    #[serde(default)]
    pub length: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WriteArgs {
    #[serde(alias = "rel")]
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathArgs {
    #[serde(alias = "rel", alias = "filename")]
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MoveArgs {
    pub src: String,
    pub dst: String,
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteArgs {
    #[serde(alias = "rel")]
    pub path: String,
    #[serde(default)]
    pub recursive: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplyArgs {
    #[serde(alias = "filename")]
    pub path: String,
    #[serde(alias = "diff_text")]
    pub diff: String,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SuggestArgs {
    #[serde(alias = "filename")]
    pub path: String,
    pub goal: String,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionArgs {
    pub session_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecArgs {
    pub session_id: String,
    pub command: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TermReadArgs {
    pub session_id: String,
    #[serde(default)]
    pub peek: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NoArgs {}

/// Every operation the engine accepts, as `{"kind": ..., "args": {...}}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", content = "args")]
pub enum Request {
    #[serde(rename = "fs.tree")]
    FsTree(TreeArgs),
    #[serde(rename = "fs.read")]
    FsRead(ReadArgs),
    #[serde(rename = "fs.write")]
    FsWrite(WriteArgs),
    #[serde(rename = "fs.create_dir")]
    FsCreateDir(PathArgs),
    #[serde(rename = "fs.move")]
    FsMove(MoveArgs),
    #[serde(rename = "fs.delete")]
    FsDelete(DeleteArgs),
    #[serde(rename = "edit.apply")]
    EditApply(ApplyArgs),
    #[serde(rename = "edit.suggest")]
    EditSuggest(SuggestArgs),
    #[serde(rename = "edit.backups")]
    EditBackups(PathArgs),
    #[serde(rename = "term.open")]
    TermOpen(SessionArgs),
    #[serde(rename = "term.exec")]
    TermExec(ExecArgs),
    #[serde(rename = "term.read")]
    TermRead(TermReadArgs),
    #[serde(rename = "term.close")]
    TermClose(SessionArgs),
    #[serde(rename = "term.list")]
    TermList(NoArgs),
}

impl Request {
    /// Build a request from its wire parts.
    pub fn from_parts(kind: &str, args: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::json!({ "kind": kind, "args": args }))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Request::FsTree(_) => "fs.tree",
            Request::FsRead(_) => "fs.read",
            Request::FsWrite(_) => "fs.write",
            Request::FsCreateDir(_) => "fs.create_dir",
            Request::FsMove(_) => "fs.move",
            Request::FsDelete(_) => "fs.delete",
            Request::EditApply(_) => "edit.apply",
            Request::EditSuggest(_) => "edit.suggest",
            Request::EditBackups(_) => "edit.backups",
            Request::TermOpen(_) => "term.open",
            Request::TermExec(_) => "term.exec",
            Request::TermRead(_) => "term.read",
            Request::TermClose(_) => "term.close",
            Request::TermList(_) => "term.list",
        }
    }
}

#[derive(Debug, Serialize)]
struct TreeResult {
    path: String,
    max_depth: usize,
    entries: Vec<TreeEntry>,
}

/// Routes [`Request`]s to the engine components.
pub struct Dispatcher {
    files: Arc<FileOps>,
    patches: Arc<PatchEngine>,
    sessions: Arc<SessionManager>,
    provider: Arc<dyn DiffProvider>,
}

impl Dispatcher {
    /// Wire up the engine for `config.project_root`.
    pub fn new(config: &EngineConfig, provider: Arc<dyn DiffProvider>) -> JailResult<Self> {
        let jail = PathJail::new(&config.project_root, &config.deny_patterns, &config.backup_dir)?
            .with_allow_patterns(&config.allow_patterns)?;
        let backups = BackupStore::new(jail.root(), &config.backup_dir);
        let sessions = SessionManager::new(jail.root().to_path_buf(), config);

        Ok(Self {
            files: Arc::new(FileOps::new(jail.clone(), backups.clone(), config.max_read_bytes)),
            patches: Arc::new(PatchEngine::new(jail, backups)),
            sessions: Arc::new(sessions),
            provider,
        })
    }

    pub fn root(&self) -> &std::path::Path {
        self.files.jail().root()
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Run one request; the success payload is JSON.
    pub async fn dispatch(&self, request: Request) -> JailResult<Value> {
        let kind = request.kind();
        debug!(kind, "dispatching request");

        let result = self.route(request).await;
        if let Err(err) = &result {
            if err.is_violation() {
                warn!(kind, error = %err, "request rejected");
            } else {
                debug!(kind, error_kind = err.kind(), error = %err, "request failed");
            }
        }
        result
    }

    async fn route(&self, request: Request) -> JailResult<Value> {
        match request {
            Request::FsTree(args) => {
                self.blocking(move |files| {
                    let listing = files.tree(&args.path, args.max_depth)?;
                    let entries = listing.entries().collect::<JailResult<Vec<_>>>()?;
                    to_json(TreeResult {
                        path: listing.base().display_relative(),
                        max_depth: listing.max_depth(),
                        entries,
                    })
                })
                .await
            }
            Request::FsRead(args) => {
                self.blocking(move |files| to_json(files.read(&args.path, args.offset, args.length)?))
                    .await
            }
            Request::FsWrite(args) => {
                self.blocking(move |files| to_json(files.write(&args.path, args.content.as_bytes())?))
                    .await
            }
            Request::FsCreateDir(args) => {
                self.blocking(move |files| to_json(files.create_dir(&args.path)?))
                    .await
            }
            Request::FsMove(args) => {
                self.blocking(move |files| {
                    to_json(files.move_path(&args.src, &args.dst, args.overwrite)?)
                })
                .await
            }
            Request::FsDelete(args) => {
                self.blocking(move |files| to_json(files.delete(&args.path, args.recursive)?))
                    .await
            }
            Request::EditApply(args) => {
                let patches = Arc::clone(&self.patches);
                tokio::task::spawn_blocking(move || {
                    to_json(patches.apply(&args.path, &args.diff, args.dry_run)?)
                })
                .await?
            }
            Request::EditSuggest(args) => self.suggest(args).await,
            Request::EditBackups(args) => {
                self.blocking(move |files| {
                    let target = files.jail().resolve(&args.path)?;
                    to_json(files.backups().list(&target)?)
                })
                .await
            }
            Request::TermOpen(args) => to_json(self.sessions.open(&args.session_id).await?),
            Request::TermExec(args) => {
                to_json(self.sessions.exec(&args.session_id, &args.command).await?)
            }
            Request::TermRead(args) => to_json(self.sessions.read(&args.session_id, args.peek).await?),
            Request::TermClose(args) => to_json(self.sessions.close(&args.session_id).await?),
            Request::TermList(NoArgs {}) => to_json(self.sessions.list().await),
        }
    }

    /// Read the file through the jail, ask the provider for a diff, apply it.
    async fn suggest(&self, args: SuggestArgs) -> JailResult<Value> {
        let path = args.path.clone();
        let current = self
            .blocking(move |files| files.read_text(&path))
            .await?
            .unwrap_or_default();

        let diff = self
            .provider
            .suggest_diff(&args.path, &args.goal, &current)
            .await
            .map_err(|e| JailError::ProviderFailure {
                message: format!("{e:#}"),
            })?;

        let patches = Arc::clone(&self.patches);
        let applied = {
            let diff = diff.clone();
            tokio::task::spawn_blocking(move || patches.apply(&args.path, &diff, args.dry_run))
                .await??
        };

        to_json(serde_json::json!({ "diff": diff, "applied": applied }))
    }

    async fn blocking<T, F>(&self, op: F) -> JailResult<T>
    where
        F: FnOnce(&FileOps) -> JailResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let files = Arc::clone(&self.files);
        tokio::task::spawn_blocking(move || op(&files)).await?
    }
}

fn to_json<T: Serialize>(value: T) -> JailResult<Value> {
    serde_json::to_value(value).map_err(|e| {
        JailError::io_failure(
            None,
            "encode response",
            std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_adjacently_tagged_requests() {
        let request: Request = serde_json::from_value(json!({
            "kind": "fs.move",
            "args": { "src": "a.txt", "dst": "b.txt" }
        }))
        .unwrap();
        match request {
            Request::FsMove(args) => {
                assert_eq!(args.src, "a.txt");
                assert!(!args.overwrite);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn accepts_legacy_argument_names() {
        let request = Request::from_parts(
            "edit.apply",
            json!({ "filename": "x.rs", "diff_text": "@@ -1 +1 @@\n-a\n+b\n" }),
        )
        .unwrap();
        assert_eq!(request.kind(), "edit.apply");

        let request = Request::from_parts("fs.read", json!({ "rel": "x.rs", "start": 4 })).unwrap();
        match request {
            Request::FsRead(args) => assert_eq!((args.path.as_str(), args.offset), ("x.rs", 4)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn defaults_fill_optional_args() {
        match Request::from_parts("fs.tree", json!({})).unwrap() {
            Request::FsTree(args) => {
                assert_eq!(args.path, ".");
                assert_eq!(args.max_depth, DEFAULT_TREE_DEPTH);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            Request::from_parts("term.list", json!({})).unwrap(),
            Request::TermList(_)
        ));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!(Request::from_parts("fs.chmod", json!({})).is_err());
        assert!(Request::from_parts("term.exec", json!({ "session_id": "s" })).is_err());
    }
}
