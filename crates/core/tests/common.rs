//! Common helpers for devjail-core integration tests

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use devjail_core::{DiffProvider, Dispatcher, EngineConfig, FileOps, PatchEngine};
use devjail_core::{BackupStore, PathJail};

pub struct Tmp {
    pub dir: tempfile::TempDir,
}

impl Tmp {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, rel: &str, data: &str) {
        let p = self.path().join(rel);
        if let Some(parent) = p.parent() {
            fs::create_dir_all(parent).ok();
        }
        fs::write(p, data).unwrap();
    }

    pub fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.path().join(rel)).unwrap()
    }

    pub fn read_bytes(&self, rel: &str) -> Vec<u8> {
        fs::read(self.path().join(rel)).unwrap()
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.path().join(".devjail_backups")
    }

    /// Number of files in the backup directory.
    pub fn backup_count(&self) -> usize {
        fs::read_dir(self.backup_dir())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    pub fn config(&self) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.project_root = self.path().to_path_buf();
        config.shell = "/bin/sh".to_string();
        config.session.close_grace_ms = 500;
        config
    }

    pub fn engine(&self) -> (FileOps, PatchEngine) {
        let config = self.config();
        let jail = PathJail::new(self.path(), &config.deny_patterns, &config.backup_dir)
            .and_then(|jail| jail.with_allow_patterns(&config.allow_patterns))
            .unwrap();
        let backups = BackupStore::new(jail.root(), &config.backup_dir);
        (
            FileOps::new(jail.clone(), backups.clone(), config.max_read_bytes),
            PatchEngine::new(jail, backups),
        )
    }

    pub fn dispatcher(&self, provider: Arc<dyn DiffProvider>) -> Dispatcher {
        Dispatcher::new(&self.config(), provider).unwrap()
    }
}

/// Provider returning a fixed diff.
pub struct CannedDiff(pub String);

#[async_trait]
impl DiffProvider for CannedDiff {
    async fn suggest_diff(&self, _filename: &str, _goal: &str, _content: &str) -> anyhow::Result<String> {
        Ok(self.0.clone())
    }
}

/// Provider that always fails.
pub struct BrokenProvider;

#[async_trait]
impl DiffProvider for BrokenProvider {
    async fn suggest_diff(&self, _filename: &str, _goal: &str, _content: &str) -> anyhow::Result<String> {
        anyhow::bail!("upstream returned 503")
    }
}
