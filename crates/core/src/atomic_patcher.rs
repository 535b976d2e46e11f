use std::fs;
use std::io;

use devjail_common::fs::atomic_write;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backup::{Backup, BackupStore};
use crate::errors::{JailError, JailResult};
use crate::patch_parser::{PatchHunk, PatchSet};
use crate::path_security::{JailedPath, PathJail};

/// Outcome of [`PatchEngine::apply`].
#[derive(Debug, Clone, Serialize)]
pub struct AppliedPatch {
    pub path: String,
    pub hunks_applied: usize,
    pub lines_added: usize,
    pub lines_removed: usize,
    /// The patch created the file
    pub created: bool,
    /// Validation only; nothing was written
    pub dry_run: bool,
    pub backup: Option<Backup>,
}

/// All-or-nothing unified diff application.
///
/// `Parse -> Validate -> Backup -> Write`; parsing and validation never touch
/// the target, so a rejected patch leaves it byte-identical.
#[derive(Debug, Clone)]
pub struct PatchEngine {
    jail: PathJail,
    backups: BackupStore,
}

/// Current state of the patch target.
struct Original {
    text: String,
    existed: bool,
}

impl PatchEngine {
    pub fn new(jail: PathJail, backups: BackupStore) -> Self {
        Self { jail, backups }
    }

    /// Apply `diff_text` to `rel`. Header paths in the diff are ignored; the
    /// target is always `rel`.
    pub fn apply(&self, rel: &str, diff_text: &str, dry_run: bool) -> JailResult<AppliedPatch> {
        let target = self.jail.resolve(rel)?;
        let patch = PatchSet::parse(diff_text)?;
        let original = self.load_original(&target, &patch)?;

        let new_content = splice(&target, &original, &patch)?;

        let mut result = AppliedPatch {
            path: target.display_relative(),
            hunks_applied: patch.hunks.len(),
            lines_added: patch.lines_added(),
            lines_removed: patch.lines_removed(),
            created: !original.existed,
            dry_run,
            backup: None,
        };

        if dry_run {
            debug!(path = %result.path, hunks = result.hunks_applied, "patch validated (dry run)");
            return Ok(result);
        }

        result.backup = self.backups.snapshot(&target)?;
        atomic_write(target.absolute(), new_content.as_bytes()).map_err(|e| {
            JailError::io_failure(target.relative().to_path_buf(), "write patched file", e)
        })?;

        info!(
            path = %result.path,
            hunks = result.hunks_applied,
            added = result.lines_added,
            removed = result.lines_removed,
            created = result.created,
            "patch applied"
        );
        Ok(result)
    }

    fn load_original(&self, target: &JailedPath, patch: &PatchSet) -> JailResult<Original> {
        let relative = target.relative().to_path_buf();

        if target.absolute().is_dir() {
            return Err(JailError::io_failure(
                relative,
                "patch file",
                io::Error::new(io::ErrorKind::Other, "is a directory"),
            ));
        }

        match fs::read(target.absolute()) {
            Ok(_) if patch.creates_file => Err(JailError::AlreadyExists { path: relative }),
            Ok(bytes) => {
                let text = String::from_utf8(bytes).map_err(|_| {
                    JailError::io_failure(
                        relative.clone(),
                        "patch file",
                        io::Error::new(io::ErrorKind::InvalidData, "file is not valid UTF-8"),
                    )
                })?;
                Ok(Original {
                    text,
                    existed: true,
                })
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound && patch.is_creation() => Ok(Original {
                text: String::new(),
                existed: false,
            }),
            Err(e) => Err(JailError::io(relative, "read file to patch", e)),
        }
    }
}

/// Check every hunk against `original`, then build the patched content.
fn splice(target: &JailedPath, original: &Original, patch: &PatchSet) -> JailResult<String> {
    let (lines, had_trailing_newline) = split_lines(&original.text);

    for hunk in &patch.hunks {
        validate_hunk(target, &lines, hunk)?;
    }

    let mut out: Vec<&str> = Vec::with_capacity(lines.len() + patch.lines_added());
    let mut cursor = 0;
    for hunk in &patch.hunks {
        out.extend_from_slice(&lines[cursor..hunk.old_pos()]);
        out.extend(hunk.replacement());
        cursor = hunk.old_end();
    }
    out.extend_from_slice(&lines[cursor..]);

    if out.is_empty() {
        return Ok(String::new());
    }

    // An empty original has no newline state of its own.
    let mut trailing_newline = lines.is_empty() || had_trailing_newline;
    if let Some(last) = patch.hunks.last() {
        let touches_eof = last.old_end() == lines.len();
        if touches_eof && (last.old_missing_newline || last.new_missing_newline) {
            trailing_newline = !last.new_missing_newline;
        }
    }

    let mut content = out.join("\n");
    if trailing_newline {
        content.push('\n');
    }
    Ok(content)
}

fn validate_hunk(target: &JailedPath, lines: &[&str], hunk: &PatchHunk) -> JailResult<()> {
    let pos = hunk.old_pos();
    if pos > lines.len() {
        return Err(conflict(
            target,
            hunk,
            pos + 1,
            format!("line {} of a {}-line file", hunk.old_start, lines.len()),
            None,
        ));
    }

    for (offset, expected) in hunk.expected().enumerate() {
        let found = lines.get(pos + offset).copied();
        if found != Some(expected) {
            return Err(conflict(
                target,
                hunk,
                pos + offset + 1,
                expected.to_string(),
                found.map(str::to_string),
            ));
        }
    }
    Ok(())
}

fn conflict(
    target: &JailedPath,
    hunk: &PatchHunk,
    line: usize,
    expected: String,
    found: Option<String>,
) -> JailError {
    warn!(path = %target.display_relative(), hunk = hunk.index, line, "patch conflict");
    JailError::PatchConflict {
        path: target.relative().to_path_buf(),
        hunk: hunk.index,
        line,
        expected,
        found,
    }
}

/// Split on `\n`, keeping `\r`; reports whether the text ended with `\n`.
fn split_lines(text: &str) -> (Vec<&str>, bool) {
    if text.is_empty() {
        return (Vec::new(), false);
    }
    let mut lines: Vec<&str> = text.split('\n').collect();
    let trailing = lines.last() == Some(&"");
    if trailing {
        lines.pop();
    }
    (lines, trailing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn engine() -> (TempDir, PatchEngine) {
        let temp = TempDir::new().unwrap();
        let backup_dir = Path::new(".devjail_backups");
        let jail = PathJail::new(temp.path(), &[".git/**".to_string()], backup_dir).unwrap();
        let backups = BackupStore::new(jail.root(), backup_dir);
        (temp, PatchEngine::new(jail, backups))
    }

    #[test]
    fn applies_multiple_hunks() {
        let (temp, engine) = engine();
        let file = temp.path().join("list.txt");
        fs::write(&file, "a\nb\nc\nd\ne\nf\ng\n").unwrap();

        let diff = "@@ -1,2 +1,2 @@\n-a\n+A\n b\n@@ -6,2 +6,3 @@\n f\n g\n+h\n";
        let result = engine.apply("list.txt", diff, false).unwrap();

        assert_eq!(fs::read_to_string(&file).unwrap(), "A\nb\nc\nd\ne\nf\ng\nh\n");
        assert_eq!(result.hunks_applied, 2);
        assert_eq!(result.lines_added, 2);
        assert_eq!(result.lines_removed, 1);
        assert!(!result.created);
        assert_eq!(result.backup.unwrap().contents().unwrap(), b"a\nb\nc\nd\ne\nf\ng\n");
    }

    #[test]
    fn trailing_whitespace_and_cr_must_match() {
        let (temp, engine) = engine();
        let file = temp.path().join("crlf.txt");
        fs::write(&file, "one\r\ntwo \r\n").unwrap();

        let wrong = "@@ -2 +2 @@\n-two\r\n+2\r\n";
        let err = engine.apply("crlf.txt", wrong, false).unwrap_err();
        match err {
            JailError::PatchConflict { hunk, line, found, .. } => {
                assert_eq!(hunk, 1);
                assert_eq!(line, 2);
                assert_eq!(found.as_deref(), Some("two \r"));
            }
            other => panic!("expected conflict, got {other:?}"),
        }

        let right = "@@ -2 +2 @@\n-two \r\n+2\r\n";
        engine.apply("crlf.txt", right, false).unwrap();
        assert_eq!(fs::read(&file).unwrap(), b"one\r\n2\r\n");
    }

    #[test]
    fn dry_run_leaves_file_and_backups_alone() {
        let (temp, engine) = engine();
        let file = temp.path().join("x.rs");
        fs::write(&file, "fn x() {}\n").unwrap();

        let diff = "@@ -1 +1,2 @@\n fn x() {}\n+fn y() {}\n";
        let result = engine.apply("x.rs", diff, true).unwrap();
        assert!(result.dry_run);
        assert!(result.backup.is_none());
        assert_eq!(fs::read_to_string(&file).unwrap(), "fn x() {}\n");
        assert!(!temp.path().join(".devjail_backups").exists());
    }

    #[test]
    fn creates_new_file_from_dev_null() {
        let (temp, engine) = engine();
        let diff = "--- /dev/null\n+++ b/docs/new.md\n@@ -0,0 +1,2 @@\n+# Title\n+body\n";
        let result = engine.apply("docs/new.md", diff, false).unwrap();
        assert!(result.created);
        assert!(result.backup.is_none());
        assert_eq!(
            fs::read_to_string(temp.path().join("docs/new.md")).unwrap(),
            "# Title\nbody\n"
        );

        // second application: the file exists now
        assert_eq!(
            engine.apply("docs/new.md", diff, false).unwrap_err().kind(),
            "AlreadyExists"
        );
    }

    #[test]
    fn missing_target_is_not_found_unless_creation() {
        let (_temp, engine) = engine();
        let diff = "@@ -1 +1 @@\n-a\n+b\n";
        assert_eq!(engine.apply("ghost.txt", diff, false).unwrap_err().kind(), "NotFound");
    }

    #[test]
    fn preserves_missing_trailing_newline() {
        let (temp, engine) = engine();
        let file = temp.path().join("n.txt");
        fs::write(&file, "a\nb").unwrap();

        engine.apply("n.txt", "@@ -1 +1 @@\n-a\n+A\n", false).unwrap();
        assert_eq!(fs::read_to_string(&file).unwrap(), "A\nb");

        let add_newline = "@@ -2 +2 @@\n-b\n\\ No newline at end of file\n+b\n";
        engine.apply("n.txt", add_newline, false).unwrap();
        assert_eq!(fs::read_to_string(&file).unwrap(), "A\nb\n");
    }

    #[test]
    fn insertion_past_end_conflicts() {
        let (temp, engine) = engine();
        fs::write(temp.path().join("short.txt"), "only\n").unwrap();
        let diff = "@@ -5,0 +6 @@\n+late\n";
        assert_eq!(engine.apply("short.txt", diff, false).unwrap_err().kind(), "PatchConflict");
    }

    #[test]
    fn non_utf8_target_is_io_failure() {
        let (temp, engine) = engine();
        fs::write(temp.path().join("bin.dat"), [0xff, 0xfe, b'\n']).unwrap();
        let diff = "@@ -1 +1 @@\n-a\n+b\n";
        assert_eq!(engine.apply("bin.dat", diff, false).unwrap_err().kind(), "IOFailure");
    }

    #[test]
    fn denied_target_rejected_before_parsing() {
        let (_temp, engine) = engine();
        assert_eq!(engine.apply(".git/config", "garbage", false).unwrap_err().kind(), "DeniedPath");
    }
}
