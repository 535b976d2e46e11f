use std::ffi::OsString;
use std::fs;
use std::path::{Component, Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use path_clean::PathClean;
use tracing::{debug, warn};

use crate::config::CONFIG_FILE_NAME;
use crate::errors::{JailError, JailResult};

const MAX_PATH_BYTES: usize = 4096;

/// Path jail for one project root.
///
/// Every caller-supplied path goes through [`PathJail::resolve`]:
/// - lexical normalization, rejecting absolute paths and `..` above the root
/// - symlink resolution on the deepest existing ancestor, re-checking
///   containment on the real location
/// - allow and deny rules on the requested, entry and resolved relative form
///
/// The jail only reads metadata; it never creates or modifies anything.
#[derive(Debug, Clone)]
pub struct PathJail {
    /// Canonicalized project root
    root: PathBuf,
    deny: GlobSet,
    /// Pattern text for each glob in `deny`, by index
    deny_rules: Vec<String>,
    /// `None` allows every path
    allow: Option<GlobSet>,
}

/// A path proven to lie inside the project root.
///
/// Carries two locations: the entry the caller named (its last component is
/// never followed) and the real file behind it. Content operations go through
/// [`JailedPath::absolute`], operations on the directory entry itself (rename,
/// unlink) through [`JailedPath::entry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JailedPath {
    absolute: PathBuf,
    relative: PathBuf,
    entry: PathBuf,
    entry_relative: PathBuf,
}

impl JailedPath {
    /// Real location on disk, symlinks resolved.
    pub fn absolute(&self) -> &Path {
        &self.absolute
    }

    /// Real location relative to the project root; empty for the root itself.
    pub fn relative(&self) -> &Path {
        &self.relative
    }

    /// The named entry: parents resolved, the last component left as is, so
    /// a symlink here is the link and not its target.
    pub fn entry(&self) -> &Path {
        &self.entry
    }

    pub fn entry_relative(&self) -> &Path {
        &self.entry_relative
    }

    pub fn is_root(&self) -> bool {
        self.entry_relative.as_os_str().is_empty()
    }

    /// Whether the named entry is itself a symlink.
    pub fn is_symlink(&self) -> bool {
        fs::symlink_metadata(&self.entry).map_or(false, |m| m.file_type().is_symlink())
    }

    /// Entry form with `/` separators, as reported to callers.
    pub fn display_relative(&self) -> String {
        slash_path(&self.entry_relative)
    }
}

impl PathJail {
    /// Build a jail rooted at `root` (must be an existing directory).
    ///
    /// `backup_dir` and the jail's own `devjail.toml` are always added to the
    /// deny set so callers can never touch backups or loosen the rules for
    /// the next start.
    pub fn new<P: AsRef<Path>>(
        root: P,
        deny_patterns: &[String],
        backup_dir: &Path,
    ) -> JailResult<Self> {
        let root = root.as_ref();
        let root = fs::canonicalize(root)
            .map_err(|e| JailError::io(Some(root.to_path_buf()), "canonicalize project root", e))?;

        if !root.is_dir() {
            return Err(JailError::io(
                Some(root.clone()),
                "open project root",
                std::io::Error::new(std::io::ErrorKind::Other, "project root is not a directory"),
            ));
        }

        let backup_rule = slash_path(backup_dir);
        let mut patterns: Vec<String> = deny_patterns.to_vec();
        patterns.push(format!("{}/**", backup_rule));
        patterns.push(CONFIG_FILE_NAME.to_string());

        let (deny, deny_rules) = compile_rules(&patterns, "deny")?;

        debug!(root = %root.display(), rules = patterns.len(), "path jail ready");

        Ok(Self {
            root,
            deny,
            deny_rules,
            allow: None,
        })
    }

    /// Restrict the jail to paths matching at least one of `patterns`.
    ///
    /// An empty list, or one containing `**`, keeps everything allowed.
    pub fn with_allow_patterns(mut self, patterns: &[String]) -> JailResult<Self> {
        if patterns.is_empty() || patterns.iter().any(|p| p == "**") {
            self.allow = None;
            return Ok(self);
        }
        let (allow, _) = compile_rules(patterns, "allow")?;
        debug!(rules = patterns.len(), "allow list active");
        self.allow = Some(allow);
        Ok(self)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `input` (relative to the root) into a [`JailedPath`].
    pub fn resolve(&self, input: &str) -> JailResult<JailedPath> {
        validate_basic_path(input)?;

        let lexical = clean_relative(input)?;
        self.check_access(&lexical)?;

        let candidate = self.root.join(&lexical);
        let entry = match (candidate.parent(), candidate.file_name()) {
            (Some(parent), Some(name)) if !lexical.as_os_str().is_empty() => {
                self.resolve_symlinks(input, parent)?.join(name)
            }
            _ => self.root.clone(),
        };
        let entry_relative = self.strip_root(input, &entry)?;
        if entry_relative != lexical {
            self.check_access(&entry_relative)?;
        }

        let absolute = self.resolve_symlinks(input, &candidate)?;
        let relative = self.strip_root(input, &absolute)?;
        if relative != entry_relative {
            self.check_access(&relative)?;
        }

        debug!(path = %input, resolved = %absolute.display(), "path resolved");
        Ok(JailedPath {
            absolute,
            relative,
            entry,
            entry_relative,
        })
    }

    /// Whether a root-relative path matches a deny rule.
    pub fn is_denied(&self, relative: &Path) -> bool {
        self.matching_rule(relative).is_some()
    }

    /// Whether a root-relative path matches the allow list. The root itself
    /// is always allowed.
    pub fn is_allowed(&self, relative: &Path) -> bool {
        match &self.allow {
            None => true,
            Some(_) if relative.as_os_str().is_empty() => true,
            Some(allow) => allow.is_match(slash_path(relative).as_str()),
        }
    }

    /// Allowed and not denied.
    pub fn permits(&self, relative: &Path) -> bool {
        self.is_allowed(relative) && !self.is_denied(relative)
    }

    fn strip_root(&self, input: &str, path: &Path) -> JailResult<PathBuf> {
        path.strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .map_err(|_| {
                warn!(path = %input, resolved = %path.display(), "symlink escape rejected");
                JailError::escape(input, "resolves outside the project root")
            })
    }

    fn matching_rule(&self, relative: &Path) -> Option<&str> {
        if relative.as_os_str().is_empty() {
            return None;
        }
        let candidate = slash_path(relative);
        self.deny
            .matches(candidate.as_str())
            .into_iter()
            .next()
            .map(|idx| self.deny_rules[idx].as_str())
    }

    fn check_access(&self, relative: &Path) -> JailResult<()> {
        if !self.is_allowed(relative) {
            warn!(path = %relative.display(), "path outside the allow list rejected");
            return Err(JailError::DeniedPath {
                path: relative.to_path_buf(),
                rule: "not in allow_patterns".to_string(),
            });
        }
        match self.matching_rule(relative) {
            Some(rule) => {
                warn!(path = %relative.display(), rule, "denied path rejected");
                Err(JailError::DeniedPath {
                    path: relative.to_path_buf(),
                    rule: rule.to_string(),
                })
            }
            None => Ok(()),
        }
    }

    /// Canonicalize the deepest existing ancestor of `candidate` and re-append
    /// the part that does not exist yet.
    fn resolve_symlinks(&self, input: &str, candidate: &Path) -> JailResult<PathBuf> {
        let mut existing = candidate.to_path_buf();
        let mut tail: Vec<OsString> = Vec::new();

        while fs::symlink_metadata(&existing).is_err() {
            match existing.file_name() {
                Some(name) => tail.push(name.to_os_string()),
                None => break,
            }
            if !existing.pop() || !existing.starts_with(&self.root) {
                return Err(JailError::escape(input, "no existing ancestor inside the project root"));
            }
        }

        let mut resolved = fs::canonicalize(&existing).map_err(|_| {
            warn!(path = %input, link = %existing.display(), "dangling symlink rejected");
            JailError::escape(input, "path goes through a dangling symlink")
        })?;

        for name in tail.iter().rev() {
            resolved.push(name);
        }

        if !resolved.starts_with(&self.root) {
            warn!(path = %input, resolved = %resolved.display(), "symlink escape rejected");
            return Err(JailError::escape(input, "resolves outside the project root"));
        }

        Ok(resolved)
    }
}

/// Reject characters and lengths no legitimate project path has.
fn validate_basic_path(input: &str) -> JailResult<()> {
    if input.contains('\0') {
        return Err(JailError::escape(input, "null byte in path"));
    }
    if input.chars().any(char::is_control) {
        return Err(JailError::escape(input, "control character in path"));
    }
    if input.len() > MAX_PATH_BYTES {
        return Err(JailError::escape(
            format!("{}...", &input[..input.char_indices().nth(64).map_or(input.len(), |(i, _)| i)]),
            "path too long",
        ));
    }
    Ok(())
}

/// Lexically clean `input`; the root itself comes back empty.
fn clean_relative(input: &str) -> JailResult<PathBuf> {
    let cleaned = Path::new(input).clean();
    let mut relative = PathBuf::new();

    // a cleaned relative path can only start with `..`, never contain one later
    for component in cleaned.components() {
        match component {
            Component::Normal(name) => relative.push(name),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(JailError::escape(input, "climbs above the project root"));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(JailError::escape(input, "absolute paths are not allowed"));
            }
        }
    }

    Ok(relative)
}

/// Compile glob rules; `dir/**` also matches `dir` itself.
fn compile_rules(patterns: &[String], role: &str) -> JailResult<(GlobSet, Vec<String>)> {
    let mut builder = GlobSetBuilder::new();
    let mut rules = Vec::new();
    for pattern in patterns {
        let normalized = pattern.replace('\\', "/");
        let glob = Glob::new(&normalized).map_err(|e| invalid_rule(role, pattern, e))?;
        builder.add(glob);
        rules.push(pattern.clone());

        if let Some(trimmed) = normalized.strip_suffix("/**") {
            if !trimmed.is_empty() {
                let glob = Glob::new(trimmed).map_err(|e| invalid_rule(role, pattern, e))?;
                builder.add(glob);
                rules.push(pattern.clone());
            }
        }
    }
    let set = builder
        .build()
        .map_err(|e| invalid_rule(role, &format!("<{role} set>"), e))?;
    Ok((set, rules))
}

fn slash_path(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn invalid_rule(role: &str, pattern: &str, err: globset::Error) -> JailError {
    JailError::Io {
        operation: format!("compile {} rule '{}'", role, pattern),
        path: None,
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn jail() -> (TempDir, PathJail) {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("src")).unwrap();
        fs::create_dir_all(temp.path().join(".git/objects")).unwrap();
        fs::write(temp.path().join("src/main.rs"), "fn main() {}\n").unwrap();

        let rules: Vec<String> = [".git/**", "**/node_modules/**", ".env", "**/.env*"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let jail = PathJail::new(temp.path(), &rules, Path::new(".devjail_backups")).unwrap();
        (temp, jail)
    }

    #[test]
    fn test_valid_paths() {
        let (_temp, jail) = jail();

        let existing = jail.resolve("src/main.rs").unwrap();
        assert_eq!(existing.relative(), Path::new("src/main.rs"));
        assert!(existing.absolute().starts_with(jail.root()));

        let fresh = jail.resolve("src/new/deep/file.rs").unwrap();
        assert_eq!(fresh.display_relative(), "src/new/deep/file.rs");

        assert_eq!(jail.resolve("src/./../src/main.rs").unwrap(), existing);
    }

    #[test]
    fn test_root_aliases() {
        let (_temp, jail) = jail();
        assert!(jail.resolve("").unwrap().is_root());
        assert!(jail.resolve(".").unwrap().is_root());
        assert!(jail.resolve("src/..").unwrap().is_root());
    }

    #[test]
    fn test_path_traversal_blocked() {
        let (_temp, jail) = jail();
        for input in ["../etc/passwd", "src/../../etc/passwd", "./../../etc/passwd", ".."] {
            let err = jail.resolve(input).unwrap_err();
            assert_eq!(err.kind(), "PathEscape", "{input}");
        }
    }

    #[test]
    fn test_absolute_paths_blocked() {
        let (_temp, jail) = jail();
        assert_eq!(jail.resolve("/etc/passwd").unwrap_err().kind(), "PathEscape");
        assert_eq!(jail.resolve("/tmp/test").unwrap_err().kind(), "PathEscape");
    }

    #[test]
    fn test_malicious_characters() {
        let (_temp, jail) = jail();
        assert_eq!(jail.resolve("src/test\0.rs").unwrap_err().kind(), "PathEscape");
        assert_eq!(jail.resolve("src/\u{1b}[31m.rs").unwrap_err().kind(), "PathEscape");
        let long_path = "a".repeat(5000);
        assert_eq!(jail.resolve(&long_path).unwrap_err().kind(), "PathEscape");
    }

    #[test]
    fn test_deny_rules() {
        let (_temp, jail) = jail();
        for input in [".git", ".git/config", "web/node_modules/x.js", ".env", "app/.env.local"] {
            let err = jail.resolve(input).unwrap_err();
            assert_eq!(err.kind(), "DeniedPath", "{input}");
        }
        assert!(jail.resolve("src/environment.rs").is_ok());
    }

    #[test]
    fn test_backup_dir_always_denied() {
        let (_temp, jail) = jail();
        assert_eq!(jail.resolve(".devjail_backups").unwrap_err().kind(), "DeniedPath");
        assert_eq!(
            jail.resolve(".devjail_backups/a.bak").unwrap_err().kind(),
            "DeniedPath"
        );
        assert!(jail.is_denied(Path::new(".git/HEAD")));
        assert!(!jail.is_denied(Path::new("src")));
    }

    #[test]
    fn test_config_file_always_denied() {
        let (temp, jail) = jail();
        fs::write(temp.path().join(CONFIG_FILE_NAME), "allow_shell = true\n").unwrap();
        assert_eq!(jail.resolve(CONFIG_FILE_NAME).unwrap_err().kind(), "DeniedPath");
        assert_eq!(jail.resolve("src/../devjail.toml").unwrap_err().kind(), "DeniedPath");
        assert!(jail.resolve("src/devjail.toml").is_ok());
    }

    #[test]
    fn test_allow_list_restricts_paths() {
        let (_temp, jail) = jail();
        let jail = jail
            .with_allow_patterns(&["src/**".to_string(), "*.md".to_string()])
            .unwrap();

        assert!(jail.resolve("src").is_ok());
        assert!(jail.resolve("src/main.rs").is_ok());
        assert!(jail.resolve("README.md").is_ok());
        assert!(jail.resolve("").unwrap().is_root());
        for input in ["Cargo.toml", "docs/guide.txt", "src/../build.rs"] {
            assert_eq!(jail.resolve(input).unwrap_err().kind(), "DeniedPath", "{input}");
        }
        // deny still wins over allow
        assert!(!jail.permits(Path::new(".git/HEAD")));
        assert!(jail.permits(Path::new("src/lib.rs")));
    }

    #[test]
    fn test_wildcard_allow_list_keeps_everything() {
        let (_temp, jail) = jail();
        let jail = jail.with_allow_patterns(&["**".to_string()]).unwrap();
        assert!(jail.resolve("anything/at/all.txt").is_ok());
        assert!(jail.is_allowed(Path::new("Cargo.toml")));
    }

    #[test]
    fn test_cleaning_edge_cases() {
        let (_temp, jail) = jail();
        assert_eq!(
            jail.resolve("src//main.rs/").unwrap().relative(),
            Path::new("src/main.rs")
        );
        assert!(jail.resolve("src/../.").unwrap().is_root());
        assert_eq!(jail.resolve("src/../..").unwrap_err().kind(), "PathEscape");
        assert_eq!(jail.resolve("a/b/../../../x").unwrap_err().kind(), "PathEscape");
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_blocked() {
        use std::os::unix::fs::symlink;

        let (temp, jail) = jail();
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("secret.txt"), "s").unwrap();

        symlink(outside.path(), temp.path().join("src/out")).unwrap();
        assert_eq!(jail.resolve("src/out").unwrap_err().kind(), "PathEscape");
        assert_eq!(jail.resolve("src/out/secret.txt").unwrap_err().kind(), "PathEscape");
        assert_eq!(jail.resolve("src/out/new.txt").unwrap_err().kind(), "PathEscape");
    }

    #[cfg(unix)]
    #[test]
    fn test_internal_symlink_resolves_and_rechecks_deny() {
        use std::os::unix::fs::symlink;

        let (temp, jail) = jail();
        symlink("main.rs", temp.path().join("src/alias.rs")).unwrap();
        symlink("../.git", temp.path().join("src/gitdir")).unwrap();
        symlink("missing-target", temp.path().join("src/dangling")).unwrap();

        let alias = jail.resolve("src/alias.rs").unwrap();
        assert_eq!(alias.relative(), Path::new("src/main.rs"));
        assert_eq!(alias.entry_relative(), Path::new("src/alias.rs"));
        assert_eq!(alias.display_relative(), "src/alias.rs");
        assert!(alias.is_symlink());
        assert!(!jail.resolve("src/main.rs").unwrap().is_symlink());

        assert_eq!(jail.resolve("src/gitdir/HEAD").unwrap_err().kind(), "DeniedPath");
        assert_eq!(jail.resolve("src/dangling").unwrap_err().kind(), "PathEscape");
    }
}
