use crate::errors::{JailError, JailResult};

const DEV_NULL: &str = "/dev/null";
const NO_NEWLINE_MARKER: char = '\\';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchLine {
    Context(String),
    Add(String),
    Remove(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchHunk {
    /// 1-based position within the patch
    pub index: usize,
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<PatchLine>,
    /// `\ No newline at end of file` follows the last old-side line
    pub old_missing_newline: bool,
    /// `\ No newline at end of file` follows the last new-side line
    pub new_missing_newline: bool,
}

impl PatchHunk {
    /// 0-based index of the first old line covered by the hunk. For pure
    /// insertions (`-k,0`) this is the position after line `k`.
    pub fn old_pos(&self) -> usize {
        if self.old_count == 0 {
            self.old_start
        } else {
            self.old_start - 1
        }
    }

    pub fn old_end(&self) -> usize {
        self.old_pos() + self.old_count
    }

    /// Lines the current file must contain at `old_pos`.
    pub fn expected(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|line| match line {
            PatchLine::Context(text) | PatchLine::Remove(text) => Some(text.as_str()),
            PatchLine::Add(_) => None,
        })
    }

    /// Lines that replace the covered range.
    pub fn replacement(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|line| match line {
            PatchLine::Context(text) | PatchLine::Add(text) => Some(text.as_str()),
            PatchLine::Remove(_) => None,
        })
    }

    pub fn added(&self) -> usize {
        self.lines.iter().filter(|l| matches!(l, PatchLine::Add(_))).count()
    }

    pub fn removed(&self) -> usize {
        self.lines.iter().filter(|l| matches!(l, PatchLine::Remove(_))).count()
    }
}

/// Parsed single-file unified diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchSet {
    /// Path from the `---` header (informational)
    pub old_path: Option<String>,
    /// Path from the `+++` header (informational)
    pub new_path: Option<String>,
    /// The `---` header names `/dev/null`
    pub creates_file: bool,
    pub hunks: Vec<PatchHunk>,
}

impl PatchSet {
    /// Parse `diff_text` into hunks, checking structure only.
    ///
    /// Lines are split on `\n` alone so a `\r` stays part of the line
    /// content and is matched exactly against the file.
    pub fn parse(diff_text: &str) -> JailResult<Self> {
        if diff_text.trim().is_empty() {
            return Err(JailError::malformed("empty diff", None));
        }

        let mut lines: Vec<&str> = diff_text.split('\n').collect();
        if lines.last() == Some(&"") {
            lines.pop();
        }

        let mut patch = PatchSet {
            old_path: None,
            new_path: None,
            creates_file: false,
            hunks: Vec::new(),
        };
        let mut seen_old_header = false;
        let mut seen_new_header = false;
        let mut i = 0;

        while i < lines.len() {
            let line = lines[i];
            let line_number = i + 1;

            if line.starts_with("@@") {
                let index = patch.hunks.len() + 1;
                let (hunk, next) = parse_hunk(&lines, i, index)?;
                if let Some(prev) = patch.hunks.last() {
                    if hunk.old_pos() < prev.old_end() {
                        return Err(JailError::malformed(
                            format!(
                                "hunk #{} overlaps or precedes hunk #{}",
                                hunk.index, prev.index
                            ),
                            Some(line_number),
                        ));
                    }
                }
                patch.hunks.push(hunk);
                i = next;
                continue;
            }

            if !patch.hunks.is_empty() {
                check_trailing_line(line, line_number)?;
                i += 1;
                continue;
            }

            if let Some(rest) = line.strip_prefix("--- ") {
                if seen_old_header {
                    return Err(multiple_files(line_number));
                }
                seen_old_header = true;
                let path = header_path(rest);
                patch.creates_file = path == DEV_NULL;
                patch.old_path = (path != DEV_NULL).then(|| strip_side(path, "a/"));
            } else if let Some(rest) = line.strip_prefix("+++ ") {
                if seen_new_header {
                    return Err(multiple_files(line_number));
                }
                seen_new_header = true;
                let path = header_path(rest);
                if path == DEV_NULL {
                    return Err(JailError::malformed(
                        "file deletion patches are not supported",
                        Some(line_number),
                    ));
                }
                patch.new_path = Some(strip_side(path, "b/"));
            } else if line.starts_with("Binary files ") || line.starts_with("GIT binary patch") {
                return Err(JailError::malformed(
                    "binary patches are not supported",
                    Some(line_number),
                ));
            }
            i += 1;
        }

        if patch.hunks.is_empty() {
            return Err(JailError::malformed("no hunks found", None));
        }

        Ok(patch)
    }

    /// The patch can only apply to a file that does not exist yet.
    pub fn is_creation(&self) -> bool {
        self.creates_file
            || self
                .hunks
                .iter()
                .all(|h| h.old_start == 0 && h.old_count == 0)
    }

    pub fn lines_added(&self) -> usize {
        self.hunks.iter().map(PatchHunk::added).sum()
    }

    pub fn lines_removed(&self) -> usize {
        self.hunks.iter().map(PatchHunk::removed).sum()
    }
}

/// Parse the hunk whose header is `lines[start]`; returns it with the index
/// of the first line after its body.
fn parse_hunk(lines: &[&str], start: usize, index: usize) -> JailResult<(PatchHunk, usize)> {
    let header_line = start + 1;
    let (old_start, old_count, new_start, new_count) = parse_header(lines[start], header_line)?;

    if old_start == 0 && old_count != 0 {
        return Err(JailError::malformed(
            format!("hunk #{index}: old range starts at 0 but covers {old_count} lines"),
            Some(header_line),
        ));
    }
    if new_start == 0 && new_count != 0 {
        return Err(JailError::malformed(
            format!("hunk #{index}: new range starts at 0 but covers {new_count} lines"),
            Some(header_line),
        ));
    }

    let mut hunk = PatchHunk {
        index,
        old_start,
        old_count,
        new_start,
        new_count,
        lines: Vec::new(),
        old_missing_newline: false,
        new_missing_newline: false,
    };

    let mut old_seen = 0;
    let mut new_seen = 0;
    let mut i = start + 1;

    while old_seen < old_count || new_seen < new_count {
        let Some(&line) = lines.get(i) else {
            return Err(short_body(index, i + 1));
        };
        let line_number = i + 1;

        let parsed = match line.chars().next() {
            None => PatchLine::Context(String::new()),
            Some(' ') => PatchLine::Context(line[1..].to_string()),
            Some('-') => PatchLine::Remove(line[1..].to_string()),
            Some('+') => PatchLine::Add(line[1..].to_string()),
            Some(NO_NEWLINE_MARKER) => {
                mark_missing_newline(&mut hunk, line_number)?;
                i += 1;
                continue;
            }
            Some(_) if line.starts_with("@@") => return Err(short_body(index, line_number)),
            Some(_) => {
                return Err(JailError::malformed(
                    format!("hunk #{index}: unknown line prefix"),
                    Some(line_number),
                ))
            }
        };

        match parsed {
            PatchLine::Context(_) => {
                old_seen += 1;
                new_seen += 1;
            }
            PatchLine::Remove(_) => old_seen += 1,
            PatchLine::Add(_) => new_seen += 1,
        }
        if old_seen > old_count || new_seen > new_count {
            return Err(long_body(index, line_number));
        }

        hunk.lines.push(parsed);
        i += 1;
    }

    while let Some(line) = lines.get(i) {
        if !line.starts_with(NO_NEWLINE_MARKER) {
            break;
        }
        mark_missing_newline(&mut hunk, i + 1)?;
        i += 1;
    }

    Ok((hunk, i))
}

/// `@@ -old_start[,old_count] +new_start[,new_count] @@ [section]`
fn parse_header(header: &str, line_number: usize) -> JailResult<(usize, usize, usize, usize)> {
    let bad = || JailError::malformed(format!("invalid hunk header: {header}"), Some(line_number));

    let body = header.strip_prefix("@@ ").ok_or_else(bad)?;
    let end = body.find(" @@").ok_or_else(bad)?;
    let mut ranges = body[..end].split_whitespace();

    let old = ranges.next().and_then(|r| r.strip_prefix('-')).ok_or_else(bad)?;
    let new = ranges.next().and_then(|r| r.strip_prefix('+')).ok_or_else(bad)?;
    if ranges.next().is_some() {
        return Err(bad());
    }

    let (old_start, old_count) = parse_range(old).ok_or_else(bad)?;
    let (new_start, new_count) = parse_range(new).ok_or_else(bad)?;
    Ok((old_start, old_count, new_start, new_count))
}

/// `start[,count]`, count defaulting to 1.
fn parse_range(range: &str) -> Option<(usize, usize)> {
    match range.split_once(',') {
        Some((start, count)) => Some((start.parse().ok()?, count.parse().ok()?)),
        None => Some((range.parse().ok()?, 1)),
    }
}

fn mark_missing_newline(hunk: &mut PatchHunk, line_number: usize) -> JailResult<()> {
    match hunk.lines.last() {
        Some(PatchLine::Context(_)) => {
            hunk.old_missing_newline = true;
            hunk.new_missing_newline = true;
        }
        Some(PatchLine::Remove(_)) => hunk.old_missing_newline = true,
        Some(PatchLine::Add(_)) => hunk.new_missing_newline = true,
        None => {
            return Err(JailError::malformed(
                "end-of-file marker without a preceding line",
                Some(line_number),
            ))
        }
    }
    Ok(())
}

/// Only blank lines may follow the last hunk body.
fn check_trailing_line(line: &str, line_number: usize) -> JailResult<()> {
    if line.trim().is_empty() {
        return Ok(());
    }
    if line.starts_with("diff ") || line.starts_with("--- ") || line.starts_with("+++ ") {
        return Err(multiple_files(line_number));
    }
    if line.starts_with([' ', '+', '-', NO_NEWLINE_MARKER]) {
        return Err(JailError::malformed(
            "hunk body is longer than its header declares",
            Some(line_number),
        ));
    }
    Err(JailError::malformed("unexpected line after the last hunk", Some(line_number)))
}

/// Path part of a `---`/`+++` header, without a trailing `\t<timestamp>`.
fn header_path(rest: &str) -> &str {
    rest.split('\t').next().unwrap_or(rest).trim_end_matches('\r').trim()
}

fn strip_side(path: &str, side: &str) -> String {
    path.strip_prefix(side).unwrap_or(path).to_string()
}

fn multiple_files(line_number: usize) -> JailError {
    JailError::malformed("patch touches more than one file", Some(line_number))
}

fn short_body(index: usize, line_number: usize) -> JailError {
    JailError::malformed(
        format!("hunk #{index} body is shorter than its header declares"),
        Some(line_number),
    )
}

fn long_body(index: usize, line_number: usize) -> JailError {
    JailError::malformed(
        format!("hunk #{index} body is longer than its header declares"),
        Some(line_number),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn malformed_line(diff: &str) -> Option<usize> {
        match PatchSet::parse(diff) {
            Err(JailError::MalformedPatch { line_number, .. }) => line_number,
            other => panic!("expected MalformedPatch, got {other:?}"),
        }
    }

    #[test]
    fn parses_git_style_diff() {
        let diff = [
            "diff --git a/src/lib.rs b/src/lib.rs",
            "index 1234567..89abcde 100644",
            "--- a/src/lib.rs",
            "+++ b/src/lib.rs",
            "@@ -1,3 +1,4 @@ fn main",
            " line one",
            "-line two",
            "+line 2",
            "+line 2.5",
            " line three",
            "",
        ]
        .join("\n");

        let patch = PatchSet::parse(&diff).unwrap();
        assert_eq!(patch.old_path.as_deref(), Some("src/lib.rs"));
        assert_eq!(patch.new_path.as_deref(), Some("src/lib.rs"));
        assert_eq!(patch.hunks.len(), 1);

        let hunk = &patch.hunks[0];
        assert_eq!((hunk.old_start, hunk.old_count, hunk.new_start, hunk.new_count), (1, 3, 1, 4));
        assert_eq!(hunk.expected().collect::<Vec<_>>(), vec!["line one", "line two", "line three"]);
        assert_eq!(patch.lines_added(), 2);
        assert_eq!(patch.lines_removed(), 1);
        assert!(!patch.is_creation());
    }

    #[test]
    fn empty_line_in_body_is_empty_context() {
        let diff = "@@ -1,3 +1,3 @@\n a\n\n-b\n+c\n";
        let patch = PatchSet::parse(diff).unwrap();
        assert_eq!(patch.hunks[0].lines[1], PatchLine::Context(String::new()));
    }

    #[test]
    fn keeps_carriage_returns() {
        let diff = "@@ -1 +1 @@\n-old\r\n+new\r\n";
        let patch = PatchSet::parse(diff).unwrap();
        assert_eq!(patch.hunks[0].lines[0], PatchLine::Remove("old\r".into()));
    }

    #[test]
    fn no_newline_marker_attaches_to_previous_line() {
        let diff = "@@ -1 +1 @@\n-a\n\\ No newline at end of file\n+a\n";
        let hunk = &PatchSet::parse(diff).unwrap().hunks[0];
        assert!(hunk.old_missing_newline);
        assert!(!hunk.new_missing_newline);

        let diff = "@@ -1 +1,2 @@\n a\n+b\n\\ No newline at end of file\n";
        let hunk = &PatchSet::parse(diff).unwrap().hunks[0];
        assert!(hunk.new_missing_newline);
    }

    #[test]
    fn creation_patch() {
        let diff = "--- /dev/null\n+++ b/new.txt\n@@ -0,0 +1,2 @@\n+hello\n+world\n";
        let patch = PatchSet::parse(diff).unwrap();
        assert!(patch.creates_file);
        assert!(patch.is_creation());
        assert_eq!(patch.hunks[0].old_pos(), 0);
    }

    #[test]
    fn structural_errors_report_line_numbers() {
        assert!(matches!(
            PatchSet::parse("   \n"),
            Err(JailError::MalformedPatch { line_number: None, .. })
        ));
        assert!(matches!(
            PatchSet::parse("--- a/x\n+++ b/x\n"),
            Err(JailError::MalformedPatch { line_number: None, .. })
        ));

        assert_eq!(malformed_line("@@ -1,2 +1,2\n a\n b\n"), Some(1));
        assert_eq!(malformed_line("@@ -x,2 +1,2 @@\n a\n b\n"), Some(1));
        assert_eq!(malformed_line("@@ -0,2 +1,2 @@\n a\n b\n"), Some(1));
        // shorter: runs into the next header
        assert_eq!(malformed_line("@@ -1,3 +1,3 @@\n a\n b\n@@ -9 +9 @@\n-x\n+y\n"), Some(4));
        // shorter: runs out of input
        assert_eq!(malformed_line("@@ -1,3 +1,3 @@\n a\n"), Some(3));
        // longer
        assert_eq!(malformed_line("@@ -1 +1 @@\n-a\n+b\n+c\n"), Some(4));
        assert_eq!(malformed_line("@@ -1,2 +1,2 @@\n a\n*b\n"), Some(3));
    }

    #[test]
    fn rejects_overlapping_hunks() {
        let diff = "@@ -3,2 +3,2 @@\n a\n-b\n+c\n@@ -4 +4 @@\n-x\n+y\n";
        assert_eq!(malformed_line(diff), Some(5));

        let diff = "@@ -5 +5 @@\n-a\n+b\n@@ -1 +1 @@\n-x\n+y\n";
        assert_eq!(malformed_line(diff), Some(4));
    }

    #[test]
    fn rejects_multiple_files_and_deletion() {
        let diff = "--- a/x\n+++ b/x\n@@ -1 +1 @@\n-a\n+b\n--- a/y\n+++ b/y\n@@ -1 +1 @@\n-a\n+b\n";
        assert_eq!(malformed_line(diff), Some(6));

        let diff = "--- a/x\n+++ /dev/null\n@@ -1 +0,0 @@\n-a\n";
        assert_eq!(malformed_line(diff), Some(2));
    }
}
