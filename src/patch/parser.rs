//! Patch text parsing.
//!
//! Two input shapes are recognized:
//!
//! 1. Unified diffs, with `diff --git a/X b/Y` headers or bare `--- / +++`
//!    headers, followed by `@@ -start[,len] +start[,len] @@` hunks.
//! 2. Labeled file blocks: a `File: <path>` (or `Arquivo: <path>`) line
//!    followed by a fenced code block holding the full new content.
//!
//! Nothing here fails. Text that matches neither shape yields an empty result
//! and [`build_apply_preview`] returns `None`, which tells the caller to fall
//! back to a non-patch edit path.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

use super::types::{
    FileDiff, Hunk, HunkLine, HunkRef, PatchKind, PatchPreview, WorkspaceFileBlock,
};

static DIFF_GIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^diff --git a/(.+?) b/(.+)$").unwrap());
static PLUS_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\+\+\+ (.+)$").unwrap());
static HUNK_HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+\d+(?:,(\d+))? @@").unwrap());
static FILE_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)(?:^|\n)(?:File|Arquivo)\s*:\s*(.+?)\n```[^\n]*\n([\s\S]*?)```").unwrap()
});

/// Normalize a path taken from a diff header or block label.
///
/// Strips quotes, a single `a/` or `b/` prefix and any trailing tab-separated
/// timestamp, then canonicalizes segments: `.` and empty segments are
/// dropped, so `b/./src//x.rs` becomes `src/x.rs`. Returns `None` for empty,
/// absolute, `/dev/null` or parent-escaping paths.
///
/// The result is the one string policy, apply and the ledger all see.
pub fn normalize_diff_path(raw: &str) -> Option<String> {
    let raw = raw.split('\t').next().unwrap_or_default().trim();
    let raw = raw
        .trim_start_matches(['"', '\''])
        .trim_end_matches(['"', '\''])
        .replace('\\', "/");
    let stripped = raw
        .strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(&raw)
        .trim();

    if stripped.is_empty() || stripped.starts_with('/') || stripped == "dev/null" {
        return None;
    }
    // Windows drive prefixes (`C:/...`)
    if stripped.len() >= 2 && stripped.as_bytes()[1] == b':' {
        return None;
    }

    let mut segments = Vec::new();
    for seg in stripped.split('/') {
        match seg {
            "" | "." => {}
            ".." => return None,
            _ => segments.push(seg),
        }
    }
    if segments.is_empty() {
        return None;
    }
    Some(segments.join("/"))
}

#[derive(Default)]
struct DiffBuilder {
    files: Vec<FileDiff>,
    current: Option<FileDiff>,
    hunk: Option<Hunk>,
    /// Old and new lines the open hunk header still promises
    remaining: (usize, usize),
}

impl DiffBuilder {
    fn close_hunk(&mut self) {
        self.remaining = (0, 0);
        if let (Some(file), Some(hunk)) = (self.current.as_mut(), self.hunk.take()) {
            file.hunks.push(hunk);
        }
    }

    fn finish_file(&mut self) {
        self.close_hunk();
        if let Some(file) = self.current.take() {
            if !file.path.is_empty() && !file.hunks.is_empty() {
                self.files.push(file);
            }
        }
    }

    fn current_has_hunks(&self) -> bool {
        self.hunk.is_some() || self.current.as_ref().is_some_and(|f| !f.hunks.is_empty())
    }

    fn start_file(&mut self, path: Option<String>) {
        self.finish_file();
        self.current = Some(FileDiff {
            path: path.unwrap_or_default(),
            hunks: Vec::new(),
        });
    }

    fn on_plus_header(&mut self, path: Option<String>) {
        let Some(path) = path else {
            self.close_hunk();
            return;
        };
        if self.current.is_none() || self.current_has_hunks() {
            self.start_file(Some(path));
        } else if let Some(file) = self.current.as_mut() {
            file.path = path;
        }
    }

    /// An open hunk whose counts are not yet used up.
    fn hunk_pending(&self) -> bool {
        self.hunk.is_some() && self.remaining != (0, 0)
    }

    fn on_hunk_header(&mut self, header: &str, old_start: usize, counts: (usize, usize)) {
        if self.current.is_none() {
            return;
        }
        self.close_hunk();
        self.remaining = counts;
        self.hunk = Some(Hunk {
            header: header.trim().to_string(),
            old_start,
            lines: Vec::new(),
        });
    }

    fn on_body_line(&mut self, line: &str) {
        let Some(hunk) = self.hunk.as_mut() else {
            return;
        };
        let mut chars = line.chars();
        let (old, new) = &mut self.remaining;
        let tagged = match chars.next() {
            Some(' ') => {
                *old = old.saturating_sub(1);
                *new = new.saturating_sub(1);
                HunkLine::Context(chars.as_str().to_string())
            }
            Some('+') => {
                *new = new.saturating_sub(1);
                HunkLine::Add(chars.as_str().to_string())
            }
            Some('-') => {
                *old = old.saturating_sub(1);
                HunkLine::Remove(chars.as_str().to_string())
            }
            // `\ No newline at end of file` and anything untagged
            _ => return,
        };
        hunk.lines.push(tagged);
    }
}

/// Parse unified-diff text into per-file diffs.
pub fn parse_unified_diff(text: &str) -> Vec<FileDiff> {
    let normalized = text.replace("\r\n", "\n");
    let lines: Vec<&str> = normalized.split('\n').collect();
    let mut builder = DiffBuilder::default();

    for (idx, line) in lines.iter().enumerate() {
        if let Some(caps) = DIFF_GIT_RE.captures(line) {
            builder.start_file(caps.get(2).and_then(|m| normalize_diff_path(m.as_str())));
            continue;
        }

        // A `---` line directly above a `+++` line is a file header unless the
        // open hunk still expects lines and no hunk header follows the pair.
        let pending = builder.hunk_pending();
        let next_is_plus = lines.get(idx + 1).is_some_and(|n| n.starts_with("+++ "));
        let hunk_follows = lines.get(idx + 2).is_some_and(|n| HUNK_HEADER_RE.is_match(n));
        if line.starts_with("--- ") && next_is_plus && (!pending || hunk_follows) {
            if builder.current_has_hunks() {
                builder.finish_file();
            } else {
                builder.close_hunk();
            }
            continue;
        }

        if pending && line.starts_with([' ', '+', '-']) {
            builder.on_body_line(line);
            continue;
        }

        if let Some(caps) = PLUS_HEADER_RE.captures(line) {
            builder.on_plus_header(caps.get(1).and_then(|m| normalize_diff_path(m.as_str())));
            continue;
        }

        if let Some(caps) = HUNK_HEADER_RE.captures(line) {
            let count = |i: usize| caps.get(i).map_or(Some(1), |m| m.as_str().parse::<usize>().ok());
            let old_start = caps.get(1).and_then(|m| m.as_str().parse::<usize>().ok());
            if let (Some(old_start), Some(old), Some(new)) = (old_start, count(2), count(3)) {
                builder.on_hunk_header(line, old_start, (old, new));
            }
            continue;
        }

        builder.on_body_line(line);
    }

    builder.finish_file();
    builder.files
}

/// Parse `File: <path>` / `Arquivo: <path>` labeled fenced blocks.
pub fn parse_workspace_file_blocks(text: &str) -> Vec<WorkspaceFileBlock> {
    let src = text.replace("\r\n", "\n");
    FILE_BLOCK_RE
        .captures_iter(&src)
        .filter_map(|caps| {
            let path = normalize_diff_path(caps.get(1)?.as_str())?;
            let body = caps.get(2)?.as_str();
            let content = body.strip_suffix('\n').unwrap_or(body);
            if content.is_empty() {
                return None;
            }
            Some(WorkspaceFileBlock {
                path,
                content: content.to_string(),
            })
        })
        .collect()
}

/// Summarize a patch. Diffs win over blocks; `None` means "not a patch".
pub fn build_apply_preview(text: &str) -> Option<PatchPreview> {
    let diffs = parse_unified_diff(text);
    if !diffs.is_empty() {
        return Some(preview_for_diffs(&diffs));
    }

    let blocks = parse_workspace_file_blocks(text);
    if !blocks.is_empty() {
        return Some(preview_for_blocks(&blocks));
    }

    None
}

pub fn preview_for_diffs(diffs: &[FileDiff]) -> PatchPreview {
    let hunks = diffs
        .iter()
        .flat_map(|f| {
            f.hunks.iter().enumerate().map(move |(index, h)| HunkRef {
                id: format!("{}#{}", f.path, index),
                path: f.path.clone(),
                header: if h.header.is_empty() {
                    "@@".to_string()
                } else {
                    h.header.clone()
                },
                index,
            })
        })
        .collect();
    PatchPreview {
        kind: PatchKind::Diff,
        parsed_files: diffs.len(),
        files: diffs.iter().map(|f| f.path.clone()).collect(),
        hunks,
    }
}

pub fn preview_for_blocks(blocks: &[WorkspaceFileBlock]) -> PatchPreview {
    PatchPreview {
        kind: PatchKind::Blocks,
        parsed_files: blocks.len(),
        files: blocks.iter().map(|b| b.path.clone()).collect(),
        hunks: Vec::new(),
    }
}

/// Changed-line counts per path, for domain line limits.
///
/// Diffs count added and removed lines; blocks count every line of the new
/// content, since the whole file is replaced.
pub fn changed_lines_by_path(diffs: &[FileDiff], blocks: &[WorkspaceFileBlock]) -> BTreeMap<String, usize> {
    let mut out = BTreeMap::new();
    for f in diffs {
        *out.entry(f.path.clone()).or_insert(0) += f.changed_lines();
    }
    for b in blocks {
        out.insert(b.path.clone(), b.content.split('\n').count());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_DIFF: &str = "diff --git a/src/a.ts b/src/a.ts\n\
--- a/src/a.ts\n\
+++ b/src/a.ts\n\
@@ -1,3 +1,4 @@\n\
 const a = 1;\n\
+const b = 2;\n\
 export function x(){\n\
   return a;\n\
 }";

    #[test]
    fn parses_file_and_hunks() {
        let parsed = parse_unified_diff(SAMPLE_DIFF);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].path, "src/a.ts");
        assert_eq!(parsed[0].hunks.len(), 1);
        assert!(parsed[0].hunks[0].header.starts_with("@@"));
        assert_eq!(parsed[0].hunks[0].old_start, 1);
        assert_eq!(parsed[0].hunks[0].lines.len(), 5);
        assert_eq!(parsed[0].hunks[0].lines[1], HunkLine::Add("const b = 2;".into()));
    }

    #[test]
    fn bare_plus_headers_split_files() {
        let text = "--- a/one.txt\n+++ b/one.txt\n@@ -1 +1 @@\n-old\n+new\n\
--- a/two.txt\n+++ b/two.txt\n@@ -3,1 +3,1 @@\n-x\n+y\n";
        let parsed = parse_unified_diff(text);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].path, "one.txt");
        assert_eq!(parsed[0].hunks[0].lines.len(), 2);
        assert_eq!(parsed[1].path, "two.txt");
        assert_eq!(parsed[1].hunks[0].old_start, 3);
    }

    #[test]
    fn multiple_hunks_in_order() {
        let text = "+++ b/f.txt\n@@ -1,1 +1,1 @@\n-a\n+b\n@@ -10,1 +10,1 @@\n-c\n+d\n";
        let parsed = parse_unified_diff(text);
        assert_eq!(parsed[0].hunks.len(), 2);
        assert_eq!(parsed[0].hunks[1].old_start, 10);
    }

    #[test]
    fn dash_and_plus_content_inside_hunk_is_body() {
        let text = "--- a/notes.md\n+++ b/notes.md\n@@ -1,2 +1,2 @@\n keep\n--- old rule\n+++ new rule\n\
--- a/two.txt\n+++ b/two.txt\n@@ -1 +1 @@\n-x\n+y\n";
        let parsed = parse_unified_diff(text);
        assert_eq!(parsed.len(), 2);
        assert_eq!(
            parsed[0].hunks[0].lines,
            vec![
                HunkLine::Context("keep".into()),
                HunkLine::Remove("-- old rule".into()),
                HunkLine::Add("++ new rule".into()),
            ]
        );
        assert_eq!(parsed[1].path, "two.txt");
    }

    #[test]
    fn short_counts_still_yield_to_next_file() {
        // header promises 3 lines but only 2 follow before the next file
        let text = "--- a/a.txt\n+++ b/a.txt\n@@ -1,3 +1,3 @@\n-a\n+b\n\
--- a/b.txt\n+++ b/b.txt\n@@ -1 +1 @@\n-c\n+d\n";
        let parsed = parse_unified_diff(text);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].hunks[0].lines.len(), 2);
        assert_eq!(parsed[1].path, "b.txt");
    }

    #[test]
    fn ignores_no_newline_marker() {
        let text = "+++ b/f.txt\n@@ -1 +1 @@\n-a\n\\ No newline at end of file\n+b\n";
        let parsed = parse_unified_diff(text);
        assert_eq!(parsed[0].hunks[0].lines.len(), 2);
    }

    #[test]
    fn discards_files_without_hunks_or_path() {
        assert!(parse_unified_diff("diff --git a/x b/x\nindex 123..456\n").is_empty());
        assert!(parse_unified_diff("+++ b/../etc/passwd\n@@ -1 +1 @@\n-a\n+b\n").is_empty());
        assert!(parse_unified_diff("just some prose").is_empty());
    }

    #[test]
    fn hunk_header_without_file_is_ignored() {
        assert!(parse_unified_diff("@@ -1 +1 @@\n-a\n+b\n").is_empty());
    }

    #[test]
    fn crlf_input_is_normalized() {
        let text = SAMPLE_DIFF.replace('\n', "\r\n");
        let parsed = parse_unified_diff(&text);
        assert_eq!(parsed[0].hunks[0].lines[0], HunkLine::Context("const a = 1;".into()));
    }

    #[test]
    fn normalize_strips_prefixes_and_quotes() {
        assert_eq!(normalize_diff_path("a/src/x.rs").as_deref(), Some("src/x.rs"));
        assert_eq!(normalize_diff_path("\"b/src/x.rs\"").as_deref(), Some("src/x.rs"));
        assert_eq!(
            normalize_diff_path("b/src/x.rs\t2024-01-01 00:00").as_deref(),
            Some("src/x.rs")
        );
        assert_eq!(normalize_diff_path("src\\win\\x.rs").as_deref(), Some("src/win/x.rs"));
        assert_eq!(normalize_diff_path("/dev/null"), None);
        assert_eq!(normalize_diff_path("/etc/passwd"), None);
        assert_eq!(normalize_diff_path("C:/x"), None);
        assert_eq!(normalize_diff_path(""), None);
    }

    #[test]
    fn normalize_canonicalizes_segments() {
        assert_eq!(normalize_diff_path("./.env").as_deref(), Some(".env"));
        assert_eq!(normalize_diff_path("b/./.env").as_deref(), Some(".env"));
        assert_eq!(normalize_diff_path("src//auth/x.ts").as_deref(), Some("src/auth/x.ts"));
        assert_eq!(normalize_diff_path("a/src/./ui//b.tsx").as_deref(), Some("src/ui/b.tsx"));
        assert_eq!(normalize_diff_path("src/./../x"), None);
        assert_eq!(normalize_diff_path("./"), None);
    }

    #[test]
    fn dotted_headers_and_labels_parse_canonical() {
        let diff = parse_unified_diff("--- a/./.env\n+++ b/./.env\n@@ -0,0 +1 @@\n+SECRET=1\n");
        assert_eq!(diff[0].path, ".env");
        let blocks = parse_workspace_file_blocks("File: src//auth/login.ts\n```\nx\n```");
        assert_eq!(blocks[0].path, "src/auth/login.ts");
    }

    #[test]
    fn parses_bilingual_blocks() {
        let text = "File: src/a.ts\n```ts\nexport const a = 1;\n```\n\n\
Arquivo: src/b.ts\n```ts\nexport const b = 2;\n```";
        let blocks = parse_workspace_file_blocks(text);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].path, "src/a.ts");
        assert_eq!(blocks[0].content, "export const a = 1;");
        assert_eq!(blocks[1].path, "src/b.ts");
    }

    #[test]
    fn block_labels_are_case_insensitive() {
        let blocks = parse_workspace_file_blocks("file: x.txt\n```\nhi\n```");
        assert_eq!(blocks.len(), 1);
    }

    #[test]
    fn empty_blocks_are_discarded() {
        assert!(parse_workspace_file_blocks("File: x.txt\n```\n```").is_empty());
    }

    #[test]
    fn preview_prefers_diff() {
        let preview = build_apply_preview(SAMPLE_DIFF).unwrap();
        assert_eq!(preview.kind, PatchKind::Diff);
        assert_eq!(preview.files, vec!["src/a.ts".to_string()]);
        assert_eq!(preview.hunks[0].id, "src/a.ts#0");
    }

    #[test]
    fn preview_falls_back_to_blocks_then_none() {
        let preview = build_apply_preview("File: a.txt\n```\nhello\n```").unwrap();
        assert_eq!(preview.kind, PatchKind::Blocks);
        assert!(preview.hunks.is_empty());
        assert!(build_apply_preview("please refactor this").is_none());
    }

    #[test]
    fn changed_lines_counts() {
        let diffs = parse_unified_diff(SAMPLE_DIFF);
        let blocks = parse_workspace_file_blocks("File: b.txt\n```\n1\n2\n3\n```");
        let counts = changed_lines_by_path(&diffs, &blocks);
        assert_eq!(counts["src/a.ts"], 1);
        assert_eq!(counts["b.txt"], 3);
    }
}
