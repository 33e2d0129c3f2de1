//! Patch parsing and application.

pub mod applier;
pub mod parser;
pub mod types;

use std::collections::BTreeMap;

pub use applier::{
    apply_diff_files, apply_file_blocks, apply_unified_diff_to_text, rollback, ApplyReport,
    FileFailure, RollbackReport, Snapshot,
};
pub use parser::{
    build_apply_preview, changed_lines_by_path, normalize_diff_path, parse_unified_diff,
    parse_workspace_file_blocks,
};
pub use types::{
    ApplySelection, FileDiff, Hunk, HunkLine, HunkRef, PatchKind, PatchPreview,
    WorkspaceFileBlock,
};

use crate::ports::WorkspaceFs;

/// A recognized patch, in whichever shape the text used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedPatch {
    Diff(Vec<FileDiff>),
    Blocks(Vec<WorkspaceFileBlock>),
}

impl ParsedPatch {
    /// Same precedence as [`build_apply_preview`]: diffs, then blocks.
    pub fn parse(text: &str) -> Option<Self> {
        let diffs = parse_unified_diff(text);
        if !diffs.is_empty() {
            return Some(Self::Diff(diffs));
        }
        let blocks = parse_workspace_file_blocks(text);
        if !blocks.is_empty() {
            return Some(Self::Blocks(blocks));
        }
        None
    }

    pub fn kind(&self) -> PatchKind {
        match self {
            Self::Diff(_) => PatchKind::Diff,
            Self::Blocks(_) => PatchKind::Blocks,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Diff(d) => d.is_empty(),
            Self::Blocks(b) => b.is_empty(),
        }
    }

    pub fn paths(&self) -> Vec<String> {
        match self {
            Self::Diff(d) => d.iter().map(|f| f.path.clone()).collect(),
            Self::Blocks(b) => b.iter().map(|f| f.path.clone()).collect(),
        }
    }

    pub fn preview(&self) -> PatchPreview {
        match self {
            Self::Diff(d) => parser::preview_for_diffs(d),
            Self::Blocks(b) => parser::preview_for_blocks(b),
        }
    }

    pub fn changed_lines(&self) -> BTreeMap<String, usize> {
        match self {
            Self::Diff(d) => changed_lines_by_path(d, &[]),
            Self::Blocks(b) => changed_lines_by_path(&[], b),
        }
    }

    /// Narrow to the operator's selection. May leave nothing behind.
    pub fn select(&self, selection: &ApplySelection) -> Self {
        match self {
            Self::Diff(d) => Self::Diff(selection.filter_diffs(d)),
            Self::Blocks(b) => Self::Blocks(selection.filter_blocks(b)),
        }
    }

    pub async fn apply(&self, fs: &dyn WorkspaceFs) -> ApplyReport {
        match self {
            Self::Diff(d) => apply_diff_files(fs, d).await,
            Self::Blocks(b) => apply_file_blocks(fs, b).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_selects_shape() {
        let diff = ParsedPatch::parse("+++ b/a.txt\n@@ -1 +1 @@\n-a\n+b\n").unwrap();
        assert_eq!(diff.kind(), PatchKind::Diff);
        assert_eq!(diff.changed_lines()["a.txt"], 2);

        let blocks = ParsedPatch::parse("File: a.txt\n```\nx\n```").unwrap();
        assert_eq!(blocks.kind(), PatchKind::Blocks);
        assert_eq!(blocks.paths(), vec!["a.txt".to_string()]);

        assert!(ParsedPatch::parse("nothing here").is_none());
    }

    #[test]
    fn select_can_empty_the_patch() {
        let patch = ParsedPatch::parse("File: a.txt\n```\nx\n```").unwrap();
        let narrowed = patch.select(&ApplySelection::with_paths(["other.txt"]));
        assert!(narrowed.is_empty());
    }
}
