//! Parsed patch shapes.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One line of a hunk body. The leading `' '`, `'+'` or `'-'` marker is
/// stripped; the payload is kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "text", rename_all = "snake_case")]
pub enum HunkLine {
    Context(String),
    Add(String),
    Remove(String),
}

impl HunkLine {
    pub fn is_change(&self) -> bool {
        !matches!(self, HunkLine::Context(_))
    }
}

/// One contiguous change region of a unified diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hunk {
    /// The `@@ ... @@` header line, trimmed
    pub header: String,
    /// 1-based start line in the original file (0 for new files)
    pub old_start: usize,
    pub lines: Vec<HunkLine>,
}

impl Hunk {
    /// Number of added plus removed lines.
    pub fn changed_lines(&self) -> usize {
        self.lines.iter().filter(|l| l.is_change()).count()
    }
}

/// All hunks targeting one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    pub path: String,
    pub hunks: Vec<Hunk>,
}

impl FileDiff {
    pub fn changed_lines(&self) -> usize {
        self.hunks.iter().map(Hunk::changed_lines).sum()
    }

    /// Keep only the hunks whose index is in `indices`.
    pub fn retain_hunks(&self, indices: &BTreeSet<usize>) -> FileDiff {
        FileDiff {
            path: self.path.clone(),
            hunks: self
                .hunks
                .iter()
                .enumerate()
                .filter(|(idx, _)| indices.contains(idx))
                .map(|(_, h)| h.clone())
                .collect(),
        }
    }
}

/// Full replacement content for one file, from a `File: <path>` fenced block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceFileBlock {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchKind {
    Diff,
    Blocks,
}

impl PatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchKind::Diff => "diff",
            PatchKind::Blocks => "blocks",
        }
    }
}

impl std::fmt::Display for PatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Synthetic handle for one hunk, `path#index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HunkRef {
    pub id: String,
    pub path: String,
    pub header: String,
    pub index: usize,
}

/// Summary of a parsed patch, shown to the operator before anything runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchPreview {
    pub kind: PatchKind,
    pub parsed_files: usize,
    pub files: Vec<String>,
    pub hunks: Vec<HunkRef>,
}

/// Operator-chosen subset of a patch.
///
/// `paths: None` means every parsed file. A path with no entry in `hunks`
/// keeps all of its hunks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplySelection {
    pub paths: Option<BTreeSet<String>>,
    pub hunks: BTreeMap<String, BTreeSet<usize>>,
}

impl ApplySelection {
    pub fn all() -> Self {
        Self::default()
    }

    /// Build a selection from preview hunk ids (`path#index`). Ids that do not
    /// parse are ignored.
    pub fn from_hunk_ids<'a, I>(ids: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut paths = BTreeSet::new();
        let mut hunks: BTreeMap<String, BTreeSet<usize>> = BTreeMap::new();
        for id in ids {
            let Some((path, idx)) = id.rsplit_once('#') else {
                continue;
            };
            let Ok(idx) = idx.parse::<usize>() else {
                continue;
            };
            paths.insert(path.to_string());
            hunks.entry(path.to_string()).or_default().insert(idx);
        }
        Self {
            paths: Some(paths),
            hunks,
        }
    }

    pub fn with_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            paths: Some(paths.into_iter().map(Into::into).collect()),
            hunks: BTreeMap::new(),
        }
    }

    pub fn includes_path(&self, path: &str) -> bool {
        self.paths.as_ref().map_or(true, |p| p.contains(path))
    }

    /// Narrow parsed diffs to the selection, dropping files left without hunks.
    pub fn filter_diffs(&self, files: &[FileDiff]) -> Vec<FileDiff> {
        files
            .iter()
            .filter(|f| self.includes_path(&f.path))
            .map(|f| match self.hunks.get(&f.path) {
                Some(indices) if !indices.is_empty() => f.retain_hunks(indices),
                _ => f.clone(),
            })
            .filter(|f| !f.hunks.is_empty())
            .collect()
    }

    pub fn filter_blocks(&self, blocks: &[WorkspaceFileBlock]) -> Vec<WorkspaceFileBlock> {
        blocks
            .iter()
            .filter(|b| self.includes_path(&b.path))
            .cloned()
            .collect()
    }
}
