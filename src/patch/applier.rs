//! Strict hunk application and workspace-level apply/rollback.
//!
//! [`apply_unified_diff_to_text`] is pure and fails closed: any context or
//! removed line that does not match the source verbatim, or any hunk that
//! starts before the previous one ended, aborts the whole file. The async
//! helpers apply many files independently through a [`WorkspaceFs`] and
//! capture a [`Snapshot`] before every mutating write. A failure in one file
//! never stops the others.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, warn};

use super::types::{FileDiff, HunkLine, WorkspaceFileBlock};
use crate::ports::WorkspaceFs;

/// Apply one file's hunks to `original`. `None` is a conflict.
pub fn apply_unified_diff_to_text(original: &str, file: &FileDiff) -> Option<String> {
    let has_crlf = original.contains("\r\n");
    let src = original.replace("\r\n", "\n");
    let src_lines: Vec<&str> = src.split('\n').collect();

    let mut out: Vec<&str> = Vec::with_capacity(src_lines.len());
    let mut cursor = 0usize;

    for hunk in &file.hunks {
        let target = hunk.old_start.saturating_sub(1);
        if target < cursor || target > src_lines.len() {
            return None;
        }
        out.extend_from_slice(&src_lines[cursor..target]);

        let mut i = target;
        for line in &hunk.lines {
            match line {
                HunkLine::Context(text) => {
                    if src_lines.get(i) != Some(&text.as_str()) {
                        return None;
                    }
                    out.push(src_lines[i]);
                    i += 1;
                }
                HunkLine::Remove(text) => {
                    if src_lines.get(i) != Some(&text.as_str()) {
                        return None;
                    }
                    i += 1;
                }
                HunkLine::Add(text) => out.push(text.as_str()),
            }
        }
        cursor = i;
    }

    out.extend_from_slice(&src_lines[cursor..]);
    let merged = out.join("\n");
    Some(if has_crlf {
        merged.replace('\n', "\r\n")
    } else {
        merged
    })
}

/// Prior state of one file, captured before it was overwritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub path: String,
    pub had_file: bool,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFailure {
    pub path: String,
    pub error: String,
}

/// Outcome of applying a set of files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    /// Files written successfully
    pub applied: Vec<String>,
    /// Files whose hunks did not match the current content
    pub conflicts: Vec<String>,
    /// Files that could not be read or written
    pub failures: Vec<FileFailure>,
    pub snapshots: Vec<Snapshot>,
}

impl ApplyReport {
    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }

    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }

    /// Some but not all files landed. Callers decide whether to roll back.
    pub fn is_partial(&self) -> bool {
        !self.applied.is_empty() && (!self.conflicts.is_empty() || !self.failures.is_empty())
    }

    fn fail(&mut self, path: &str, error: impl ToString) {
        let error = error.to_string();
        warn!(path = %path, error = %error, "patch file failed");
        self.failures.push(FileFailure {
            path: path.to_string(),
            error,
        });
    }

    async fn write_with_snapshot(
        &mut self,
        fs: &dyn WorkspaceFs,
        snapshotted: &mut HashSet<String>,
        path: &str,
        prior: Option<String>,
        next: &str,
    ) {
        if snapshotted.insert(path.to_string()) {
            self.snapshots.push(Snapshot {
                path: path.to_string(),
                had_file: prior.is_some(),
                content: prior.unwrap_or_default(),
            });
        }
        match fs.write(path, next).await {
            Ok(()) => {
                debug!(path = %path, "patch file written");
                if !self.applied.iter().any(|p| p == path) {
                    self.applied.push(path.to_string());
                }
            }
            Err(e) => self.fail(path, e),
        }
    }
}

/// Apply parsed diffs file by file. A missing file is treated as empty text.
pub async fn apply_diff_files(fs: &dyn WorkspaceFs, files: &[FileDiff]) -> ApplyReport {
    let mut report = ApplyReport::default();
    let mut snapshotted = HashSet::new();

    for file in files {
        let prior = match fs.read_to_string(&file.path).await {
            Ok(prior) => prior,
            Err(e) => {
                report.fail(&file.path, e);
                continue;
            }
        };
        let Some(next) = apply_unified_diff_to_text(prior.as_deref().unwrap_or_default(), file)
        else {
            debug!(path = %file.path, "hunk conflict");
            report.conflicts.push(file.path.clone());
            continue;
        };
        report
            .write_with_snapshot(fs, &mut snapshotted, &file.path, prior, &next)
            .await;
    }

    report
}

/// Replace each block's file with its content.
pub async fn apply_file_blocks(fs: &dyn WorkspaceFs, blocks: &[WorkspaceFileBlock]) -> ApplyReport {
    let mut report = ApplyReport::default();
    let mut snapshotted = HashSet::new();

    for block in blocks {
        let prior = match fs.read_to_string(&block.path).await {
            Ok(prior) => prior,
            Err(e) => {
                report.fail(&block.path, e);
                continue;
            }
        };
        report
            .write_with_snapshot(fs, &mut snapshotted, &block.path, prior, &block.content)
            .await;
    }

    report
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReport {
    pub restored: Vec<String>,
    pub failures: Vec<FileFailure>,
}

/// Replay snapshots in reverse capture order. Files that did not exist
/// before are deleted. Individual failures are collected, not fatal.
pub async fn rollback(fs: &dyn WorkspaceFs, snapshots: &[Snapshot]) -> RollbackReport {
    let mut report = RollbackReport::default();
    for snap in snapshots.iter().rev() {
        let result = if snap.had_file {
            fs.write(&snap.path, &snap.content).await
        } else {
            fs.delete(&snap.path).await
        };
        match result {
            Ok(()) => report.restored.push(snap.path.clone()),
            Err(e) => {
                warn!(path = %snap.path, error = %e, "rollback failed for file");
                report.failures.push(FileFailure {
                    path: snap.path.clone(),
                    error: e.to_string(),
                });
            }
        }
    }
    report
}
