//! Append-only custody ledger over a [`WorkspaceFs`].
//!
//! One JSON object per line. Appends are serialized by a per-ledger mutex
//! held across "read tail, compute entry, append line", so no two appends
//! ever chain from the same tail. Share one [`CustodyLedger`] (behind an
//! `Arc`) per ledger file.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::chain::{build_signed_entry, verify_signed_entry, CustodySignedEntry, SigningKey, GENESIS};
use super::record::{LedgerEvent, LedgerRecord};
use super::LedgerError;
use crate::ports::WorkspaceFs;

pub const DEFAULT_LEDGER_FILE: &str = ".patch_custody_chain.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityFailure {
    InvalidJson,
    SignatureMismatch,
}

impl IntegrityFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidJson => "invalid_json",
            Self::SignatureMismatch => "signature_mismatch",
        }
    }
}

impl std::fmt::Display for IntegrityFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of walking the chain from genesis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainVerification {
    /// Lines examined, including a failing one
    pub checked: usize,
    /// 1-based line of the first failure
    pub failed_at: Option<usize>,
    pub reason: Option<IntegrityFailure>,
}

impl ChainVerification {
    pub fn is_ok(&self) -> bool {
        self.failed_at.is_none()
    }

    /// Entries that verified before the first failure.
    pub fn verified(&self) -> usize {
        match self.failed_at {
            Some(at) => at.saturating_sub(1),
            None => self.checked,
        }
    }

    fn fail(at: usize, reason: IntegrityFailure) -> Self {
        Self {
            checked: at,
            failed_at: Some(at),
            reason: Some(reason),
        }
    }
}

impl std::fmt::Display for ChainVerification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.failed_at, self.reason) {
            (Some(at), Some(reason)) => write!(
                f,
                "verified {} entries, failed at entry {at}, reason {reason}",
                self.verified()
            ),
            _ => write!(f, "verified {} entries", self.checked),
        }
    }
}

/// What an append wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendReceipt {
    pub ts: String,
    pub entry: Option<CustodySignedEntry>,
}

pub struct CustodyLedger {
    fs: Arc<dyn WorkspaceFs>,
    path: String,
    key: Option<SigningKey>,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for CustodyLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustodyLedger")
            .field("path", &self.path)
            .field("signing", &self.key.is_some())
            .finish()
    }
}

fn non_empty_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines().map(str::trim_end).filter(|l| !l.is_empty())
}

/// Last parseable `entryHash`, scanning backwards over malformed lines.
fn last_entry_hash(text: &str) -> Option<String> {
    let lines: Vec<&str> = non_empty_lines(text).collect();
    lines.iter().rev().find_map(|line| {
        let row: Value = serde_json::from_str(line).ok()?;
        row.get("entryHash")?
            .as_str()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(String::from)
    })
}

impl CustodyLedger {
    /// `key: None` writes unsigned records.
    pub fn new(fs: Arc<dyn WorkspaceFs>, path: impl Into<String>, key: Option<SigningKey>) -> Self {
        Self {
            fs,
            path: path.into(),
            key,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_signing(&self) -> bool {
        self.key.is_some()
    }

    /// Append one record, chained to the current tail when signing.
    pub async fn append(&self, event: &LedgerEvent) -> Result<AppendReceipt, LedgerError> {
        let _guard = self.write_lock.lock().await;

        let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let mut payload = match serde_json::to_value(event)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        payload.insert("ts".into(), Value::String(ts.clone()));

        let mut line = payload.clone();
        let entry = match &self.key {
            Some(key) => {
                let existing = self.fs.read_to_string(&self.path).await?.unwrap_or_default();
                let prev = last_entry_hash(&existing).unwrap_or_else(|| GENESIS.to_string());
                let signed = build_signed_entry(&Value::Object(payload), &prev, key)?;
                if let Value::Object(fields) = serde_json::to_value(&signed)? {
                    line.extend(fields);
                }
                Some(signed)
            }
            None => None,
        };

        let mut text = serde_json::to_string(&Value::Object(line))?;
        text.push('\n');
        self.fs.append(&self.path, &text).await?;

        debug!(
            kind = event.kind(),
            chain_id = %event.chain_id(),
            signed = entry.is_some(),
            "custody record appended"
        );
        Ok(AppendReceipt { ts, entry })
    }

    /// Raw non-empty lines. A missing file is an empty ledger.
    pub async fn read_lines(&self) -> Result<Vec<String>, LedgerError> {
        let text = self.fs.read_to_string(&self.path).await?.unwrap_or_default();
        Ok(non_empty_lines(&text).map(String::from).collect())
    }

    /// The last `window` lines that parse as known records.
    pub async fn read_records(&self, window: usize) -> Result<Vec<LedgerRecord>, LedgerError> {
        let lines = self.read_lines().await?;
        let start = lines.len().saturating_sub(window);
        Ok(lines[start..]
            .iter()
            .filter_map(|l| serde_json::from_str::<LedgerRecord>(l).ok())
            .collect())
    }

    /// Walk the chain from genesis, expecting each entry to chain from the
    /// recomputed hash of the one before. Stops at the first failure.
    pub async fn verify(&self) -> Result<ChainVerification, LedgerError> {
        let lines = self.read_lines().await?;
        let Some(key) = &self.key else {
            return Ok(ChainVerification {
                checked: lines.len(),
                failed_at: None,
                reason: None,
            });
        };

        let mut prev = GENESIS.to_string();
        for (idx, line) in lines.iter().enumerate() {
            let at = idx + 1;
            let Ok(Value::Object(mut row)) = serde_json::from_str::<Value>(line) else {
                warn!(line = at, "custody ledger line is not a JSON object");
                return Ok(ChainVerification::fail(at, IntegrityFailure::InvalidJson));
            };

            let mut take = |field: &str| match row.remove(field) {
                Some(Value::String(s)) => s,
                _ => String::new(),
            };
            let entry = CustodySignedEntry {
                prev_hash: take("prevHash"),
                payload_hash: take("payloadHash"),
                signature: take("signature"),
                entry_hash: take("entryHash"),
            };

            if !verify_signed_entry(&Value::Object(row), &entry, &prev, key) {
                warn!(line = at, "custody ledger signature mismatch");
                return Ok(ChainVerification::fail(at, IntegrityFailure::SignatureMismatch));
            }
            prev = entry.entry_hash;
        }

        Ok(ChainVerification {
            checked: lines.len(),
            failed_at: None,
            reason: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custody::record::{ApplyResultRecord, RollbackResultRecord};
    use crate::ports::MemoryWorkspaceFs;

    fn ledger(fs: &MemoryWorkspaceFs, signed: bool) -> CustodyLedger {
        let key = signed.then(|| SigningKey::from_hex("abcdef0123456789").unwrap());
        CustodyLedger::new(Arc::new(fs.clone()), DEFAULT_LEDGER_FILE, key)
    }

    fn apply(chain: &str, files: usize) -> LedgerEvent {
        LedgerEvent::ApplyResult(ApplyResultRecord {
            chain_id: chain.into(),
            applied_files: files,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn missing_file_verifies_empty() {
        let fs = MemoryWorkspaceFs::new();
        let v = ledger(&fs, true).verify().await.unwrap();
        assert!(v.is_ok());
        assert_eq!(v.checked, 0);
        assert_eq!(v.to_string(), "verified 0 entries");
    }

    #[tokio::test]
    async fn appended_entries_chain_and_verify() {
        let fs = MemoryWorkspaceFs::new();
        let l = ledger(&fs, true);
        let first = l.append(&apply("a", 1)).await.unwrap().entry.unwrap();
        let second = l.append(&apply("b", 2)).await.unwrap().entry.unwrap();
        assert_eq!(first.prev_hash, GENESIS);
        assert_eq!(second.prev_hash, first.entry_hash);

        let v = l.verify().await.unwrap();
        assert!(v.is_ok());
        assert_eq!(v.checked, 2);
    }

    #[tokio::test]
    async fn tampered_payload_fails_at_that_line() {
        let fs = MemoryWorkspaceFs::new();
        let l = ledger(&fs, true);
        for i in 0..3 {
            l.append(&apply("c", i)).await.unwrap();
        }
        let text = fs.read_to_string(DEFAULT_LEDGER_FILE).await.unwrap().unwrap();
        let tampered = text.replacen("\"appliedFiles\":1", "\"appliedFiles\":9", 1);
        assert_ne!(text, tampered);
        fs.write(DEFAULT_LEDGER_FILE, &tampered).await.unwrap();

        let v = l.verify().await.unwrap();
        assert_eq!(v.failed_at, Some(2));
        assert_eq!(v.reason, Some(IntegrityFailure::SignatureMismatch));
        assert_eq!(
            v.to_string(),
            "verified 1 entries, failed at entry 2, reason signature_mismatch"
        );
    }

    async fn four_entry_lines(fs: &MemoryWorkspaceFs, l: &CustodyLedger) -> Vec<String> {
        for i in 0..4 {
            l.append(&apply(&format!("s{i}"), 1)).await.unwrap();
        }
        let text = fs.read_to_string(DEFAULT_LEDGER_FILE).await.unwrap().unwrap();
        text.lines().map(String::from).collect()
    }

    async fn rewrite(fs: &MemoryWorkspaceFs, lines: &[String]) {
        fs.write(DEFAULT_LEDGER_FILE, &format!("{}\n", lines.join("\n")))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn swapped_lines_fail_at_first_swapped() {
        let fs = MemoryWorkspaceFs::new();
        let l = ledger(&fs, true);
        let mut lines = four_entry_lines(&fs, &l).await;
        lines.swap(1, 2);
        rewrite(&fs, &lines).await;

        let v = l.verify().await.unwrap();
        assert_eq!(v.failed_at, Some(2));
        assert_eq!(v.checked, 2);
        assert_eq!(v.reason, Some(IntegrityFailure::SignatureMismatch));
    }

    #[tokio::test]
    async fn edited_prev_hash_fails_at_that_line() {
        let fs = MemoryWorkspaceFs::new();
        let l = ledger(&fs, true);
        let mut lines = four_entry_lines(&fs, &l).await;
        let mut row: Value = serde_json::from_str(&lines[2]).unwrap();
        row["prevHash"] = Value::String("0".repeat(64));
        lines[2] = serde_json::to_string(&row).unwrap();
        rewrite(&fs, &lines).await;

        let v = l.verify().await.unwrap();
        assert_eq!(v.failed_at, Some(3));
        assert_eq!(v.verified(), 2);
    }

    #[tokio::test]
    async fn removed_middle_line_fails_at_its_successor() {
        let fs = MemoryWorkspaceFs::new();
        let l = ledger(&fs, true);
        let mut lines = four_entry_lines(&fs, &l).await;
        lines.remove(1);
        rewrite(&fs, &lines).await;

        // the old third entry now sits at line 2 and no longer chains
        let v = l.verify().await.unwrap();
        assert_eq!(v.failed_at, Some(2));
        assert_eq!(v.verified(), 1);
    }

    #[tokio::test]
    async fn garbage_line_is_invalid_json() {
        let fs = MemoryWorkspaceFs::new();
        let l = ledger(&fs, true);
        l.append(&apply("c", 1)).await.unwrap();
        fs.append(DEFAULT_LEDGER_FILE, "not json\n").await.unwrap();
        let v = l.verify().await.unwrap();
        assert_eq!(v.failed_at, Some(2));
        assert_eq!(v.reason, Some(IntegrityFailure::InvalidJson));
    }

    #[tokio::test]
    async fn unsigned_ledger_counts_lines() {
        let fs = MemoryWorkspaceFs::new();
        let l = ledger(&fs, false);
        let receipt = l.append(&apply("u", 1)).await.unwrap();
        assert!(receipt.entry.is_none());
        let line = &l.read_lines().await.unwrap()[0];
        assert!(!line.contains("entryHash"));
        assert_eq!(l.verify().await.unwrap().checked, 1);
    }

    #[tokio::test]
    async fn tail_skips_malformed_lines() {
        let fs = MemoryWorkspaceFs::new();
        let l = ledger(&fs, true);
        let first = l.append(&apply("a", 1)).await.unwrap().entry.unwrap();
        fs.append(DEFAULT_LEDGER_FILE, "{broken\n").await.unwrap();
        let second = l.append(&apply("b", 1)).await.unwrap().entry.unwrap();
        assert_eq!(second.prev_hash, first.entry_hash);
    }

    #[tokio::test]
    async fn concurrent_appends_never_share_a_tail() {
        let fs = MemoryWorkspaceFs::new();
        let l = Arc::new(ledger(&fs, true));
        let mut handles = Vec::new();
        for i in 0..16 {
            let l = Arc::clone(&l);
            handles.push(tokio::spawn(async move {
                l.append(&LedgerEvent::RollbackResult(RollbackResultRecord {
                    chain_id: format!("r{i}"),
                    rolled_back_files: 1,
                    failed_files: vec![],
                }))
                .await
                .unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let v = l.verify().await.unwrap();
        assert!(v.is_ok());
        assert_eq!(v.checked, 16);
    }

    #[tokio::test]
    async fn read_records_applies_window() {
        let fs = MemoryWorkspaceFs::new();
        let l = ledger(&fs, true);
        for i in 0..5 {
            l.append(&apply(&format!("w{i}"), 1)).await.unwrap();
        }
        let recent = l.read_records(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].event.chain_id(), "w3");
    }
}
