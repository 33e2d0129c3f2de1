//! Typed ledger records.
//!
//! On disk each record is one JSON object with a `type` tag, a `chainId`
//! grouping the records of one attempt, a `ts`, the type-specific fields and,
//! when signing is on, the four chain fields. Field names are camelCase.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicyVerdictRecord {
    pub chain_id: String,
    pub source_hash: String,
    pub blocked: bool,
    pub canceled: bool,
    pub risk: f64,
    pub threshold: f64,
    pub domains: Vec<String>,
    pub min_trust_score: u8,
    pub blocked_by: Vec<String>,
    pub reasons: Vec<String>,
    pub override_used: bool,
    pub justification: String,
    pub actor_id: String,
    pub approver_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApplyResultRecord {
    pub chain_id: String,
    pub source_hash: String,
    pub applied_files: usize,
    pub conflicts: Vec<String>,
    pub failed_files: Vec<String>,
    pub override_used: bool,
    pub justification: String,
    pub actor_id: String,
    pub approver_id: String,
    pub min_trust_score: u8,
    pub risk: f64,
    pub threshold: f64,
    pub domains: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RollbackResultRecord {
    pub chain_id: String,
    pub rolled_back_files: usize,
    pub failed_files: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ValidateResultRecord {
    pub chain_id: String,
    pub ok: bool,
    pub duration_ms: u64,
    pub output_preview: String,
}

/// Outcome reported by an external source-control step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GitProvenanceRecord {
    pub chain_id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_files: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    PolicyVerdict(PolicyVerdictRecord),
    ApplyResult(ApplyResultRecord),
    RollbackResult(RollbackResultRecord),
    ValidateResult(ValidateResultRecord),
    GitProvenance(GitProvenanceRecord),
}

impl LedgerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PolicyVerdict(_) => "policy_verdict",
            Self::ApplyResult(_) => "apply_result",
            Self::RollbackResult(_) => "rollback_result",
            Self::ValidateResult(_) => "validate_result",
            Self::GitProvenance(_) => "git_provenance",
        }
    }

    pub fn chain_id(&self) -> &str {
        match self {
            Self::PolicyVerdict(r) => &r.chain_id,
            Self::ApplyResult(r) => &r.chain_id,
            Self::RollbackResult(r) => &r.chain_id,
            Self::ValidateResult(r) => &r.chain_id,
            Self::GitProvenance(r) => &r.chain_id,
        }
    }

    /// Domains carried by the record, if its type has any.
    pub fn domains(&self) -> &[String] {
        match self {
            Self::PolicyVerdict(r) => &r.domains,
            Self::ApplyResult(r) => &r.domains,
            _ => &[],
        }
    }
}

/// A record read back from the ledger file. Chain fields are ignored here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    #[serde(default)]
    pub ts: String,
    #[serde(flatten)]
    pub event: LedgerEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_are_tagged_and_camel_cased() {
        let event = LedgerEvent::RollbackResult(RollbackResultRecord {
            chain_id: "abc".into(),
            rolled_back_files: 2,
            failed_files: vec![],
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "rollback_result");
        assert_eq!(value["chainId"], "abc");
        assert_eq!(value["rolledBackFiles"], 2);
    }

    #[test]
    fn record_reads_signed_line_and_tolerates_missing_fields() {
        let line = json!({
            "ts": "2026-01-01T00:00:00Z",
            "type": "apply_result",
            "chainId": "c1",
            "appliedFiles": 3,
            "prevHash": "GENESIS",
            "entryHash": "ff"
        });
        let rec: LedgerRecord = serde_json::from_value(line).unwrap();
        assert_eq!(rec.event.kind(), "apply_result");
        assert_eq!(rec.event.chain_id(), "c1");
        match rec.event {
            LedgerEvent::ApplyResult(r) => {
                assert_eq!(r.applied_files, 3);
                assert!(r.domains.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_type_does_not_parse() {
        let line = json!({"type": "telemetry", "chainId": "x"});
        assert!(serde_json::from_value::<LedgerRecord>(line).is_err());
    }

    #[test]
    fn provenance_skips_absent_fields() {
        let event = LedgerEvent::GitProvenance(GitProvenanceRecord {
            chain_id: "c".into(),
            ok: false,
            reason: Some("not_git_repo".into()),
            ..Default::default()
        });
        let value = serde_json::to_value(&event).unwrap();
        assert!(value.get("branch").is_none());
        assert_eq!(value["reason"], "not_git_repo");
    }
}
