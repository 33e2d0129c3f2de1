//! Governance history derived from recent ledger records.
//!
//! A chain counts as applied when its `apply_result` wrote at least one file,
//! and as rolled back when a `rollback_result` restored at least one file.
//! Domains are taken from the latest record of the chain that carries any.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::record::{LedgerEvent, LedgerRecord};
use crate::policy::DomainHistoryMetrics;

/// Number of trailing ledger lines considered.
pub const DEFAULT_HISTORY_WINDOW: usize = 2000;

/// At most this many block causes per verdict feed the heatmap.
const HEATMAP_CAUSES_PER_VERDICT: usize = 4;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeatmapRow {
    pub domain: String,
    pub attempts: usize,
    pub block_rate_pct: f64,
    pub override_rate_pct: f64,
    pub rollback_rate_pct: f64,
    pub validate_rate_pct: f64,
    pub top_block_cause: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GovernanceStats {
    pub domain_metrics: BTreeMap<String, DomainHistoryMetrics>,
    pub applied_chains: usize,
    pub rolled_back_chains: usize,
    pub heatmap: Vec<HeatmapRow>,
}

impl GovernanceStats {
    /// Share of applied chains later rolled back, 0 when nothing applied.
    pub fn global_rollback_rate_pct(&self) -> f64 {
        if self.applied_chains == 0 {
            0.0
        } else {
            self.rolled_back_chains as f64 / self.applied_chains as f64 * 100.0
        }
    }
}

#[derive(Default)]
struct DomainTally {
    attempts: usize,
    blocked: usize,
    overrides: usize,
    applied: usize,
    rolled_back: usize,
    validated: usize,
    validated_ok: usize,
    causes: BTreeMap<String, usize>,
}

fn pct(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64 * 100.0
    }
}

pub fn derive_stats(records: &[LedgerRecord]) -> GovernanceStats {
    let mut chain_domains: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    let mut applied: BTreeSet<&str> = BTreeSet::new();
    let mut rolled_back: BTreeSet<&str> = BTreeSet::new();
    let mut validated: BTreeMap<&str, bool> = BTreeMap::new();
    let mut tallies: BTreeMap<String, DomainTally> = BTreeMap::new();

    for record in records {
        let chain = record.event.chain_id();
        if chain.is_empty() {
            continue;
        }
        let domains: Vec<String> = record
            .event
            .domains()
            .iter()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .collect();
        if !domains.is_empty() {
            chain_domains.insert(chain, domains.clone());
        }

        match &record.event {
            LedgerEvent::PolicyVerdict(v) => {
                for d in &domains {
                    let t = tallies.entry(d.clone()).or_default();
                    t.attempts += 1;
                    t.blocked += usize::from(v.blocked);
                    t.overrides += usize::from(v.override_used);
                    for cause in v.blocked_by.iter().take(HEATMAP_CAUSES_PER_VERDICT) {
                        *t.causes.entry(cause.clone()).or_default() += 1;
                    }
                }
            }
            LedgerEvent::ApplyResult(r) if r.applied_files > 0 => {
                applied.insert(chain);
            }
            LedgerEvent::RollbackResult(r) if r.rolled_back_files > 0 => {
                rolled_back.insert(chain);
            }
            LedgerEvent::ValidateResult(r) => {
                validated.insert(chain, r.ok);
            }
            _ => {}
        }
    }

    let mut history: BTreeMap<String, (usize, usize, usize, usize)> = BTreeMap::new();
    for chain in &applied {
        for d in chain_domains.get(chain).into_iter().flatten() {
            let h = history.entry(d.clone()).or_default();
            h.0 += 1;
            if rolled_back.contains(chain) {
                h.1 += 1;
            }
            if let Some(ok) = validated.get(chain) {
                h.2 += 1;
                h.3 += usize::from(*ok);
            }
            tallies.entry(d.clone()).or_default().applied += 1;
        }
    }
    for chain in &rolled_back {
        for d in chain_domains.get(chain).into_iter().flatten() {
            tallies.entry(d.clone()).or_default().rolled_back += 1;
        }
    }
    for (chain, ok) in &validated {
        for d in chain_domains.get(chain).into_iter().flatten() {
            let t = tallies.entry(d.clone()).or_default();
            t.validated += 1;
            t.validated_ok += usize::from(*ok);
        }
    }

    let domain_metrics = history
        .into_iter()
        .map(|(domain, (samples, rollbacks, validate_total, validate_ok))| {
            let metrics = DomainHistoryMetrics {
                samples: samples as i64,
                rollback_rate_pct: pct(rollbacks, samples),
                validate_success_rate_pct: if validate_total == 0 {
                    100.0
                } else {
                    pct(validate_ok, validate_total)
                },
            };
            (domain, metrics)
        })
        .collect();

    let heatmap = tallies
        .into_iter()
        .map(|(domain, t)| {
            let top_block_cause = t
                .causes
                .iter()
                .fold(None::<(&String, usize)>, |best, (cause, n)| match best {
                    Some((_, m)) if m >= *n => best,
                    _ => Some((cause, *n)),
                })
                .map(|(cause, _)| cause.clone());
            HeatmapRow {
                domain,
                attempts: t.attempts,
                block_rate_pct: pct(t.blocked, t.attempts).round(),
                override_rate_pct: pct(t.overrides, t.attempts).round(),
                rollback_rate_pct: pct(t.rolled_back, t.applied).round(),
                validate_rate_pct: pct(t.validated_ok, t.validated).round(),
                top_block_cause,
            }
        })
        .collect();

    GovernanceStats {
        domain_metrics,
        applied_chains: applied.len(),
        rolled_back_chains: rolled_back.iter().filter(|c| applied.contains(*c)).count(),
        heatmap,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custody::record::{
        ApplyResultRecord, PolicyVerdictRecord, RollbackResultRecord, ValidateResultRecord,
    };

    fn rec(event: LedgerEvent) -> LedgerRecord {
        LedgerRecord {
            ts: String::new(),
            event,
        }
    }

    fn attempt(chain: &str, domains: &[&str], rolled_back: bool, validated: Option<bool>) -> Vec<LedgerRecord> {
        let domains: Vec<String> = domains.iter().map(|d| d.to_string()).collect();
        let mut out = vec![
            rec(LedgerEvent::PolicyVerdict(PolicyVerdictRecord {
                chain_id: chain.into(),
                domains: domains.clone(),
                ..Default::default()
            })),
            rec(LedgerEvent::ApplyResult(ApplyResultRecord {
                chain_id: chain.into(),
                applied_files: 1,
                domains,
                ..Default::default()
            })),
        ];
        if rolled_back {
            out.push(rec(LedgerEvent::RollbackResult(RollbackResultRecord {
                chain_id: chain.into(),
                rolled_back_files: 1,
                failed_files: vec![],
            })));
        }
        if let Some(ok) = validated {
            out.push(rec(LedgerEvent::ValidateResult(ValidateResultRecord {
                chain_id: chain.into(),
                ok,
                ..Default::default()
            })));
        }
        out
    }

    #[test]
    fn domain_rates_from_applied_chains() {
        let mut records = Vec::new();
        records.extend(attempt("1", &["ui"], true, Some(false)));
        records.extend(attempt("2", &["ui"], false, Some(true)));
        records.extend(attempt("3", &["ui"], false, None));
        records.extend(attempt("4", &["ui"], true, Some(false)));

        let stats = derive_stats(&records);
        let ui = stats.domain_metrics["ui"];
        assert_eq!(ui.samples, 4);
        assert_eq!(ui.rollback_rate_pct, 50.0);
        assert!((ui.validate_success_rate_pct - 100.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.global_rollback_rate_pct(), 50.0);
    }

    #[test]
    fn unvalidated_domain_defaults_to_full_success() {
        let stats = derive_stats(&attempt("x", &["infra"], false, None));
        assert_eq!(stats.domain_metrics["infra"].validate_success_rate_pct, 100.0);
    }

    #[test]
    fn noop_applies_are_not_samples() {
        let records = vec![rec(LedgerEvent::ApplyResult(ApplyResultRecord {
            chain_id: "n".into(),
            applied_files: 0,
            domains: vec!["ui".into()],
            ..Default::default()
        }))];
        let stats = derive_stats(&records);
        assert!(stats.domain_metrics.is_empty());
        assert_eq!(stats.global_rollback_rate_pct(), 0.0);
    }

    #[test]
    fn heatmap_counts_blocks_and_top_cause() {
        let verdict = |chain: &str, blocked: bool, causes: &[&str]| {
            rec(LedgerEvent::PolicyVerdict(PolicyVerdictRecord {
                chain_id: chain.into(),
                blocked,
                domains: vec!["migrations".into()],
                blocked_by: causes.iter().map(|c| c.to_string()).collect(),
                ..Default::default()
            }))
        };
        let records = vec![
            verdict("a", true, &["domain:migrations:maxPatchLines"]),
            verdict("b", true, &["domain:migrations:maxPatchLines", "rule:x"]),
            verdict("c", false, &[]),
            verdict("d", true, &["rule:x", "rule:x"]),
        ];
        let stats = derive_stats(&records);
        let row = &stats.heatmap[0];
        assert_eq!(row.domain, "migrations");
        assert_eq!(row.attempts, 4);
        assert_eq!(row.block_rate_pct, 75.0);
        assert_eq!(row.top_block_cause.as_deref(), Some("rule:x"));
    }
}
