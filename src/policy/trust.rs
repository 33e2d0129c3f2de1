//! Per-domain trust scores from historical outcomes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Score used when none of the touched domains has history.
pub const NEUTRAL_TRUST: u8 = 50;

/// Recent outcomes for one domain, derived from the custody ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainHistoryMetrics {
    pub samples: i64,
    pub rollback_rate_pct: f64,
    pub validate_success_rate_pct: f64,
}

fn clamp_pct(v: f64) -> f64 {
    if v.is_finite() {
        v.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

/// `50 + validate*0.3 + (100 - rollback)*0.4 + min(20, samples*2) - 40`,
/// rounded and clamped to 0..=100. Few samples keep the score low.
pub fn compute_domain_trust_score(metrics: &DomainHistoryMetrics) -> u8 {
    let samples = metrics.samples.max(0) as f64;
    let rollback = clamp_pct(metrics.rollback_rate_pct);
    let validate = clamp_pct(metrics.validate_success_rate_pct);
    let sample_bonus = (samples * 2.0).min(20.0);
    let score = 50.0 + validate * 0.3 + (100.0 - rollback) * 0.4 + sample_bonus - 40.0;
    score.round().clamp(0.0, 100.0) as u8
}

pub fn trust_by_domain(metrics: &BTreeMap<String, DomainHistoryMetrics>) -> BTreeMap<String, u8> {
    metrics
        .iter()
        .map(|(domain, m)| (domain.clone(), compute_domain_trust_score(m)))
        .collect()
}

/// Worst score among `domains`, or [`NEUTRAL_TRUST`] if none is scored.
pub fn min_trust_for_domains<S: AsRef<str>>(domains: &[S], trust: &BTreeMap<String, u8>) -> u8 {
    domains
        .iter()
        .filter_map(|d| trust.get(d.as_ref()).copied())
        .min()
        .unwrap_or(NEUTRAL_TRUST)
}
