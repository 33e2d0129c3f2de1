//! Policy evaluation.
//!
//! [`evaluate_policy`] is pure and never fails: malformed input shows up as a
//! blocked verdict or extra risk, never as an error. Checks run in a fixed
//! order and each one appends to the human-readable reason trail:
//!
//! 1. forbidden paths (unconditional block)
//! 2. block / warn rules
//! 3. large-patch file count
//! 4. global required tests (+30 when none touched)
//! 5. per matched domain, lexical order: override veto, domain tests (+25),
//!    max changed lines (block), risk multiplier (upward only)
//! 6. per matched domain with history: auto-suspend (block) or added risk

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::config::{PolicyConfig, RuleAction};
use super::glob::{normalize_policy_path, Glob, GlobSet};
use super::trust::DomainHistoryMetrics;

/// Risk added when no touched path matches a required-test pattern.
pub const MISSING_TESTS_RISK: f64 = 30.0;
/// Risk added when a matched domain's own test patterns are not touched.
pub const MISSING_DOMAIN_TESTS_RISK: f64 = 25.0;
/// Default risk of a `warn` rule without an explicit weight.
pub const DEFAULT_WARN_RISK: f64 = 10.0;

/// Minimum domain samples before history affects the verdict.
pub const HISTORY_MIN_SAMPLES: i64 = 3;
/// Minimum domain samples before a domain can be auto-suspended.
pub const SUSPEND_MIN_SAMPLES: i64 = 5;
pub const ROLLBACK_ALERT_PCT: f64 = 30.0;
pub const VALIDATE_ALERT_PCT: f64 = 60.0;

/// Why a verdict is unconditionally blocked. None of these is overridable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockCause {
    ForbiddenPath { path: String },
    Rule { pattern: String },
    DomainMaxPatchLines { domain: String },
    DomainAutoSuspend { domain: String },
}

impl BlockCause {
    /// Compact code stored in ledger records.
    pub fn code(&self) -> String {
        match self {
            Self::ForbiddenPath { path } => format!("forbidden_path:{path}"),
            Self::Rule { pattern } => format!("rule:{pattern}"),
            Self::DomainMaxPatchLines { domain } => format!("domain:{domain}:maxPatchLines"),
            Self::DomainAutoSuspend { domain } => format!("domain:{domain}:auto_suspend"),
        }
    }

    /// Category label, without the subject.
    pub fn category(&self) -> &'static str {
        match self {
            Self::ForbiddenPath { .. } => "forbidden_path",
            Self::Rule { .. } => "rule",
            Self::DomainMaxPatchLines { .. } => "domain_max_patch_lines",
            Self::DomainAutoSuspend { .. } => "domain_auto_suspend",
        }
    }
}

impl std::fmt::Display for BlockCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarnMatch {
    pub pattern: String,
    pub reason: String,
    pub risk: f64,
}

/// Optional history fed into evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicyEvaluationContext {
    pub patch_lines_by_path: BTreeMap<String, usize>,
    pub domain_metrics: BTreeMap<String, DomainHistoryMetrics>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyVerdict {
    pub blocked: bool,
    /// Unclamped; may exceed 100
    pub risk_score: f64,
    pub threshold: f64,
    pub reasons: Vec<String>,
    pub matched_forbidden: Vec<String>,
    pub missing_required_tests: Vec<String>,
    pub warn_matches: Vec<WarnMatch>,
    pub blocked_by: Vec<BlockCause>,
    pub matched_domains: Vec<String>,
    /// AND across matched domains
    pub override_allowed: bool,
}

impl PolicyVerdict {
    pub fn block_codes(&self) -> Vec<String> {
        self.blocked_by.iter().map(BlockCause::code).collect()
    }
}

/// Normalize and dedupe, keeping first-seen order.
pub fn normalize_paths<S: AsRef<str>>(paths: &[S]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    paths
        .iter()
        .map(|p| normalize_policy_path(p.as_ref()))
        .filter(|p| !p.is_empty() && seen.insert(p.clone()))
        .collect()
}

/// Names of domains with at least one pattern matching a touched path.
pub fn match_domains<S: AsRef<str>>(paths: &[S], cfg: &PolicyConfig) -> Vec<String> {
    let normalized = normalize_paths(paths);
    cfg.domains
        .iter()
        .filter(|(_, domain)| GlobSet::new(&domain.path_patterns).matches_any(&normalized))
        .map(|(name, _)| name.clone())
        .collect()
}

/// An empty pattern list counts as satisfied.
fn tests_satisfied(paths: &[String], patterns: &[String]) -> bool {
    let set = GlobSet::new(patterns);
    set.is_empty() || set.matches_any(paths)
}

fn push_unique(target: &mut Vec<String>, items: &[String]) {
    for item in items {
        if !target.contains(item) {
            target.push(item.clone());
        }
    }
}

fn block(cause: BlockCause, blocked_by: &mut Vec<BlockCause>) {
    if !blocked_by.contains(&cause) {
        blocked_by.push(cause);
    }
}

pub fn evaluate_policy<S: AsRef<str>>(
    paths: &[S],
    cfg: &PolicyConfig,
    ctx: &PolicyEvaluationContext,
) -> PolicyVerdict {
    let normalized = normalize_paths(paths);
    let mut reasons = Vec::new();
    let mut matched_forbidden = Vec::new();
    let mut missing_required_tests = Vec::new();
    let mut warn_matches = Vec::new();
    let mut blocked_by: Vec<BlockCause> = Vec::new();
    let mut risk = 0.0_f64;
    let mut override_allowed = true;

    let matched_domains = match_domains(&normalized, cfg);

    // ── Forbidden paths ──
    let forbidden = GlobSet::new(&cfg.forbidden_patterns);
    for path in &normalized {
        if forbidden.is_match(path) {
            matched_forbidden.push(path.clone());
            reasons.push(format!("Forbidden path matched: {path}"));
            block(BlockCause::ForbiddenPath { path: path.clone() }, &mut blocked_by);
        }
    }

    // ── Rules ──
    for rule in &cfg.rules {
        let Some(glob) = Glob::new(&rule.pattern) else {
            continue;
        };
        if !normalized.iter().any(|p| glob.is_match(p)) {
            continue;
        }
        match rule.action {
            RuleAction::Block => {
                reasons.push(format!("Blocked by policy rule: {}", rule.pattern));
                block(
                    BlockCause::Rule {
                        pattern: rule.pattern.clone(),
                    },
                    &mut blocked_by,
                );
            }
            RuleAction::Warn => {
                let extra = rule
                    .risk
                    .filter(|r| r.is_finite())
                    .map_or(DEFAULT_WARN_RISK, |r| r.max(0.0));
                risk += extra;
                warn_matches.push(WarnMatch {
                    pattern: rule.pattern.clone(),
                    reason: rule
                        .reason
                        .clone()
                        .unwrap_or_else(|| "Policy warning rule matched".to_string()),
                    risk: extra,
                });
                reasons.push(format!(
                    "Warning rule matched: {} (+{})",
                    rule.pattern,
                    extra
                ));
            }
        }
    }

    // ── Size and tests ──
    if normalized.len() >= cfg.large_patch_files {
        risk += cfg.large_patch_risk;
        reasons.push(format!(
            "Large patch touched {} files (+{})",
            normalized.len(),
            cfg.large_patch_risk
        ));
    }

    if !tests_satisfied(&normalized, &cfg.required_test_patterns) {
        push_unique(&mut missing_required_tests, &cfg.required_test_patterns);
        risk += MISSING_TESTS_RISK;
        reasons.push("No required test pattern matched (+30)".to_string());
    }

    // ── Domains ──
    for name in &matched_domains {
        let Some(domain) = cfg.domains.get(name) else {
            continue;
        };
        let domain_globs = GlobSet::new(&domain.path_patterns);

        if !domain.override_allowed {
            override_allowed = false;
            reasons.push(format!("Domain {name} forbids override"));
        }

        if let Some(tests) = domain.required_test_patterns.as_ref().filter(|t| !t.is_empty()) {
            if !tests_satisfied(&normalized, tests) {
                push_unique(&mut missing_required_tests, tests);
                risk += MISSING_DOMAIN_TESTS_RISK;
                reasons.push(format!("Domain {name} missing required tests (+25)"));
            }
        }

        if let Some(max) = domain.max_patch_lines {
            let lines: usize = normalized
                .iter()
                .filter(|p| domain_globs.is_match(p))
                .map(|p| ctx.patch_lines_by_path.get(p).copied().unwrap_or(0))
                .sum();
            if lines > max {
                reasons.push(format!("Domain {name} patch lines {lines} > {max}"));
                block(
                    BlockCause::DomainMaxPatchLines {
                        domain: name.clone(),
                    },
                    &mut blocked_by,
                );
            }
        }

        if let Some(m) = domain.risk_multiplier.filter(|m| *m > 0.0 && *m != 1.0) {
            let boosted = (risk * m).round();
            if boosted > risk {
                reasons.push(format!(
                    "Domain {name} risk multiplier x{m:.2} ({} -> {})",
                    risk,
                    boosted
                ));
                risk = boosted;
            }
        }

        // ── History ──
        let Some(dm) = ctx.domain_metrics.get(name) else {
            continue;
        };
        if dm.samples < HISTORY_MIN_SAMPLES {
            continue;
        }
        let rollback = dm.rollback_rate_pct;
        let validate = dm.validate_success_rate_pct;
        if dm.samples >= SUSPEND_MIN_SAMPLES
            && rollback > ROLLBACK_ALERT_PCT
            && validate < VALIDATE_ALERT_PCT
        {
            reasons.push(format!(
                "Domain {name} auto-suspended (rollback {}%, validate {}%)",
                rollback.round(),
                validate.round()
            ));
            block(
                BlockCause::DomainAutoSuspend {
                    domain: name.clone(),
                },
                &mut blocked_by,
            );
            continue;
        }
        if rollback > ROLLBACK_ALERT_PCT {
            let add = ((rollback - ROLLBACK_ALERT_PCT) * 0.6).round();
            if add > 0.0 {
                risk += add;
                reasons.push(format!(
                    "Domain {name} rollback rate {}% (+{})",
                    rollback.round(),
                    add
                ));
            }
        }
        if validate < VALIDATE_ALERT_PCT {
            let add = ((VALIDATE_ALERT_PCT - validate) * 0.5).round();
            if add > 0.0 {
                risk += add;
                reasons.push(format!(
                    "Domain {name} validation success {}% (+{})",
                    validate.round(),
                    add
                ));
            }
        }
    }

    PolicyVerdict {
        blocked: !blocked_by.is_empty(),
        risk_score: risk,
        threshold: cfg.risk_threshold,
        reasons,
        matched_forbidden,
        missing_required_tests,
        warn_matches,
        blocked_by,
        matched_domains,
        override_allowed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::config::{DomainPolicy, PolicyLayer};

    fn eval(paths: &[&str], cfg: &PolicyConfig) -> PolicyVerdict {
        evaluate_policy(paths, cfg, &PolicyEvaluationContext::default())
    }

    #[test]
    fn forbidden_env_blocks() {
        let v = eval(&[".env"], &PolicyConfig::default());
        assert!(v.blocked);
        assert_eq!(v.matched_forbidden, vec![".env"]);
        assert_eq!(v.block_codes(), vec!["forbidden_path:.env"]);
    }

    #[test]
    fn dotted_and_doubled_paths_still_match() {
        let v = eval(&["./.env", "src/a.test.ts"], &PolicyConfig::default());
        assert!(v.blocked);
        assert_eq!(v.block_codes(), vec!["forbidden_path:.env"]);

        let v = eval(&["src//auth/x.ts"], &PolicyConfig::default());
        assert_eq!(v.matched_domains, vec!["auth"]);
        assert!(!v.override_allowed);
    }

    #[test]
    fn control_files_are_forbidden_by_default() {
        let v = eval(
            &[
                ".patch_policies.json",
                "./.patch_custody_chain.jsonl",
                ".custody/signing.key",
                "src/a.test.ts",
            ],
            &PolicyConfig::default(),
        );
        assert!(v.blocked);
        assert_eq!(
            v.matched_forbidden,
            vec![
                ".patch_policies.json",
                ".patch_custody_chain.jsonl",
                ".custody/signing.key",
            ]
        );
        assert!(v.override_allowed);

        let v = eval(&["docs/.patch_policies.md", "src/a.test.ts"], &PolicyConfig::default());
        assert!(!v.blocked);
    }

    #[test]
    fn warn_rule_and_large_patch_add_risk() {
        let cfg = PolicyConfig::default().merge(&PolicyLayer {
            large_patch_files: Some(2.0),
            large_patch_risk: Some(25.0),
            ..Default::default()
        });
        let v = eval(&["package.json", "src/a.ts"], &cfg);
        assert!(!v.blocked);
        // 10 (package.json) + 25 (large) + 30 (no tests)
        assert_eq!(v.risk_score, 65.0);
        assert_eq!(v.warn_matches.len(), 1);
    }

    #[test]
    fn test_file_satisfies_required_tests() {
        let v = eval(&["src/a.ts", "src/a.test.ts"], &PolicyConfig::default());
        assert_eq!(v.risk_score, 0.0);
        assert!(v.missing_required_tests.is_empty());
    }

    #[test]
    fn empty_required_patterns_count_as_satisfied() {
        let mut cfg = PolicyConfig::default();
        cfg.required_test_patterns.clear();
        assert_eq!(eval(&["src/a.ts"], &cfg).risk_score, 0.0);
    }

    #[test]
    fn block_rule_blocks() {
        let layer: PolicyLayer =
            serde_json::from_str(r#"{"rules":[{"pattern":"Dockerfile","action":"block"}]}"#).unwrap();
        let v = eval(&["dockerfile"], &PolicyConfig::default().merge(&layer));
        assert!(v.blocked);
        assert_eq!(v.blocked_by, vec![BlockCause::Rule { pattern: "Dockerfile".into() }]);
    }

    #[test]
    fn migrations_max_lines_blocks() {
        let mut ctx = PolicyEvaluationContext::default();
        ctx.patch_lines_by_path.insert("migrations/001.sql".into(), 40);
        let v = evaluate_policy(&["migrations/001.sql"], &PolicyConfig::default(), &ctx);
        assert!(v.blocked);
        assert!(v
            .blocked_by
            .contains(&BlockCause::DomainMaxPatchLines { domain: "migrations".into() }));
        assert!(!v.override_allowed);
    }

    #[test]
    fn auth_forbids_override_and_multiplies() {
        let v = eval(&["src/auth/login.ts"], &PolicyConfig::default());
        assert_eq!(v.matched_domains, vec!["auth"]);
        assert!(!v.override_allowed);
        // 30 (no tests) + 25 (auth tests) = 55, x1.3 = 71.5 -> 72
        assert_eq!(v.risk_score, 72.0);
    }

    #[test]
    fn multiplier_below_one_never_lowers() {
        let v = eval(&["src/ui/button.ts"], &PolicyConfig::default());
        assert_eq!(v.matched_domains, vec!["ui"]);
        assert_eq!(v.risk_score, 30.0);
    }

    #[test]
    fn veto_dominates_other_domains() {
        let v = eval(&["src/ui/a.ts", "migrations/002.sql"], &PolicyConfig::default());
        assert!(v.matched_domains.contains(&"ui".to_string()));
        assert!(!v.override_allowed);
    }

    #[test]
    fn auto_suspend_from_history() {
        let mut ctx = PolicyEvaluationContext::default();
        ctx.domain_metrics.insert(
            "ui".into(),
            DomainHistoryMetrics {
                samples: 6,
                rollback_rate_pct: 50.0,
                validate_success_rate_pct: 40.0,
            },
        );
        let v = evaluate_policy(&["src/ui/a.test.ts"], &PolicyConfig::default(), &ctx);
        assert!(v.blocked);
        assert_eq!(
            v.blocked_by,
            vec![BlockCause::DomainAutoSuspend { domain: "ui".into() }]
        );
    }

    #[test]
    fn history_adds_risk_below_suspend() {
        let mut ctx = PolicyEvaluationContext::default();
        ctx.domain_metrics.insert(
            "ui".into(),
            DomainHistoryMetrics {
                samples: 3,
                rollback_rate_pct: 50.0,
                validate_success_rate_pct: 40.0,
            },
        );
        let v = evaluate_policy(&["src/ui/a.test.ts"], &PolicyConfig::default(), &ctx);
        assert!(!v.blocked);
        // (50-30)*0.6 = 12, (60-40)*0.5 = 10
        assert_eq!(v.risk_score, 22.0);
    }

    #[test]
    fn too_few_samples_are_ignored() {
        let mut ctx = PolicyEvaluationContext::default();
        ctx.domain_metrics.insert(
            "ui".into(),
            DomainHistoryMetrics {
                samples: 2,
                rollback_rate_pct: 100.0,
                validate_success_rate_pct: 0.0,
            },
        );
        let v = evaluate_policy(&["src/ui/a.test.ts"], &PolicyConfig::default(), &ctx);
        assert_eq!(v.risk_score, 0.0);
    }

    #[test]
    fn paths_are_normalized_and_deduped() {
        let v = eval(&["src\\a.test.ts", " src/a.test.ts ", ""], &PolicyConfig::default());
        assert_eq!(v.risk_score, 0.0);
        assert_eq!(normalize_paths(&["a", "a", "b"]), vec!["a", "b"]);
    }

    #[test]
    fn domains_without_patterns_never_match() {
        let mut cfg = PolicyConfig::default();
        cfg.domains.insert(
            "empty".into(),
            DomainPolicy {
                path_patterns: vec![],
                override_allowed: false,
                required_test_patterns: None,
                max_patch_lines: None,
                risk_multiplier: None,
            },
        );
        assert!(match_domains(&["anything"], &cfg).is_empty());
    }
}
