//! Runtime governance settings.
//!
//! Loaded once per process, either from a JSON/serde source (every field has
//! a default) or from `CUSTODY_*` environment variables via
//! [`GovernanceSettings::from_env`]. Values are clamped by
//! [`GovernanceSettings::clamped`] before use.

use serde::{Deserialize, Serialize};

use crate::custody::{DEFAULT_HISTORY_WINDOW, DEFAULT_LEDGER_FILE};
use crate::policy::{ResolveOptions, DEFAULT_PROFILE};

pub const DEFAULT_POLICY_FILE: &str = ".patch_policies.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceSettings {
    pub policy_file: String,
    pub profile: String,
    /// Forces the resolved threshold when set
    pub risk_threshold_override: Option<f64>,
    pub ledger_file: String,
    pub signing_enabled: bool,

    pub dynamic_threshold_enabled: bool,
    pub rollback_penalty_start_pct: f64,
    pub rollback_penalty_max: f64,
    pub min_effective_threshold: f64,

    pub require_justification: bool,
    pub dual_approval_enabled: bool,
    pub second_approver_required: bool,

    pub trust_enabled: bool,
    pub trust_min_score_auto_apply: u8,
    pub trust_low_score_risk_penalty: f64,

    pub history_window: usize,
}

impl Default for GovernanceSettings {
    fn default() -> Self {
        Self {
            policy_file: DEFAULT_POLICY_FILE.to_string(),
            profile: DEFAULT_PROFILE.to_string(),
            risk_threshold_override: None,
            ledger_file: DEFAULT_LEDGER_FILE.to_string(),
            signing_enabled: true,
            dynamic_threshold_enabled: true,
            rollback_penalty_start_pct: 20.0,
            rollback_penalty_max: 25.0,
            min_effective_threshold: 10.0,
            require_justification: true,
            dual_approval_enabled: true,
            second_approver_required: true,
            trust_enabled: true,
            trust_min_score_auto_apply: 70,
            trust_low_score_risk_penalty: 20.0,
            history_window: DEFAULT_HISTORY_WINDOW,
        }
    }
}

impl GovernanceSettings {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            policy_file: env_string("CUSTODY_POLICY_FILE").unwrap_or(d.policy_file),
            profile: env_string("CUSTODY_PROFILE").unwrap_or(d.profile),
            risk_threshold_override: env_f64("CUSTODY_RISK_THRESHOLD"),
            ledger_file: env_string("CUSTODY_LEDGER_FILE").unwrap_or(d.ledger_file),
            signing_enabled: env_bool("CUSTODY_SIGNING_ENABLED", d.signing_enabled),
            dynamic_threshold_enabled: env_bool(
                "CUSTODY_DYNAMIC_THRESHOLD",
                d.dynamic_threshold_enabled,
            ),
            rollback_penalty_start_pct: env_f64("CUSTODY_ROLLBACK_PENALTY_START_PCT")
                .unwrap_or(d.rollback_penalty_start_pct),
            rollback_penalty_max: env_f64("CUSTODY_ROLLBACK_PENALTY_MAX")
                .unwrap_or(d.rollback_penalty_max),
            min_effective_threshold: env_f64("CUSTODY_MIN_EFFECTIVE_THRESHOLD")
                .unwrap_or(d.min_effective_threshold),
            require_justification: env_bool(
                "CUSTODY_REQUIRE_JUSTIFICATION",
                d.require_justification,
            ),
            dual_approval_enabled: env_bool("CUSTODY_DUAL_APPROVAL", d.dual_approval_enabled),
            second_approver_required: env_bool(
                "CUSTODY_SECOND_APPROVER_REQUIRED",
                d.second_approver_required,
            ),
            trust_enabled: env_bool("CUSTODY_TRUST_ENABLED", d.trust_enabled),
            trust_min_score_auto_apply: env_f64("CUSTODY_TRUST_MIN_SCORE")
                .map(|v| v.clamp(0.0, 100.0) as u8)
                .unwrap_or(d.trust_min_score_auto_apply),
            trust_low_score_risk_penalty: env_f64("CUSTODY_TRUST_RISK_PENALTY")
                .unwrap_or(d.trust_low_score_risk_penalty),
            history_window: env_f64("CUSTODY_HISTORY_WINDOW")
                .map(|v| v.max(1.0) as usize)
                .unwrap_or(d.history_window),
        }
        .clamped()
    }

    /// Bring every numeric field into its allowed range.
    pub fn clamped(mut self) -> Self {
        let pos = |v: f64, lo: f64, hi: f64, fallback: f64| {
            if v.is_finite() {
                v.clamp(lo, hi)
            } else {
                fallback
            }
        };
        let d = Self::default();
        self.rollback_penalty_start_pct =
            pos(self.rollback_penalty_start_pct, 0.0, 100.0, d.rollback_penalty_start_pct);
        self.rollback_penalty_max = pos(self.rollback_penalty_max, 0.0, 90.0, d.rollback_penalty_max);
        self.min_effective_threshold =
            pos(self.min_effective_threshold, 0.0, f64::MAX, d.min_effective_threshold);
        self.trust_min_score_auto_apply = self.trust_min_score_auto_apply.min(100);
        self.trust_low_score_risk_penalty = pos(
            self.trust_low_score_risk_penalty,
            0.0,
            80.0,
            d.trust_low_score_risk_penalty,
        );
        self.risk_threshold_override = self
            .risk_threshold_override
            .filter(|t| t.is_finite())
            .map(|t| t.max(0.0));
        self.profile = self.profile.trim().to_ascii_lowercase();
        if self.profile.is_empty() {
            self.profile = d.profile;
        }
        if self.policy_file.trim().is_empty() {
            self.policy_file = d.policy_file;
        }
        if self.ledger_file.trim().is_empty() {
            self.ledger_file = d.ledger_file;
        }
        self.history_window = self.history_window.max(1);
        self
    }

    pub fn resolve_options(&self) -> ResolveOptions {
        ResolveOptions {
            profile: self.profile.clone(),
            risk_threshold_override: self.risk_threshold_override,
        }
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"),
        Err(_) => default,
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_f64(key: &str) -> Option<f64> {
    env_string(key)?.parse::<f64>().ok().filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_strict_governance() {
        let s = GovernanceSettings::default();
        assert!(s.signing_enabled);
        assert!(s.dual_approval_enabled);
        assert_eq!(s.trust_min_score_auto_apply, 70);
        assert_eq!(s.risk_threshold_override, None);
        assert_eq!(s.history_window, 2000);
    }

    #[test]
    fn clamped_bounds_every_number() {
        let s = GovernanceSettings {
            rollback_penalty_start_pct: 150.0,
            rollback_penalty_max: -4.0,
            trust_low_score_risk_penalty: f64::NAN,
            trust_min_score_auto_apply: 200,
            risk_threshold_override: Some(-3.0),
            profile: "  STRICT ".into(),
            history_window: 0,
            ..Default::default()
        }
        .clamped();
        assert_eq!(s.rollback_penalty_start_pct, 100.0);
        assert_eq!(s.rollback_penalty_max, 0.0);
        assert_eq!(s.trust_low_score_risk_penalty, 20.0);
        assert_eq!(s.trust_min_score_auto_apply, 100);
        assert_eq!(s.risk_threshold_override, Some(0.0));
        assert_eq!(s.profile, "strict");
        assert_eq!(s.history_window, 1);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: GovernanceSettings =
            serde_json::from_str(r#"{"profile": "experimental", "signing_enabled": false}"#).unwrap();
        assert_eq!(s.profile, "experimental");
        assert!(!s.signing_enabled);
        assert_eq!(s.ledger_file, DEFAULT_LEDGER_FILE);
    }

    #[test]
    fn resolve_options_carry_profile_and_override() {
        let s = GovernanceSettings {
            risk_threshold_override: Some(55.0),
            ..Default::default()
        };
        let opts = s.resolve_options();
        assert_eq!(opts.profile, "balanced");
        assert_eq!(opts.risk_threshold_override, Some(55.0));
    }
}
