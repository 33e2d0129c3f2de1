//! Per-attempt state and outcomes.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::custody::sha256_hex;
use crate::patch::{ApplyReport, Snapshot};
use crate::policy::PolicyVerdict;
use crate::settings::GovernanceSettings;

/// Length of the source fingerprint written to the ledger.
const SOURCE_HASH_LEN: usize = 16;
const CONFIRM_CODE_LEN: usize = 6;

/// The approval decision carried from EVALUATE into the apply record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GovernanceDecision {
    pub domains: Vec<String>,
    pub risk: f64,
    pub threshold: f64,
    pub override_used: bool,
    pub justification: String,
    pub actor_id: String,
    pub approver_id: String,
    pub min_trust_score: u8,
}

/// Everything one apply attempt needs after evaluation. Owned by the caller;
/// nothing here is shared between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptContext {
    pub chain_id: String,
    pub source_hash: String,
    pub decision: GovernanceDecision,
    /// Prior file states, present only after a successful apply
    pub snapshots: Vec<Snapshot>,
}

impl AttemptContext {
    pub fn new(source: &str) -> Self {
        Self::with_chain_id(source, Uuid::new_v4().to_string())
    }

    pub fn with_chain_id(source: &str, chain_id: impl Into<String>) -> Self {
        Self {
            chain_id: chain_id.into(),
            source_hash: source_hash(source),
            decision: GovernanceDecision::default(),
            snapshots: Vec::new(),
        }
    }

    /// Code the second approver types back.
    pub fn confirm_code(&self) -> String {
        self.chain_id
            .chars()
            .take(CONFIRM_CODE_LEN)
            .collect::<String>()
            .to_uppercase()
    }

    pub fn can_roll_back(&self) -> bool {
        !self.snapshots.is_empty()
    }
}

pub fn source_hash(source: &str) -> String {
    let mut hash = sha256_hex(source.as_bytes());
    hash.truncate(SOURCE_HASH_LEN);
    hash
}

/// Threshold after the rollback-rate penalty, with the reason line to append
/// when the penalty is active.
pub fn effective_threshold(
    threshold: f64,
    rollback_rate_pct: f64,
    settings: &GovernanceSettings,
) -> (f64, Option<String>) {
    let start = settings.rollback_penalty_start_pct;
    if !settings.dynamic_threshold_enabled || !rollback_rate_pct.is_finite() || rollback_rate_pct < start {
        return (threshold, None);
    }
    let denom = (100.0 - start).max(1.0);
    let ratio = ((rollback_rate_pct - start) / denom).min(1.0);
    let penalty = (settings.rollback_penalty_max * ratio).round();
    let effective = (threshold - penalty).max(settings.min_effective_threshold);
    let reason = format!(
        "Dynamic threshold active due rollback rate {}% (-{penalty} threshold)",
        rollback_rate_pct.round()
    );
    (effective, Some(reason))
}

/// Why an attempt stopped at an approval prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    TrustGate,
    OverrideDeclined,
    MissingJustification,
    MissingActor,
    InvalidSecondApprover,
    SecondApprovalCodeInvalid,
}

impl CancelReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TrustGate => "trust_gate",
            Self::OverrideDeclined => "override_declined",
            Self::MissingJustification => "missing_justification",
            Self::MissingActor => "missing_actor",
            Self::InvalidSecondApprover => "invalid_second_approver",
            Self::SecondApprovalCodeInvalid => "second_approval_code_invalid",
        }
    }

    /// The plain decline is recorded with the verdict reasons only.
    pub(crate) fn ledger_reason(&self) -> Option<&'static str> {
        match self {
            Self::OverrideDeclined => None,
            other => Some(other.as_str()),
        }
    }
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal state of [`crate::workflow::GovernanceWorkflow::attempt`].
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// No diff or file block recognized; the caller handles the text itself.
    Fallback,
    /// The selection left nothing to apply.
    NothingSelected,
    Blocked {
        ctx: AttemptContext,
        verdict: PolicyVerdict,
    },
    Canceled {
        ctx: AttemptContext,
        verdict: PolicyVerdict,
        reason: CancelReason,
    },
    /// At least one file written. `ctx.snapshots` can undo it.
    Applied {
        ctx: AttemptContext,
        verdict: PolicyVerdict,
        report: ApplyReport,
    },
    /// Approved, but every file conflicted or failed.
    Noop {
        ctx: AttemptContext,
        verdict: PolicyVerdict,
        report: ApplyReport,
    },
}

impl AttemptOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Fallback => "fallback",
            Self::NothingSelected => "nothing_selected",
            Self::Blocked { .. } => "blocked",
            Self::Canceled { .. } => "canceled",
            Self::Applied { .. } => "applied",
            Self::Noop { .. } => "noop",
        }
    }

    pub fn context(&self) -> Option<&AttemptContext> {
        match self {
            Self::Blocked { ctx, .. }
            | Self::Canceled { ctx, .. }
            | Self::Applied { ctx, .. }
            | Self::Noop { ctx, .. } => Some(ctx),
            Self::Fallback | Self::NothingSelected => None,
        }
    }

    pub fn verdict(&self) -> Option<&PolicyVerdict> {
        match self {
            Self::Blocked { verdict, .. }
            | Self::Canceled { verdict, .. }
            | Self::Applied { verdict, .. }
            | Self::Noop { verdict, .. } => Some(verdict),
            Self::Fallback | Self::NothingSelected => None,
        }
    }

    pub fn into_context(self) -> Option<AttemptContext> {
        match self {
            Self::Blocked { ctx, .. }
            | Self::Canceled { ctx, .. }
            | Self::Applied { ctx, .. }
            | Self::Noop { ctx, .. } => Some(ctx),
            Self::Fallback | Self::NothingSelected => None,
        }
    }

    pub fn applied_files(&self) -> usize {
        match self {
            Self::Applied { report, .. } => report.applied_count(),
            _ => 0,
        }
    }
}
