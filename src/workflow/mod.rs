//! Governance workflow
//!
//! Single entry point ([`GovernanceWorkflow::attempt`]) for applying a
//! proposed patch:
//!
//! ```text
//! PARSE ──(nothing recognized)──> FALLBACK
//!   │
//! EVALUATE ──(unconditional block)──────────────> BLOCKED
//!   ├──(risk >= threshold, override disallowed)─> BLOCKED
//!   ├──(risk >= threshold)──> OVERRIDE_FLOW ──> APPLY | CANCELED
//!   ├──(low trust)──────────> TRUST_PROMPT ───> APPLY | CANCELED
//!   └──────────────────────────────────────────> APPLY
//! APPLY ──> APPLIED | NOOP
//! APPLIED ──(rollback)──> ROLLED_BACK
//! ```
//!
//! Each transition out of EVALUATE appends one `policy_verdict`; APPLY
//! appends `apply_result`. The workspace is untouched before APPLY.

pub mod approval;
pub mod attempt;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::custody::{
    derive_stats, ApplyResultRecord, CustodyLedger, GitProvenanceRecord, GovernanceStats,
    LedgerEvent, PolicyVerdictRecord, RollbackResultRecord, SigningKey, ValidateResultRecord,
};
use crate::error::GovernanceError;
use crate::patch::{rollback, ApplyReport, ApplySelection, ParsedPatch, RollbackReport};
use crate::policy::{
    evaluate_policy, min_trust_for_domains, resolve_policy, trust_by_domain,
    PolicyEvaluationContext, PolicyVerdict, ResolveIssue, ResolvedPolicy,
};
use crate::ports::{ApprovalChannel, SecretStore, WorkspaceFs};
use crate::settings::GovernanceSettings;

pub use approval::{run_override_flow, run_trust_gate, OverrideApproval, ScriptedApproval};
pub use attempt::{
    effective_threshold, source_hash, AttemptContext, AttemptOutcome, CancelReason,
    GovernanceDecision,
};

/// Longest validation output kept in a `validate_result` record.
pub const VALIDATION_PREVIEW_CHARS: usize = 800;

/// Block code recorded when risk crosses the threshold but a matched domain
/// forbids override.
pub const OVERRIDE_DISABLED_BY_DOMAIN: &str = "override_disabled_by_domain";

/// Verdict plus everything derived around it, before any prompt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    /// Risk includes the low-trust penalty; reasons include threshold and
    /// trust notes
    pub verdict: PolicyVerdict,
    pub effective_threshold: f64,
    pub rollback_rate_pct: f64,
    pub min_trust_score: u8,
    /// A matched domain is under the trust gate
    pub low_trust: bool,
}

impl Evaluation {
    pub fn needs_override(&self) -> bool {
        !self.verdict.blocked && self.verdict.risk_score >= self.effective_threshold
    }
}

/// Outcome reported by an external source-control step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvenanceDetail {
    Recorded {
        branch: Option<String>,
        head: Option<String>,
        applied_files: usize,
    },
    Failed {
        reason: String,
    },
}

pub struct GovernanceWorkflow {
    fs: Arc<dyn WorkspaceFs>,
    ledger: Arc<CustodyLedger>,
    approvals: Arc<dyn ApprovalChannel>,
    settings: GovernanceSettings,
}

impl std::fmt::Debug for GovernanceWorkflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GovernanceWorkflow")
            .field("ledger", &self.ledger)
            .field("settings", &self.settings)
            .finish()
    }
}

impl GovernanceWorkflow {
    pub fn new(
        fs: Arc<dyn WorkspaceFs>,
        ledger: Arc<CustodyLedger>,
        approvals: Arc<dyn ApprovalChannel>,
        settings: GovernanceSettings,
    ) -> Self {
        Self {
            fs,
            ledger,
            approvals,
            settings: settings.clamped(),
        }
    }

    /// Build the ledger from settings, loading (or creating) the signing key
    /// when signing is enabled.
    pub async fn open(
        fs: Arc<dyn WorkspaceFs>,
        secrets: &dyn SecretStore,
        approvals: Arc<dyn ApprovalChannel>,
        settings: GovernanceSettings,
    ) -> Result<Self, GovernanceError> {
        let settings = settings.clamped();
        let key = if settings.signing_enabled {
            Some(SigningKey::load_or_create(secrets).await?)
        } else {
            None
        };
        let ledger = Arc::new(CustodyLedger::new(
            Arc::clone(&fs),
            settings.ledger_file.clone(),
            key,
        ));
        Ok(Self::new(fs, ledger, approvals, settings))
    }

    pub fn ledger(&self) -> &Arc<CustodyLedger> {
        &self.ledger
    }

    pub fn settings(&self) -> &GovernanceSettings {
        &self.settings
    }

    pub async fn load_policy(&self) -> ResolvedPolicy {
        resolve_policy(
            self.fs.as_ref(),
            &self.settings.policy_file,
            &self.settings.resolve_options(),
        )
        .await
    }

    /// History over the trailing ledger window.
    pub async fn stats(&self) -> Result<GovernanceStats, GovernanceError> {
        let records = self.ledger.read_records(self.settings.history_window).await?;
        Ok(derive_stats(&records))
    }

    /// Score a parsed patch against the resolved policy and ledger history.
    /// No prompts, no writes.
    pub async fn evaluate(&self, patch: &ParsedPatch) -> Result<Evaluation, GovernanceError> {
        let resolved = self.load_policy().await;
        let stats = self.stats().await?;

        let ctx = PolicyEvaluationContext {
            patch_lines_by_path: patch.changed_lines(),
            domain_metrics: stats.domain_metrics.clone(),
        };
        let mut verdict = evaluate_policy(&patch.paths(), &resolved.config, &ctx);

        for diag in &resolved.diagnostics {
            if !matches!(diag.issue, ResolveIssue::Missing | ResolveIssue::AlreadyVisited) {
                verdict.reasons.push(format!("Policy node skipped: {diag}"));
            }
        }

        let trust = trust_by_domain(&stats.domain_metrics);
        let min_trust_score = min_trust_for_domains(&verdict.matched_domains, &trust);
        let low_trust = self.settings.trust_enabled
            && !verdict.matched_domains.is_empty()
            && min_trust_score < self.settings.trust_min_score_auto_apply;
        if low_trust {
            let penalty = self.settings.trust_low_score_risk_penalty;
            verdict.risk_score += penalty;
            verdict.reasons.push(format!(
                "Low trust domains ({min_trust_score}/100) added +{penalty} risk"
            ));
        }

        let rollback_rate_pct = stats.global_rollback_rate_pct();
        let (effective, note) =
            effective_threshold(verdict.threshold, rollback_rate_pct, &self.settings);
        if let Some(note) = note {
            verdict.reasons.push(note);
        }

        debug!(
            risk = verdict.risk_score,
            threshold = effective,
            blocked = verdict.blocked,
            domains = ?verdict.matched_domains,
            min_trust = min_trust_score,
            "patch evaluated"
        );

        Ok(Evaluation {
            verdict,
            effective_threshold: effective,
            rollback_rate_pct,
            min_trust_score,
            low_trust,
        })
    }

    /// Parse, evaluate, ask for approval when needed, apply and record.
    pub async fn attempt(
        &self,
        source: &str,
        selection: &ApplySelection,
    ) -> Result<AttemptOutcome, GovernanceError> {
        let Some(parsed) = ParsedPatch::parse(source) else {
            debug!("no patch recognized, falling back");
            return Ok(AttemptOutcome::Fallback);
        };
        let patch = parsed.select(selection);
        if patch.is_empty() {
            debug!("selection left nothing to apply");
            return Ok(AttemptOutcome::NothingSelected);
        }

        let eval = self.evaluate(&patch).await?;
        let mut ctx = AttemptContext::new(source);
        ctx.decision = GovernanceDecision {
            domains: eval.verdict.matched_domains.clone(),
            risk: eval.verdict.risk_score,
            threshold: eval.effective_threshold,
            min_trust_score: eval.min_trust_score,
            ..Default::default()
        };
        let verdict = eval.verdict.clone();

        // ── Unconditional blocks ──
        if verdict.blocked {
            self.append_verdict(&ctx, &verdict, VerdictKind::Blocked(verdict.block_codes()))
                .await?;
            info!(chain_id = %ctx.chain_id, causes = ?verdict.block_codes(), "apply blocked by policy");
            return Ok(AttemptOutcome::Blocked { ctx, verdict });
        }

        // ── Threshold ──
        if eval.needs_override() {
            if !verdict.override_allowed {
                self.append_verdict(
                    &ctx,
                    &verdict,
                    VerdictKind::Blocked(vec![OVERRIDE_DISABLED_BY_DOMAIN.to_string()]),
                )
                .await?;
                info!(chain_id = %ctx.chain_id, "apply blocked: override disabled for matched domain");
                return Ok(AttemptOutcome::Blocked { ctx, verdict });
            }
            let code = ctx.confirm_code();
            match run_override_flow(
                self.approvals.as_ref(),
                &self.settings,
                verdict.risk_score,
                eval.effective_threshold,
                &code,
            )
            .await
            {
                Ok(approval) => {
                    ctx.decision.override_used = true;
                    ctx.decision.justification = approval.justification;
                    ctx.decision.actor_id = approval.actor_id;
                    ctx.decision.approver_id = approval.approver_id;
                }
                Err(reason) => return self.cancel(ctx, verdict, reason).await,
            }
        } else if eval.low_trust {
            if let Err(reason) = run_trust_gate(
                self.approvals.as_ref(),
                eval.min_trust_score,
                self.settings.trust_min_score_auto_apply,
                &verdict.matched_domains,
            )
            .await
            {
                return self.cancel(ctx, verdict, reason).await;
            }
        }

        // Intent is durable before the first write.
        self.append_verdict(&ctx, &verdict, VerdictKind::Approved).await?;

        // ── Apply ──
        let report = patch.apply(self.fs.as_ref()).await;
        if let Err(e) = self.ledger.append(&apply_event(&ctx, &report)).await {
            error!(chain_id = %ctx.chain_id, error = %e, "apply_result not recorded, reverting files");
            if !report.snapshots.is_empty() {
                let undo = rollback(self.fs.as_ref(), &report.snapshots).await;
                if !undo.failures.is_empty() {
                    warn!(
                        chain_id = %ctx.chain_id,
                        failed = undo.failures.len(),
                        "revert after ledger failure was incomplete"
                    );
                }
            }
            return Err(e.into());
        }

        info!(
            chain_id = %ctx.chain_id,
            applied = report.applied_count(),
            conflicts = report.conflicts.len(),
            failures = report.failures.len(),
            override_used = ctx.decision.override_used,
            "patch apply finished"
        );

        if report.is_noop() {
            Ok(AttemptOutcome::Noop {
                ctx,
                verdict,
                report,
            })
        } else {
            ctx.snapshots = report.snapshots.clone();
            Ok(AttemptOutcome::Applied {
                ctx,
                verdict,
                report,
            })
        }
    }

    /// Undo an applied attempt from its snapshots, then forget them.
    pub async fn rollback(&self, ctx: &mut AttemptContext) -> Result<RollbackReport, GovernanceError> {
        if !ctx.can_roll_back() {
            return Err(GovernanceError::NothingToRollBack(ctx.chain_id.clone()));
        }
        let report = rollback(self.fs.as_ref(), &ctx.snapshots).await;
        ctx.snapshots.clear();

        self.ledger
            .append(&LedgerEvent::RollbackResult(RollbackResultRecord {
                chain_id: ctx.chain_id.clone(),
                rolled_back_files: report.restored.len(),
                failed_files: report.failures.iter().map(|f| f.path.clone()).collect(),
            }))
            .await?;
        info!(
            chain_id = %ctx.chain_id,
            restored = report.restored.len(),
            failed = report.failures.len(),
            "apply rolled back"
        );
        Ok(report)
    }

    /// Record the outcome of a post-apply validation command.
    pub async fn record_validation(
        &self,
        chain_id: &str,
        ok: bool,
        duration: Duration,
        output: &str,
    ) -> Result<(), GovernanceError> {
        let output_preview: String = output.chars().take(VALIDATION_PREVIEW_CHARS).collect();
        self.ledger
            .append(&LedgerEvent::ValidateResult(ValidateResultRecord {
                chain_id: chain_id.to_string(),
                ok,
                duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
                output_preview,
            }))
            .await?;
        Ok(())
    }

    /// Record what an external source-control step did with an attempt.
    pub async fn record_provenance(
        &self,
        chain_id: &str,
        detail: ProvenanceDetail,
    ) -> Result<(), GovernanceError> {
        let record = match detail {
            ProvenanceDetail::Recorded {
                branch,
                head,
                applied_files,
            } => GitProvenanceRecord {
                chain_id: chain_id.to_string(),
                ok: true,
                branch,
                head,
                applied_files: Some(applied_files),
                reason: None,
            },
            ProvenanceDetail::Failed { reason } => GitProvenanceRecord {
                chain_id: chain_id.to_string(),
                ok: false,
                reason: Some(reason),
                ..Default::default()
            },
        };
        self.ledger.append(&LedgerEvent::GitProvenance(record)).await?;
        Ok(())
    }

    async fn cancel(
        &self,
        ctx: AttemptContext,
        verdict: PolicyVerdict,
        reason: CancelReason,
    ) -> Result<AttemptOutcome, GovernanceError> {
        self.append_verdict(&ctx, &verdict, VerdictKind::Canceled(reason))
            .await?;
        info!(chain_id = %ctx.chain_id, reason = %reason, "apply canceled");
        Ok(AttemptOutcome::Canceled {
            ctx,
            verdict,
            reason,
        })
    }

    async fn append_verdict(
        &self,
        ctx: &AttemptContext,
        verdict: &PolicyVerdict,
        kind: VerdictKind,
    ) -> Result<(), GovernanceError> {
        let d = &ctx.decision;
        let mut record = PolicyVerdictRecord {
            chain_id: ctx.chain_id.clone(),
            source_hash: ctx.source_hash.clone(),
            risk: d.risk,
            threshold: d.threshold,
            domains: d.domains.clone(),
            min_trust_score: d.min_trust_score,
            reasons: verdict.reasons.clone(),
            override_used: d.override_used,
            justification: d.justification.clone(),
            actor_id: d.actor_id.clone(),
            approver_id: d.approver_id.clone(),
            ..Default::default()
        };
        match kind {
            VerdictKind::Blocked(codes) => {
                record.blocked = true;
                record.blocked_by = codes;
            }
            VerdictKind::Canceled(reason) => {
                record.canceled = true;
                record.reasons.extend(reason.ledger_reason().map(String::from));
            }
            VerdictKind::Approved => {}
        }
        self.ledger
            .append(&LedgerEvent::PolicyVerdict(record))
            .await
            .map_err(|e| {
                error!(chain_id = %ctx.chain_id, error = %e, "policy_verdict not recorded, attempt aborted");
                GovernanceError::from(e)
            })?;
        Ok(())
    }
}

enum VerdictKind {
    Blocked(Vec<String>),
    Canceled(CancelReason),
    Approved,
}

fn apply_event(ctx: &AttemptContext, report: &ApplyReport) -> LedgerEvent {
    let d = &ctx.decision;
    LedgerEvent::ApplyResult(ApplyResultRecord {
        chain_id: ctx.chain_id.clone(),
        source_hash: ctx.source_hash.clone(),
        applied_files: report.applied_count(),
        conflicts: report.conflicts.clone(),
        failed_files: report.failures.iter().map(|f| f.path.clone()).collect(),
        override_used: d.override_used,
        justification: d.justification.clone(),
        actor_id: d.actor_id.clone(),
        approver_id: d.approver_id.clone(),
        min_trust_score: d.min_trust_score,
        risk: d.risk,
        threshold: d.threshold,
        domains: d.domains.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::MemoryWorkspaceFs;

    fn workflow(fs: &MemoryWorkspaceFs, approvals: ScriptedApproval) -> GovernanceWorkflow {
        let fs: Arc<dyn WorkspaceFs> = Arc::new(fs.clone());
        let ledger = Arc::new(CustodyLedger::new(Arc::clone(&fs), ".ledger.jsonl", None));
        GovernanceWorkflow::new(fs, ledger, Arc::new(approvals), GovernanceSettings::default())
    }

    #[tokio::test]
    async fn plain_text_falls_back_without_ledger_entry() {
        let fs = MemoryWorkspaceFs::new();
        let wf = workflow(&fs, ScriptedApproval::deny_all());
        let out = wf.attempt("just prose", &ApplySelection::all()).await.unwrap();
        assert_eq!(out, AttemptOutcome::Fallback);
        assert!(wf.ledger().read_lines().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_selection_writes_nothing() {
        let fs = MemoryWorkspaceFs::new();
        let wf = workflow(&fs, ScriptedApproval::deny_all());
        let diff = "+++ b/src/a.rs\n@@ -0,0 +1 @@\n+fn a() {}\n";
        let out = wf
            .attempt(diff, &ApplySelection::with_paths(["src/other.rs"]))
            .await
            .unwrap();
        assert_eq!(out, AttemptOutcome::NothingSelected);
        assert!(wf.ledger().read_lines().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rollback_without_snapshots_is_an_error() {
        let fs = MemoryWorkspaceFs::new();
        let wf = workflow(&fs, ScriptedApproval::deny_all());
        let mut ctx = AttemptContext::with_chain_id("", "c-1");
        let err = wf.rollback(&mut ctx).await.unwrap_err();
        assert_eq!(err.code(), "nothing_to_roll_back");
    }

    #[tokio::test]
    async fn validation_preview_is_truncated() {
        let fs = MemoryWorkspaceFs::new();
        let wf = workflow(&fs, ScriptedApproval::deny_all());
        let output = "x".repeat(2000);
        wf.record_validation("c-2", false, Duration::from_millis(1500), &output)
            .await
            .unwrap();
        let records = wf.ledger().read_records(10).await.unwrap();
        match &records[0].event {
            LedgerEvent::ValidateResult(r) => {
                assert_eq!(r.output_preview.len(), VALIDATION_PREVIEW_CHARS);
                assert_eq!(r.duration_ms, 1500);
                assert!(!r.ok);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn provenance_failure_keeps_reason() {
        let fs = MemoryWorkspaceFs::new();
        let wf = workflow(&fs, ScriptedApproval::deny_all());
        wf.record_provenance(
            "c-3",
            ProvenanceDetail::Failed {
                reason: "not_git_repo".into(),
            },
        )
        .await
        .unwrap();
        let line = &wf.ledger().read_lines().await.unwrap()[0];
        assert!(line.contains("\"type\":\"git_provenance\""));
        assert!(line.contains("\"reason\":\"not_git_repo\""));
        assert!(!line.contains("branch"));
    }
}
