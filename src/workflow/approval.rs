//! Human approval sequences run between EVALUATE and APPLY.
//!
//! Every prompt has a cancel path: a declined confirmation or an empty or
//! missing answer stops the sequence with a [`CancelReason`]. Nothing here
//! touches the workspace.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use super::attempt::CancelReason;
use crate::ports::{ApprovalChannel, ApprovalPrompt};
use crate::settings::GovernanceSettings;

/// Answers collected by a completed override sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverrideApproval {
    pub justification: String,
    pub actor_id: String,
    pub approver_id: String,
}

async fn answer(channel: &dyn ApprovalChannel, prompt: &ApprovalPrompt) -> String {
    channel
        .input(prompt)
        .await
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

/// Risk is at or above the threshold and every matched domain allows
/// override: confirm, justify, then (when enabled) actor, second approver
/// and confirmation code.
pub async fn run_override_flow(
    channel: &dyn ApprovalChannel,
    settings: &GovernanceSettings,
    risk: f64,
    threshold: f64,
    confirm_code: &str,
) -> Result<OverrideApproval, CancelReason> {
    if !channel.confirm(&ApprovalPrompt::Override { risk, threshold }).await {
        return Err(CancelReason::OverrideDeclined);
    }

    let mut approval = OverrideApproval::default();
    if settings.require_justification {
        approval.justification = answer(channel, &ApprovalPrompt::Justification).await;
        if approval.justification.is_empty() {
            return Err(CancelReason::MissingJustification);
        }
    }

    if settings.dual_approval_enabled {
        approval.actor_id = answer(channel, &ApprovalPrompt::Actor).await;
        if approval.actor_id.is_empty() {
            return Err(CancelReason::MissingActor);
        }
        if settings.second_approver_required {
            approval.approver_id = answer(channel, &ApprovalPrompt::SecondApprover).await;
            if approval.approver_id.is_empty()
                || approval.approver_id.to_lowercase() == approval.actor_id.to_lowercase()
            {
                return Err(CancelReason::InvalidSecondApprover);
            }
            let code = confirm_code.to_uppercase();
            let typed = answer(
                channel,
                &ApprovalPrompt::ConfirmCode { code: code.clone() },
            )
            .await
            .to_uppercase();
            if typed != code {
                return Err(CancelReason::SecondApprovalCodeInvalid);
            }
        }
    }

    debug!(
        actor = %approval.actor_id,
        approver = %approval.approver_id,
        "override approved"
    );
    Ok(approval)
}

/// Risk is below the threshold but a matched domain's trust is under the gate.
pub async fn run_trust_gate(
    channel: &dyn ApprovalChannel,
    min_trust: u8,
    gate: u8,
    domains: &[String],
) -> Result<(), CancelReason> {
    let prompt = ApprovalPrompt::TrustGate {
        min_trust,
        gate,
        domains: domains.to_vec(),
    };
    if channel.confirm(&prompt).await {
        Ok(())
    } else {
        Err(CancelReason::TrustGate)
    }
}

// ============================================================================
// Scripted channel
// ============================================================================

/// Replays queued answers in order. Once a queue runs dry every further
/// prompt takes its cancel path. Used for non-interactive runs and tests.
#[derive(Debug, Default)]
pub struct ScriptedApproval {
    confirms: Mutex<VecDeque<bool>>,
    inputs: Mutex<VecDeque<Option<String>>>,
    asked: Mutex<Vec<ApprovalPrompt>>,
}

impl ScriptedApproval {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declines everything.
    pub fn deny_all() -> Self {
        Self::default()
    }

    pub fn confirm(self, yes: bool) -> Self {
        if let Ok(mut q) = self.confirms.lock() {
            q.push_back(yes);
        }
        self
    }

    pub fn input(self, text: impl Into<String>) -> Self {
        if let Ok(mut q) = self.inputs.lock() {
            q.push_back(Some(text.into()));
        }
        self
    }

    /// The operator dismissed the input box.
    pub fn dismiss(self) -> Self {
        if let Ok(mut q) = self.inputs.lock() {
            q.push_back(None);
        }
        self
    }

    /// Prompts shown so far, in order.
    pub fn prompts(&self) -> Vec<ApprovalPrompt> {
        self.asked.lock().map(|a| a.clone()).unwrap_or_default()
    }

    fn record(&self, prompt: &ApprovalPrompt) {
        if let Ok(mut a) = self.asked.lock() {
            a.push(prompt.clone());
        }
    }
}

#[async_trait]
impl ApprovalChannel for ScriptedApproval {
    async fn confirm(&self, prompt: &ApprovalPrompt) -> bool {
        self.record(prompt);
        self.confirms
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or(false)
    }

    async fn input(&self, prompt: &ApprovalPrompt) -> Option<String> {
        self.record(prompt);
        self.inputs.lock().ok().and_then(|mut q| q.pop_front()).flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strict() -> GovernanceSettings {
        GovernanceSettings::default()
    }

    #[tokio::test]
    async fn full_dual_approval_succeeds() {
        let ch = ScriptedApproval::new()
            .confirm(true)
            .input("hotfix for outage")
            .input("alice")
            .input("bob")
            .input(" abc123 ");
        let got = run_override_flow(&ch, &strict(), 80.0, 70.0, "ABC123")
            .await
            .unwrap();
        assert_eq!(got.justification, "hotfix for outage");
        assert_eq!(got.actor_id, "alice");
        assert_eq!(got.approver_id, "bob");
        assert_eq!(ch.prompts().len(), 5);
    }

    #[tokio::test]
    async fn decline_cancels_immediately() {
        let ch = ScriptedApproval::deny_all();
        let err = run_override_flow(&ch, &strict(), 80.0, 70.0, "ABC123")
            .await
            .unwrap_err();
        assert_eq!(err, CancelReason::OverrideDeclined);
        assert_eq!(ch.prompts(), vec![ApprovalPrompt::Override { risk: 80.0, threshold: 70.0 }]);
    }

    #[tokio::test]
    async fn blank_justification_cancels() {
        let ch = ScriptedApproval::new().confirm(true).input("   ");
        let err = run_override_flow(&ch, &strict(), 80.0, 70.0, "C0DE00")
            .await
            .unwrap_err();
        assert_eq!(err, CancelReason::MissingJustification);
    }

    #[tokio::test]
    async fn dismissed_actor_cancels() {
        let ch = ScriptedApproval::new().confirm(true).input("why").dismiss();
        let err = run_override_flow(&ch, &strict(), 80.0, 70.0, "C0DE00")
            .await
            .unwrap_err();
        assert_eq!(err, CancelReason::MissingActor);
    }

    #[tokio::test]
    async fn approver_must_differ_ignoring_case() {
        let ch = ScriptedApproval::new()
            .confirm(true)
            .input("why")
            .input("Alice")
            .input("ALICE");
        let err = run_override_flow(&ch, &strict(), 80.0, 70.0, "C0DE00")
            .await
            .unwrap_err();
        assert_eq!(err, CancelReason::InvalidSecondApprover);
    }

    #[tokio::test]
    async fn wrong_code_cancels() {
        let ch = ScriptedApproval::new()
            .confirm(true)
            .input("why")
            .input("alice")
            .input("bob")
            .input("ZZZZZZ");
        let err = run_override_flow(&ch, &strict(), 80.0, 70.0, "C0DE00")
            .await
            .unwrap_err();
        assert_eq!(err, CancelReason::SecondApprovalCodeInvalid);
    }

    #[tokio::test]
    async fn single_approval_skips_identity_prompts() {
        let settings = GovernanceSettings {
            require_justification: false,
            dual_approval_enabled: false,
            ..Default::default()
        };
        let ch = ScriptedApproval::new().confirm(true);
        let got = run_override_flow(&ch, &settings, 90.0, 70.0, "C0DE00")
            .await
            .unwrap();
        assert_eq!(got, OverrideApproval::default());
        assert_eq!(ch.prompts().len(), 1);
    }

    #[tokio::test]
    async fn trust_gate_follows_confirmation() {
        let domains = vec!["auth".to_string()];
        let yes = ScriptedApproval::new().confirm(true);
        assert!(run_trust_gate(&yes, 40, 70, &domains).await.is_ok());
        let no = ScriptedApproval::new().confirm(false);
        assert_eq!(
            run_trust_gate(&no, 40, 70, &domains).await,
            Err(CancelReason::TrustGate)
        );
    }
}
