//! Patch governance and custody engine
//!
//! Governs how proposed code changes reach a workspace: parse the patch,
//! score it against a layered risk policy, ask a human when policy says so,
//! apply it with per-file snapshots, and record every decision in a signed,
//! hash-chained ledger.
//!
//! ## Call chain
//!
//! ```text
//! text -> patch::ParsedPatch -> policy::evaluate_policy (+ trust, history)
//!      -> workflow approvals -> patch apply -> custody::CustodyLedger
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use patch_custody::ports::{LocalWorkspaceFs, MemorySecretStore, WorkspaceFs};
//! use patch_custody::patch::ApplySelection;
//! use patch_custody::workflow::{GovernanceWorkflow, ScriptedApproval};
//! use patch_custody::settings::GovernanceSettings;
//!
//! # async fn run() -> Result<(), patch_custody::GovernanceError> {
//! let fs: Arc<dyn WorkspaceFs> = Arc::new(LocalWorkspaceFs::new("."));
//! let wf = GovernanceWorkflow::open(
//!     fs,
//!     &MemorySecretStore::new(),
//!     Arc::new(ScriptedApproval::deny_all()),
//!     GovernanceSettings::from_env(),
//! )
//! .await?;
//! let outcome = wf.attempt("--- a/x\n+++ b/x\n@@ -0,0 +1 @@\n+hi\n", &ApplySelection::all()).await?;
//! println!("{}", outcome.label());
//! # Ok(())
//! # }
//! ```

// Core error handling
pub mod error;

// Collaborator ports (workspace, secrets, approvals)
pub mod ports;

// Runtime settings
pub mod settings;

// Patch parsing and application
pub mod patch;

// Risk policy and trust
pub mod policy;

// Signed custody ledger
pub mod custody;

// Attempt orchestration
pub mod workflow;

pub use error::GovernanceError;
pub use settings::GovernanceSettings;
pub use workflow::{AttemptContext, AttemptOutcome, GovernanceWorkflow};
