use thiserror::Error;

use crate::custody::LedgerError;
use crate::ports::PortError;

/// Errors that abort a governance attempt.
///
/// Parse ambiguity, patch conflicts and policy blocks are NOT errors: they are
/// reported as data (`None`, `ApplyReport::conflicts`, `PolicyVerdict`). Only
/// failures that leave the custody trail or the workspace in an unknown state
/// surface here.
#[derive(Debug, Error)]
pub enum GovernanceError {
    #[error("ledger write failed: {0}")]
    Ledger(#[from] LedgerError),

    #[error("workspace: {0}")]
    Workspace(#[from] PortError),

    #[error("attempt {0} has no snapshots to roll back")]
    NothingToRollBack(String),
}

impl GovernanceError {
    /// Short machine-readable code used in CLI JSON output.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Ledger(_) => "ledger_write_failed",
            Self::Workspace(_) => "workspace_io",
            Self::NothingToRollBack(_) => "nothing_to_roll_back",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_ledger() {
        let err = GovernanceError::Ledger(LedgerError::Key("missing".into()));
        assert_eq!(err.code(), "ledger_write_failed");
    }

    #[test]
    fn code_workspace() {
        let err = GovernanceError::Workspace(PortError::InvalidPath("../x".into()));
        assert_eq!(err.code(), "workspace_io");
    }

    #[test]
    fn display_nothing_to_roll_back() {
        let err = GovernanceError::NothingToRollBack("abc".into());
        assert_eq!(err.to_string(), "attempt abc has no snapshots to roll back");
    }

    #[test]
    fn ledger_error_converts_with_question_mark() {
        fn fail() -> Result<(), GovernanceError> {
            Err(LedgerError::Key("empty signing key".into()))?
        }
        let err = fail().unwrap_err();
        assert_eq!(err.code(), "ledger_write_failed");
        assert_eq!(err.to_string(), "ledger write failed: signing key: empty signing key");
    }
}
