//! Orchestrator states and the user-visible status line

use std::fmt;

/// Where the orchestrator is in a synchronization round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Monitoring,
    AwaitingPeerDecision,
    /// Transfer: local state will be pushed back out after the pull
    Pushing,
    /// Overwrite: the peer's state replaces the local tree
    Pulling,
    /// Transfer: restoring the backup over the pulled tree
    Reconciling,
}

/// Status text shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Synchronized,
    GeneratingManifest,
    ApplyingModifications,
    WaitingForReconciliation,
    Offline,
    ErrorApplying,
    RoundIncomplete,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Synchronized => "Synchronized",
            Self::GeneratingManifest => "Generating a new manifest...",
            Self::ApplyingModifications => "Applying modifications...",
            Self::WaitingForReconciliation => "Waiting for reconciliation...",
            Self::Offline => "Offline",
            Self::ErrorApplying => "Error applying changes",
            Self::RoundIncomplete => "Synchronization round did not complete",
        };
        f.write_str(text)
    }
}
