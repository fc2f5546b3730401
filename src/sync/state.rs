/// Lifecycle of the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    NotStarted,
    Connecting,
    Watching,
    Processing,
    Stopping,
    Stopped,
}

impl OrchestratorState {
    /// Whether `self -> next` is an edge of the lifecycle.
    ///
    /// `Connecting -> Stopped` covers a failed start and `Watching -> Stopped`
    /// covers the change stream ending on its own.
    pub fn can_transition_to(self, next: OrchestratorState) -> bool {
        use OrchestratorState::*;
        matches!(
            (self, next),
            (NotStarted, Connecting)
                | (Connecting, Watching)
                | (Connecting, Stopped)
                | (Watching, Processing)
                | (Processing, Watching)
                | (Watching, Stopping)
                | (Processing, Stopping)
                | (Connecting, Stopping)
                | (Watching, Stopped)
                | (Stopping, Stopped)
        )
    }

    pub fn is_running(self) -> bool {
        matches!(self, OrchestratorState::Watching | OrchestratorState::Processing)
    }
}

impl std::fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OrchestratorState::NotStarted => "not_started",
            OrchestratorState::Connecting => "connecting",
            OrchestratorState::Watching => "watching",
            OrchestratorState::Processing => "processing",
            OrchestratorState::Stopping => "stopping",
            OrchestratorState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}
