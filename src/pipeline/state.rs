//! Stage lifecycle state

/// Lifecycle state of a pipeline stage
///
/// A stage is created `Unconfigured`, becomes `Configured` once its filter
/// engine accepted the track parameters, and runs its worker while `Running`.
/// `Stopping` is held while the worker is being joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    /// No filter engine has been configured yet
    Unconfigured,

    /// Engine configured, worker not started
    Configured,

    /// Worker thread is running
    Running,

    /// Shutdown requested, waiting for the worker to exit
    Stopping,

    /// Worker joined; the stage can be reconfigured
    Stopped,
}

impl StageState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &StageState) -> bool {
        use StageState::*;

        match (self, target) {
            (Unconfigured, Configured) => true,

            // Reconfiguring replaces the engine state
            (Configured, Configured) => true,
            (Configured, Unconfigured) => true,
            (Configured, Running) => true,

            (Running, Stopping) => true,

            (Stopping, Stopped) => true,

            (Stopped, Configured) => true,
            (Stopped, Unconfigured) => true,

            (Unconfigured, Unconfigured) => true,

            _ => false,
        }
    }

    /// Get a human-readable description of this state
    pub fn description(&self) -> &'static str {
        match self {
            StageState::Unconfigured => "Unconfigured",
            StageState::Configured => "Configured",
            StageState::Running => "Running",
            StageState::Stopping => "Stopping",
            StageState::Stopped => "Stopped",
        }
    }

    /// Whether `configure` may be called in this state
    pub fn can_configure(&self) -> bool {
        matches!(
            self,
            StageState::Unconfigured | StageState::Configured | StageState::Stopped
        )
    }

    pub fn is_running(&self) -> bool {
        matches!(self, StageState::Running)
    }

    /// Check if the stage is stopped or stopping
    pub fn is_stopped(&self) -> bool {
        matches!(self, StageState::Stopped | StageState::Stopping)
    }
}

impl std::fmt::Display for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}
