use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one simulation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulationState {
    Initialized,
    Running,
    Paused,
    Completed,
    Terminated,
    Error,
}

impl SimulationState {
    /// Completed, Terminated and Error admit no further transition
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Terminated | Self::Error)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use SimulationState::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Error) => true,
            (Initialized, Running) => true,
            (Running, Paused) | (Paused, Running) => true,
            (Running, Completed) => true,
            (Running | Paused, Terminated) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SimulationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Terminated => "terminated",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::SimulationState::{self, *};
    use rstest::rstest;

    #[rstest]
    #[case(Initialized, Running, true)]
    #[case(Running, Paused, true)]
    #[case(Paused, Running, true)]
    #[case(Running, Completed, true)]
    #[case(Running, Terminated, true)]
    #[case(Paused, Terminated, true)]
    #[case(Initialized, Error, true)]
    #[case(Paused, Error, true)]
    #[case(Initialized, Paused, false)]
    #[case(Initialized, Completed, false)]
    #[case(Paused, Completed, false)]
    #[case(Running, Initialized, false)]
    #[case(Completed, Running, false)]
    #[case(Terminated, Running, false)]
    #[case(Error, Running, false)]
    #[case(Completed, Error, false)]
    #[case(Terminated, Terminated, false)]
    fn test_transitions(
        #[case] from: SimulationState,
        #[case] to: SimulationState,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.can_transition_to(to), allowed, "{from} -> {to}");
    }

    #[rstest]
    #[case(Completed)]
    #[case(Terminated)]
    #[case(Error)]
    fn test_terminal_states(#[case] state: SimulationState) {
        assert!(state.is_terminal());
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(serde_json::to_string(&Paused).unwrap(), "\"paused\"");
    }
}
