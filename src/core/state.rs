use std::fmt;

/// States of the top-level orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrchestratorState {
    New,
    Configured,
    LoadingIndex,
    Standby,
    Querying,
    Error,
}

impl OrchestratorState {
    pub const ALL: [OrchestratorState; 6] = [
        OrchestratorState::New,
        OrchestratorState::Configured,
        OrchestratorState::LoadingIndex,
        OrchestratorState::Standby,
        OrchestratorState::Querying,
        OrchestratorState::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrchestratorState::New => "New",
            OrchestratorState::Configured => "Configured",
            OrchestratorState::LoadingIndex => "LoadingIndex",
            OrchestratorState::Standby => "Standby",
            OrchestratorState::Querying => "Querying",
            OrchestratorState::Error => "Error",
        }
    }
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// States of the vector index lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexState {
    New,
    Loading,
    Loaded,
    Error,
}

impl IndexState {
    pub const ALL: [IndexState; 4] = [
        IndexState::New,
        IndexState::Loading,
        IndexState::Loaded,
        IndexState::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IndexState::New => "New",
            IndexState::Loading => "Loading",
            IndexState::Loaded => "Loaded",
            IndexState::Error => "Error",
        }
    }
}

impl fmt::Display for IndexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Either machine's state, as carried by `Error::InvalidState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MachineState {
    Orchestrator(OrchestratorState),
    Index(IndexState),
}

impl From<OrchestratorState> for MachineState {
    fn from(state: OrchestratorState) -> Self {
        MachineState::Orchestrator(state)
    }
}

impl From<IndexState> for MachineState {
    fn from(state: IndexState) -> Self {
        MachineState::Index(state)
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineState::Orchestrator(s) => s.fmt(f),
            MachineState::Index(s) => s.fmt(f),
        }
    }
}
