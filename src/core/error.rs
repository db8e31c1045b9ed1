use super::state::MachineState;
use super::subscription::SubscriptionId;
use std::collections::BTreeSet;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Operation not allowed in state {state}; allowed states: {}", format_states(.allowed))]
    InvalidState {
        state: MachineState,
        allowed: Vec<MachineState>,
    },

    #[error("Missing config keys: {}", join(.0))]
    MissingConfigComponents(BTreeSet<String>),

    #[error("Missing values for config keys: {}", join(.0))]
    MissingConfigValue(BTreeSet<String>),

    #[error("Invalid value '{value}' for config key '{key}'; allowed: {allowed}")]
    ConfigValue {
        key: String,
        value: String,
        allowed: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No supported files found in: {}", format_paths(.0))]
    NoSupportedFilesInDirectory(Vec<PathBuf>),

    #[error("Loading was cancelled")]
    LoadingCancelled,

    #[error("Callback {0} is not subscribed")]
    NotSubscribed(SubscriptionId),

    #[error("Query must not be empty")]
    EmptyQuery,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Could not extract text: {0}")]
    Extraction(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("HuggingFace API error: {0}")]
    HuggingFace(#[from] hf_hub::api::sync::ApiError),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Service error: {0}")]
    Service(String),
}

impl Error {
    /// Build an `InvalidState` error from any machine's state type.
    pub fn invalid_state<S: Into<MachineState> + Copy>(state: S, allowed: &[S]) -> Self {
        Error::InvalidState {
            state: state.into(),
            allowed: allowed.iter().map(|s| (*s).into()).collect(),
        }
    }
}

fn join(keys: &BTreeSet<String>) -> String {
    keys.iter().cloned().collect::<Vec<_>>().join(", ")
}

fn format_states(states: &[MachineState]) -> String {
    states
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::{IndexState, OrchestratorState};

    #[test]
    fn test_invalid_state_carries_allowed_states() {
        let err = Error::invalid_state(
            OrchestratorState::Querying,
            &[OrchestratorState::Standby, OrchestratorState::New],
        );
        match err {
            Error::InvalidState { state, allowed } => {
                assert_eq!(state, MachineState::Orchestrator(OrchestratorState::Querying));
                assert_eq!(allowed.len(), 2);
                assert!(allowed.contains(&MachineState::Orchestrator(OrchestratorState::Standby)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_error_messages() {
        let err = Error::invalid_state(IndexState::Loading, &[IndexState::New]);
        assert_eq!(
            err.to_string(),
            "Operation not allowed in state Loading; allowed states: New"
        );

        let keys: BTreeSet<String> = ["credential".to_string(), "search_paths".to_string()].into();
        assert_eq!(
            Error::MissingConfigComponents(keys).to_string(),
            "Missing config keys: credential, search_paths"
        );
    }
}
