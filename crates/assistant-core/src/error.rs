use thiserror::Error;

/// User-facing failures of a conversation turn.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error("no model selected")]
    NoModelSelected,
    #[error("a turn is already in progress for this conversation")]
    TurnInProgress,
    #[error("connection to the inference engine was lost")]
    ConnectionLost,
    #[error("inference engine refused the connection")]
    ConnectionRefused,
    #[error("inference engine timed out")]
    Timeout,
    #[error("tool loop exceeded {0} rounds")]
    ToolRoundLimit(usize),
    #[error("{0}")]
    Unknown(String),
}

const CONNECTION_LOST_SIGNATURES: &[&str] = &[
    "econnreset",
    "connection reset",
    "socket hang up",
    "hang up",
    "broken pipe",
    "connection closed",
];
const CONNECTION_REFUSED_SIGNATURES: &[&str] = &["econnrefused", "connection refused"];
const TIMEOUT_SIGNATURES: &[&str] = &["etimedout", "timed out", "timeout"];

impl ChatError {
    /// Maps a transport failure message onto one of the user-facing
    /// categories. Unrecognised messages pass through untouched.
    pub fn classify(message: &str) -> Self {
        let lowered = message.to_ascii_lowercase();
        let matches = |signatures: &[&str]| signatures.iter().any(|sig| lowered.contains(sig));

        if matches(CONNECTION_LOST_SIGNATURES) {
            ChatError::ConnectionLost
        } else if matches(CONNECTION_REFUSED_SIGNATURES) {
            ChatError::ConnectionRefused
        } else if matches(TIMEOUT_SIGNATURES) {
            ChatError::Timeout
        } else {
            ChatError::Unknown(message.to_string())
        }
    }

    /// Text written into the conversation and the store's `error` field.
    pub fn user_message(&self) -> String {
        match self {
            ChatError::NoModelSelected => {
                "No model selected. Choose a model before sending a message.".to_string()
            }
            ChatError::TurnInProgress => {
                "Please wait for the current response to finish.".to_string()
            }
            ChatError::ConnectionLost => {
                "The connection to the model was lost. Please try again.".to_string()
            }
            ChatError::ConnectionRefused => {
                "Could not connect to the model server. Make sure it is running.".to_string()
            }
            ChatError::Timeout => {
                "The model took too long to respond. Try again or reduce the amount of context."
                    .to_string()
            }
            ChatError::ToolRoundLimit(limit) => format!(
                "Stopped after {limit} rounds of tool calls without a final answer."
            ),
            ChatError::Unknown(raw) => format!("Error: {raw}"),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChatError::ConnectionLost | ChatError::ConnectionRefused | ChatError::Timeout
        )
    }
}
