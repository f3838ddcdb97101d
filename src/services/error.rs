use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Not authenticated")]
    NotAuthenticated,
    #[error("Authentication failed. Please log in again.")]
    Unauthorized,
    #[error("HTTP error! status: {status}")]
    Http { status: u16, body: String },
    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Failed to parse response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Please enter a message or attach a file.")]
    EmptySubmission,
    #[error("Conversation is busy")]
    ConversationBusy,
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Conversation state lock poisoned")]
    LockPoisoned,
}

impl ClientError {
    /// Status code of a non-2xx response, if this error came from one.
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Http { status, .. } => Some(*status),
            ClientError::Unauthorized => Some(401),
            ClientError::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}
