use thiserror::Error;

#[derive(Error, Debug)]
pub enum PilotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDeserialize(#[from] toml::de::Error),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// Lost connection or detached execution context; the attempt can be retried.
    #[error("Transient browser error: {0}")]
    TransientIo(String),

    #[error("CDP error: {0}")]
    Cdp(String),

    #[error("Anti-bot challenge: {detail}")]
    AntiBotChallenge {
        detail: String,
        /// The challenge needs a human (image puzzle, repeated block).
        manual: bool,
    },

    #[error("No response completed after {elapsed_ms}ms")]
    ResponseTimeout { partial: String, elapsed_ms: u64 },

    #[error("Browser session crashed: {0}")]
    SessionCrashed(String),

    #[error("Unparseable tool output: {0}")]
    UnparseableToolOutput(String),

    #[error("Plan parse error: {0}")]
    PlanParse(String),

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Client not initialized")]
    NotInitialized,

    #[error("Cancelled")]
    Cancelled { partial: String },

    #[error("Failed after {attempts} attempts: {last_error}")]
    AttemptsExhausted {
        attempts: u32,
        partial: String,
        last_error: String,
    },

    #[error("Autonomy error: {0}")]
    Autonomy(String),
}

impl PilotError {
    /// Map a raw CDP/WebSocket failure message onto the error kinds the supervisor acts on.
    pub fn classify_cdp(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if lower.contains("websocket not connected")
            || lower.contains("response channel closed")
            || lower.contains("connection closed")
            || lower.contains("broken pipe")
        {
            PilotError::SessionCrashed(message)
        } else if lower.contains("execution context was destroyed")
            || lower.contains("cannot find context")
            || lower.contains("detached")
            || lower.contains("target closed")
            || lower.contains("command timeout")
        {
            PilotError::TransientIo(message)
        } else {
            PilotError::Cdp(message)
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, PilotError::TransientIo(_) | PilotError::Cdp(_))
    }

    /// Text produced before the failure, if any.
    pub fn partial_text(&self) -> Option<&str> {
        match self {
            PilotError::ResponseTimeout { partial, .. }
            | PilotError::Cancelled { partial }
            | PilotError::AttemptsExhausted { partial, .. } => Some(partial.as_str()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PilotError>;
