use thiserror::Error;

/// Top-level error type for Knight.
#[derive(Debug, Error)]
pub enum KnightError {
    /// Name resolution failed on every configured resolver.
    #[error("resolution error: {0}")]
    Resolution(String),

    /// Error from the protocol client or its transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// Credential encryption, decryption, or persistence error.
    #[error("credential error: {0}")]
    Credentials(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Error raised inside a chat handler.
    #[error("handler error: {0}")]
    Handler(String),

    /// A lifecycle transition that the state machine does not allow.
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// A connection attempt was requested while another one is live.
    #[error("connection attempt already in progress ({0})")]
    Overlap(String),

    /// The session reached its final state.
    #[error("session terminated")]
    Terminated,

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
