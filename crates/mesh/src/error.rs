use thiserror::Error;

/// Errors surfaced by the signaling transport and peer engine seams.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),

    #[error("signaling channel closed")]
    ChannelClosed,

    /// The inner reconnection loop ran out of attempts. Terminal until the
    /// caller explicitly asks for another round.
    #[error("reconnect attempts exhausted after {attempts} tries")]
    AttemptsExhausted { attempts: u32 },

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("no such peer: {0}")]
    UnknownPeer(String),
}

impl TransportError {
    pub fn setup(err: impl std::fmt::Display) -> Self {
        TransportError::Setup(err.to_string())
    }

    pub fn negotiation(err: impl std::fmt::Display) -> Self {
        TransportError::Negotiation(err.to_string())
    }
}
