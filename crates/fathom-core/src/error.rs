use thiserror::Error;

pub type DebugResult<T> = Result<T, DebugError>;

/// Error taxonomy shared by the adapters and the session layer. Variants are
/// kinds, not wire types; the protocol crates convert their own errors into
/// these.
#[derive(Debug, Error)]
pub enum DebugError {
    /// Invalid launch configuration: unknown adapter type, undetectable
    /// program type, or a bad program/module combination.
    #[error("{0}")]
    Configuration(String),

    /// A runtime prerequisite is missing (e.g. the debug support library for
    /// the target runtime). The message carries the installation hint.
    #[error("{0}")]
    Prerequisite(String),

    /// The transport to the debug runtime went away.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to reach or keep the transport (port wait, WebSocket open,
    /// discovery).
    #[error("{0}")]
    Transport(String),

    /// The debug runtime reported a request failure.
    #[error("{0}")]
    Protocol(String),

    /// The operation is not legal in the current session state.
    #[error("{0}")]
    State(String),

    /// A bounded wait expired.
    #[error("{0}")]
    Timeout(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
