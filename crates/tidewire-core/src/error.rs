//! Error types for the tidewire broker

use thiserror::Error;

use crate::transport::TransportError;

/// Main error type for broker operations
#[derive(Error, Debug)]
pub enum BrokerError {
    /// `begin_handshake` was called on a connection that already has a receive loop
    #[error("Handshake already started: only one receive loop may be outstanding")]
    HandshakeAlreadyStarted,

    /// No schema is registered under this type name
    #[error("Unknown type: {0}")]
    UnknownType(String),

    /// No open connection has this peer id
    #[error("Unknown connection: {0}")]
    UnknownConnection(u32),

    /// A different schema with the same name is already registered
    #[error("Schema conflict: {0}")]
    SchemaConflict(String),

    /// Transport-level failure (read/write, peer disconnect)
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Message not valid for the current connection state
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// The peer reported an error and closed the connection
    #[error("Peer error ({code}): {text}")]
    PeerError {
        /// Error code sent by the peer
        code: u32,
        /// Error text sent by the peer
        text: String,
    },

    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// The host event loop is no longer running
    #[error("Host stopped")]
    HostStopped,
}

impl BrokerError {
    /// Whether a guest caused this by sending something invalid
    ///
    /// The broker answers these with a notice and keeps the connection;
    /// every other error closes it.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            BrokerError::Protocol(_) | BrokerError::UnknownType(_) | BrokerError::SchemaConflict(_)
        )
    }
}

/// Result type alias using BrokerError
pub type BrokerResult<T> = Result<T, BrokerError>;
