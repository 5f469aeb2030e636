//! Server error types.

use std::io;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the server.
///
/// Only framing and authentication failures end a connection. Voice and
/// entity problems are contained where they happen and never show up here.
#[derive(Debug, Error)]
pub enum ServerError {
    /// IO error (socket, capture source, etc.).
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Protocol error (framing, encoding, etc.).
    #[error("Protocol error: {0}")]
    Protocol(#[from] voicesat_protocol::ProtocolError),

    /// Peer sent something other than the expected handshake message.
    #[error("Handshake violation: expected {expected}, got {got}")]
    Handshake {
        expected: &'static str,
        got: &'static str,
    },

    /// Peer presented a wrong password.
    #[error("Authentication failed for {peer}")]
    Auth { peer: String },

    /// Undecodable payload during the handshake.
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// No traffic from the peer within the keepalive timeout.
    #[error("Keepalive timeout after {seconds}s")]
    KeepaliveTimeout { seconds: u64 },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// The satellite task is gone.
    #[error("Satellite task stopped")]
    SatelliteStopped,

    /// Shutdown requested.
    #[error("Server shutdown requested")]
    Shutdown,
}

impl ServerError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an authentication error.
    pub fn auth(peer: impl Into<String>) -> Self {
        Self::Auth { peer: peer.into() }
    }

    /// Creates a handshake violation error.
    pub fn handshake(expected: &'static str, got: &'static str) -> Self {
        Self::Handshake { expected, got }
    }

    /// Returns true when the peer simply went away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            ),
            Self::Protocol(voicesat_protocol::ProtocolError::Io(e)) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            ),
            Self::KeepaliveTimeout { .. } | Self::Shutdown => true,
            _ => false,
        }
    }
}
