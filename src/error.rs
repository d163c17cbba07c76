//! Error types for the ping-pong client and the negotiation path.

use std::error::Error as StdError;
use thiserror::Error;

/// Boxed error type used for error chaining across module boundaries.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Context wrapper that preserves an optional underlying source error.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ErrorContext {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl ErrorContext {
    /// Create context-only error (no underlying source).
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Create context error with an underlying source.
    pub fn with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Client-side errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    /// The operation did not complete within the configured timeout.
    #[error("Timed out: {0}")]
    TimedOut(String),

    /// The local endpoint closed the connection.
    #[error("Connection locally closed")]
    LocallyClosed,

    /// QUIC/WebTransport level failure while connecting or exchanging data.
    #[error("QUIC error: {0}")]
    Quic(#[source] ErrorContext),

    /// Opening a stream on an established session failed.
    #[error("Failed to open stream: {0}")]
    StreamOpening(#[source] ErrorContext),

    /// The server answered with something other than the expected reply.
    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    /// The server refused the WebTransport session (e.g. bad ticket).
    #[error("Session rejected by server: {0}")]
    Rejected(String),

    /// Registry communication failed.
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Registry had no server matching the query.
    #[error("No servers available for capabilities {0:?}")]
    NoServers(Vec<String>),

    /// Every candidate was tried and failed.
    #[error("Gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[source] ErrorContext),

    /// The negotiation state machine was driven out of order.
    #[error("Invalid negotiation transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },
}

impl ClientError {
    /// Create a QUIC error with preserved source.
    pub fn quic<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Quic(ErrorContext::with_source(message, source))
    }

    /// Create a stream opening error with preserved source.
    pub fn stream_opening<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::StreamOpening(ErrorContext::with_source(message, source))
    }

    /// Create a configuration error with context only.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(ErrorContext::new(message))
    }

    /// Returns true if trying another server (or the same one later) may succeed.
    ///
    /// **Recoverable:** `TimedOut`, `Quic`, `StreamOpening`, `Rejected`,
    /// `UnexpectedReply`, `Discovery`.
    ///
    /// **Non-recoverable:** `Config`, `NoServers`, `Exhausted`,
    /// `InvalidTransition`, `LocallyClosed`.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ClientError::TimedOut(_)
                | ClientError::Quic(_)
                | ClientError::StreamOpening(_)
                | ClientError::Rejected(_)
                | ClientError::UnexpectedReply(_)
                | ClientError::Discovery(_)
        )
    }
}

/// Result type alias for client operations.
pub type ClientResult<T> = Result<T, ClientError>;
